//! SeaTable ("FlyTable") access.

pub mod client;

pub use client::SeaTableClient;
