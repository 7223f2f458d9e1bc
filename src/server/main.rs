//! HTTP server for the transform service.
//!
//! Serves point queries and coordinate transforms over chunked volumes, and
//! neuroglancer segment properties compiled from SeaTable.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use transform_service::annotations;
use transform_service::config::{Config, SeaTableAuth};
use transform_service::models::binary::{decode_points, encode_displacements};
use transform_service::models::{BinaryFormat, ColumnPointList, MappedPoint, PointList};
use transform_service::query;
use transform_service::seatable::SeaTableClient;
use transform_service::volume::VolumeCatalog;
use transform_service::ServiceError;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Transform service HTTP server")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Datasource config file
    #[arg(short, long, default_value = "datasources.toml")]
    config: std::path::PathBuf,

    /// Route prefix when running behind a reverse proxy
    /// (e.g. /transform-service)
    #[arg(long)]
    root_path: Option<String>,
}

/// Application state shared across handlers
struct AppState {
    catalog: Arc<VolumeCatalog>,
    seatable: Option<SeaTableClient>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    info!("Transform Service");
    let config = Config::load_from_file(&args.config)?;
    info!(
        "Loaded {} datasource(s) and {} annotation dataset(s) from {}",
        config.datasources.len(),
        config.annotations.len(),
        args.config.display()
    );

    let seatable = if config.annotations.is_empty() {
        None
    } else {
        let auth = SeaTableAuth::from_env().ok_or_else(|| {
            anyhow::anyhow!(
                "SEATABLE_SERVER and SEATABLE_TOKEN must be set when annotation \
                 datasets are configured"
            )
        })?;
        info!("SeaTable backend: {}", auth.server);
        Some(SeaTableClient::new(&auth)?)
    };

    let catalog = Arc::new(VolumeCatalog::new(config)?);

    let state = Arc::new(AppState { catalog, seatable });

    // Build router
    let mut app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/info/", get(info_handler))
        .route(
            "/transform/dataset/{dataset}/s/{scale}/values",
            post(transform_values_handler),
        )
        .route(
            "/transform/dataset/{dataset}/s/{scale}/values_binary/format/{format}",
            post(transform_values_binary_handler),
        )
        .route(
            "/query/dataset/{dataset}/s/{scale}/values_array",
            post(query_values_array_handler),
        )
        .route(
            "/query/dataset/{dataset}/s/{scale}/values_array_string_response",
            post(query_values_array_string_handler),
        )
        .route(
            "/query/dataset/{dataset}/s/{scale}/cloud_volume_server",
            post(query_cloud_volume_server_handler),
        )
        .route(
            "/query/dataset/{dataset}/s/{scale}/values_binary/format/{format}",
            post(query_values_binary_handler),
        )
        .route(
            "/segmentation_annotations/{dataset}/{version}/{labels}/info",
            get(segmentation_annotations_handler),
        )
        .route(
            "/segmentation_annotations/{dataset}/{version}/{labels}/{tags}/info",
            get(segmentation_annotations_tags_handler),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // nginx adds the prefix to all routes in production
    if let Some(prefix) = &args.root_path {
        app = Router::new().nest(prefix, app);
    }

    info!("Starting server on {}", args.listen);
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Map a service error onto an HTTP response tuple.
fn err_response(e: ServiceError) -> (StatusCode, String) {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!("Request failed: {:#}", e);
    }
    (status, e.to_string())
}

/// Run a volume query on the blocking pool.
async fn run_query<T, F>(f: F) -> Result<T, (StatusCode, String)>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Query task failed: {}", e),
            )
        })?
        .map_err(err_response)
}

async fn root_handler() -> Json<Value> {
    Json(json!({
        "service": "transform-service",
        "description": "Look up values (segment IDs, displacement vectors) at \
                        3D points in chunked volumes, and compile neuroglancer \
                        segment properties from FlyTable. Query units are \
                        full-resolution pixels (mip 0).",
        "endpoints": [
            "/info/",
            "/transform/dataset/{dataset}/s/{scale}/values",
            "/transform/dataset/{dataset}/s/{scale}/values_binary/format/{format}",
            "/query/dataset/{dataset}/s/{scale}/values_array",
            "/query/dataset/{dataset}/s/{scale}/values_array_string_response",
            "/query/dataset/{dataset}/s/{scale}/cloud_volume_server",
            "/query/dataset/{dataset}/s/{scale}/values_binary/format/{format}",
            "/segmentation_annotations/{dataset}/{version}/{labels}/info",
            "/segmentation_annotations/{dataset}/{version}/{labels}/{tags}/info",
        ],
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "datasources": state.catalog.config().datasources.len(),
        "seatable": state.seatable.is_some(),
    }))
}

/// Retrieve a list of available datasources.
async fn info_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut datasets = serde_json::Map::new();
    for (name, ds) in &state.catalog.config().datasources {
        datasets.insert(
            name.clone(),
            json!({
                "scales": ds.scales,
                "voxel_size": ds.voxel_size,
                "description": ds.description,
            }),
        );
    }
    Json(Value::Object(datasets))
}

/// Return dx, dy and new coordinates for an input set of locations.
async fn transform_values_handler(
    State(state): State<Arc<AppState>>,
    Path((dataset, scale)): Path<(String, u32)>,
    Json(data): Json<PointList>,
) -> Result<Json<Vec<MappedPoint>>, (StatusCode, String)> {
    let catalog = Arc::clone(&state.catalog);
    let mapped =
        run_query(move || query::map_points(&catalog, &dataset, scale, &data.locations)).await?;
    Ok(Json(mapped))
}

/// Raw binary transform: body is N little-endian float32 (x, y, z) points,
/// response holds only dx and dy, 2xN or Nx2 to match the request layout.
async fn transform_values_binary_handler(
    State(state): State<Arc<AppState>>,
    Path((dataset, scale, format)): Path<(String, u32, BinaryFormat)>,
    body: Bytes,
) -> Result<Response, (StatusCode, String)> {
    let points = decode_points(&body, format).map_err(err_response)?;

    let catalog = Arc::clone(&state.catalog);
    let mapped = run_query(move || query::map_points(&catalog, &dataset, scale, &points)).await?;

    let payload = encode_displacements(&mapped, format);
    Ok(octet_stream(payload))
}

/// Return values at the given locations as columnar arrays of numbers.
/// Error values are null, not NaN.
async fn query_values_array_handler(
    State(state): State<Arc<AppState>>,
    Path((dataset, scale)): Path<(String, u32)>,
    Json(locs): Json<ColumnPointList>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let points = locs.into_points();
    let catalog = Arc::clone(&state.catalog);
    let field = run_query(move || query::query_points(&catalog, &dataset, scale, &points)).await?;

    // One list per channel, each of length N
    let values: Vec<Vec<Value>> = (0..field.width)
        .map(|c| {
            (0..field.num_points())
                .map(|i| field.values.json_at(field.idx(i, c)))
                .collect()
        })
        .collect();

    Ok(Json(json!({ "values": values })))
}

/// Like values_array, but every value is a string for easier parsing in R.
async fn query_values_array_string_handler(
    State(state): State<Arc<AppState>>,
    Path((dataset, scale)): Path<(String, u32)>,
    Json(locs): Json<ColumnPointList>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let points = locs.into_points();
    let catalog = Arc::clone(&state.catalog);
    let field = run_query(move || query::query_points(&catalog, &dataset, scale, &points)).await?;

    let values: Vec<Vec<String>> = (0..field.width)
        .map(|c| {
            (0..field.num_points())
                .map(|i| field.values.string_at(field.idx(i, c)))
                .collect()
        })
        .collect();

    Ok(Json(json!({ "values": values })))
}

/// Implements the CloudVolumeServer API: a flat list of stringified values.
async fn query_cloud_volume_server_handler(
    State(state): State<Arc<AppState>>,
    Path((dataset, scale)): Path<(String, u32)>,
    Json(data): Json<PointList>,
) -> Result<Json<Vec<String>>, (StatusCode, String)> {
    let catalog = Arc::clone(&state.catalog);
    let field =
        run_query(move || query::query_points(&catalog, &dataset, scale, &data.locations)).await?;

    let values = (0..field.values.len())
        .map(|i| field.values.string_at(i))
        .collect();
    Ok(Json(values))
}

/// Raw binary query: response holds the values in the datasource's native
/// dtype, channel-major for 3xN requests and point-major for Nx3.
async fn query_values_binary_handler(
    State(state): State<Arc<AppState>>,
    Path((dataset, scale, format)): Path<(String, u32, BinaryFormat)>,
    body: Bytes,
) -> Result<Response, (StatusCode, String)> {
    let points = decode_points(&body, format).map_err(err_response)?;

    let catalog = Arc::clone(&state.catalog);
    let field = run_query(move || query::query_points(&catalog, &dataset, scale, &points)).await?;

    Ok(octet_stream(field.to_le_bytes(format.channel_major())))
}

/// Generate segmentation properties from FlyTable.
async fn segmentation_annotations_handler(
    State(state): State<Arc<AppState>>,
    Path((dataset, version, labels)): Path<(String, String, String)>,
) -> Result<Json<Value>, (StatusCode, String)> {
    compile_annotations(&state, &dataset, &version, &labels, None).await
}

async fn segmentation_annotations_tags_handler(
    State(state): State<Arc<AppState>>,
    Path((dataset, version, labels, tags)): Path<(String, String, String, String)>,
) -> Result<Json<Value>, (StatusCode, String)> {
    compile_annotations(&state, &dataset, &version, &labels, Some(&tags)).await
}

async fn compile_annotations(
    state: &AppState,
    dataset: &str,
    version: &str,
    labels: &str,
    tags: Option<&str>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let config = state.catalog.config();
    let ds = config.annotations.get(dataset).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!(
                "Dataset {} not found. Available datasets: {:?}",
                dataset,
                config.annotations.keys().collect::<Vec<_>>()
            ),
        )
    })?;

    let client = state.seatable.as_ref().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "SeaTable client is not configured".to_string(),
        )
    })?;

    let info = annotations::segmentation_properties(client, dataset, ds, version, labels, tags)
        .await
        .map_err(err_response)?;
    Ok(Json(info))
}

fn octet_stream(payload: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        payload,
    )
        .into_response()
}
