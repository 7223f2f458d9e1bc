//! SeaTable HTTP client.
//!
//! Authentication is two-step: a long-lived base API token (from the
//! environment) is exchanged for a short-lived base access token, which is
//! then used against the dtable-server and dtable-db endpoints. Access
//! tokens are cached per API token and refreshed well before their three-day
//! expiry.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::config::{SeaTableAuth, TableRef};

/// SeaTable caps SQL result pages at 10000 rows.
const PAGE_SIZE: usize = 10_000;

/// Re-exchange the API token after this many hours; actual expiry is 3 days.
const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
struct AppAccessTokenResponse {
    access_token: String,
    dtable_uuid: String,
    dtable_server: String,
}

#[derive(Debug, Clone)]
struct BaseAccess {
    access_token: String,
    dtable_uuid: String,
    dtable_server: Url,
    obtained: DateTime<Utc>,
}

impl BaseAccess {
    fn is_fresh(&self) -> bool {
        Utc::now() - self.obtained < chrono::Duration::hours(TOKEN_TTL_HOURS)
    }
}

pub struct SeaTableClient {
    http: reqwest::Client,
    server: Url,
    default_token: String,
    /// Access tokens keyed by the env var that supplied the API token.
    bases: RwLock<HashMap<String, BaseAccess>>,
}

impl SeaTableClient {
    pub fn new(auth: &SeaTableAuth) -> Result<Self> {
        let server = Url::parse(&auth.server)
            .with_context(|| format!("Invalid SEATABLE_SERVER url '{}'", auth.server))?;
        let http = reqwest::Client::builder()
            .user_agent("transform-service/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            server,
            default_token: auth.default_token.clone(),
            bases: RwLock::new(HashMap::new()),
        })
    }

    fn api_token(&self, table: &TableRef) -> Result<(String, String)> {
        match &table.token_env {
            Some(env) => {
                let token = std::env::var(env)
                    .with_context(|| format!("Env var {} is not set", env))?;
                Ok((env.clone(), token))
            }
            None => Ok(("SEATABLE_TOKEN".to_string(), self.default_token.clone())),
        }
    }

    /// Resolve (and cache) base access for a table.
    async fn base_access(&self, table: &TableRef) -> Result<BaseAccess> {
        let (cache_key, api_token) = self.api_token(table)?;

        {
            let bases = self.bases.read().await;
            if let Some(access) = bases.get(&cache_key) {
                if access.is_fresh() {
                    return Ok(access.clone());
                }
            }
        }

        info!("Exchanging SeaTable API token for base '{}'", table.base);
        let url = self.server.join("/api/v2.1/dtable/app-access-token/")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", format!("Token {}", api_token))
            .send()
            .await
            .context("SeaTable token exchange request failed")?;

        if !response.status().is_success() {
            bail!(
                "SeaTable token exchange failed with status {} for base '{}'",
                response.status(),
                table.base
            );
        }

        let body: AppAccessTokenResponse = response
            .json()
            .await
            .context("Failed to parse SeaTable token response")?;

        // Url::join treats the last path segment as a file without this
        let mut dtable_server = body.dtable_server;
        if !dtable_server.ends_with('/') {
            dtable_server.push('/');
        }

        let access = BaseAccess {
            access_token: body.access_token,
            dtable_uuid: body.dtable_uuid,
            dtable_server: Url::parse(&dtable_server)
                .context("Invalid dtable_server url in token response")?,
            obtained: Utc::now(),
        };

        let mut bases = self.bases.write().await;
        bases.insert(cache_key, access.clone());
        Ok(access)
    }

    /// Column names of a table.
    pub async fn table_columns(&self, table: &TableRef) -> Result<Vec<String>> {
        let access = self.base_access(table).await?;
        let url = access.dtable_server.join(&format!(
            "api/v1/dtables/{}/metadata/",
            access.dtable_uuid
        ))?;

        let response = self
            .http
            .get(url)
            .header("Authorization", format!("Token {}", access.access_token))
            .send()
            .await
            .context("SeaTable metadata request failed")?;

        if !response.status().is_success() {
            bail!(
                "SeaTable metadata request failed with status {}",
                response.status()
            );
        }

        let body: Value = response.json().await?;
        let tables = body["metadata"]["tables"]
            .as_array()
            .ok_or_else(|| anyhow!("Malformed metadata response"))?;

        let table_meta = tables
            .iter()
            .find(|t| t["name"].as_str() == Some(table.table.as_str()))
            .ok_or_else(|| {
                anyhow!(
                    "Table '{}' not found in base '{}'",
                    table.table,
                    table.base
                )
            })?;

        let columns = table_meta["columns"]
            .as_array()
            .ok_or_else(|| anyhow!("Malformed column metadata"))?
            .iter()
            .filter_map(|c| c["name"].as_str().map(String::from))
            .collect();

        Ok(columns)
    }

    /// Fetch the given columns of every row, paging through the SQL endpoint.
    pub async fn fetch_rows(
        &self,
        table: &TableRef,
        columns: &[String],
    ) -> Result<Vec<Map<String, Value>>> {
        let access = self.base_access(table).await?;
        let url = self
            .server
            .join(&format!("/dtable-db/api/v1/query/{}/", access.dtable_uuid))?;

        let column_list = columns
            .iter()
            .map(|c| format!("`{}`", c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let sql = format!(
                "SELECT {} FROM `{}` LIMIT {} OFFSET {}",
                column_list, table.table, PAGE_SIZE, offset
            );
            debug!("SeaTable SQL: {}", sql);

            let response = self
                .http
                .post(url.clone())
                .header("Authorization", format!("Token {}", access.access_token))
                .json(&json!({ "sql": sql, "convert_keys": true }))
                .send()
                .await
                .context("SeaTable SQL request failed")?;

            if !response.status().is_success() {
                bail!(
                    "SeaTable SQL query failed with status {}: {:?}",
                    response.status(),
                    response.text().await.ok()
                );
            }

            let body: Value = response.json().await?;
            if body["success"].as_bool() == Some(false) {
                bail!(
                    "SeaTable SQL query rejected: {}",
                    body["error_message"].as_str().unwrap_or("unknown error")
                );
            }

            let page = body["results"]
                .as_array()
                .ok_or_else(|| anyhow!("Malformed SQL response"))?;

            let page_len = page.len();
            rows.extend(
                page.iter()
                    .filter_map(|r| r.as_object().cloned()),
            );

            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }

        debug!(
            "Fetched {} rows from {}/{}",
            rows.len(),
            table.base,
            table.table
        );
        Ok(rows)
    }
}
