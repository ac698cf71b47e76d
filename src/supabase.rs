//! Hosted store client.
//!
//! Talks to the PostgREST endpoint (`/rest/v1`) of the hosted database using
//! the anonymous key. Every failure is classified into [`SyncError`] so the
//! sync client can turn it into a status signal.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::error::SyncError;
use crate::models::Order;
use crate::remote::{OrderRow, RemoteStore, StoreDataRow};

/// Default timeout for REST requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

const ORDERS_TABLE: &str = "orders";
const STORE_DATA_TABLE: &str = "store_data";
const ORDERS_CONFLICT_TARGET: &str = "date,vendor,item,store_id";
const UPSERT_PREFER: &str = "resolution=merge-duplicates,return=minimal";

pub struct SupabaseClient {
    rest_url: String,
    anon_key: String,
    http: Client,
}

impl SupabaseClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, SyncError> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            rest_url: config.rest_url(),
            anon_key: config.anon_key.clone(),
            http,
        })
    }

    fn table_url(&self, table: &str, params: &[(&str, String)]) -> Result<Url, SyncError> {
        let mut url = Url::parse(&format!("{}/{table}", self.rest_url))
            .map_err(|e| SyncError::MissingConfiguration(format!("Invalid service URL: {e}")))?;
        {
            let mut qp = url.query_pairs_mut();
            for (k, v) in params {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
            .header("Content-Type", "application/json")
    }

    /// Send a request and return the response body text on 2xx.
    async fn send(&self, req: RequestBuilder, what: &str) -> Result<String, SyncError> {
        let resp = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| friendly_error(&self.rest_url, &e))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let message = rejection_detail(status, &body);
            warn!(request = what, status = status.as_u16(), %message, "remote request rejected");
            return Err(SyncError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        debug!(request = what, status = status.as_u16(), "remote request ok");
        Ok(body)
    }
}

#[async_trait]
impl RemoteStore for SupabaseClient {
    async fn select_orders(&self, date: &str, store_id: &str) -> Result<Vec<Order>, SyncError> {
        let url = self.table_url(
            ORDERS_TABLE,
            &[
                ("select", "*".to_string()),
                ("date", format!("eq.{date}")),
                ("store_id", format!("eq.{store_id}")),
                ("order", "vendor.asc,item.asc".to_string()),
            ],
        )?;
        let body = self.send(self.http.get(url), "select_orders").await?;
        parse_rows(&body)
    }

    async fn upsert_order(&self, row: &OrderRow) -> Result<(), SyncError> {
        let url = self.table_url(
            ORDERS_TABLE,
            &[("on_conflict", ORDERS_CONFLICT_TARGET.to_string())],
        )?;
        let req = self
            .http
            .post(url)
            .header("Prefer", UPSERT_PREFER)
            .json(row);
        self.send(req, "upsert_order").await.map(|_| ())
    }

    async fn delete_order(&self, id: &str) -> Result<(), SyncError> {
        let url = self.table_url(ORDERS_TABLE, &[("id", format!("eq.{id}"))])?;
        self.send(self.http.delete(url), "delete_order")
            .await
            .map(|_| ())
    }

    async fn fetch_store_data(&self, store_id: &str) -> Result<Option<StoreDataRow>, SyncError> {
        let url = self.table_url(
            STORE_DATA_TABLE,
            &[
                ("select", "store_id,master,config,updated_at".to_string()),
                ("store_id", format!("eq.{store_id}")),
                ("limit", "1".to_string()),
            ],
        )?;
        let body = self.send(self.http.get(url), "fetch_store_data").await?;
        let rows: Vec<StoreDataRow> = parse_rows(&body)?;
        Ok(rows.into_iter().next())
    }

    async fn upsert_store_data(&self, row: &StoreDataRow) -> Result<(), SyncError> {
        let url = self.table_url(STORE_DATA_TABLE, &[("on_conflict", "store_id".to_string())])?;
        let req = self
            .http
            .post(url)
            .header("Prefer", UPSERT_PREFER)
            .json(row);
        self.send(req, "upsert_store_data").await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Response handling
// ---------------------------------------------------------------------------

fn parse_rows<T: serde::de::DeserializeOwned>(body: &str) -> Result<Vec<T>, SyncError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(body).map_err(|e| SyncError::Parse(format!("Invalid JSON from service: {e}")))
}

/// Convert a `reqwest::Error` into a network failure with a readable message.
fn friendly_error(url: &str, err: &reqwest::Error) -> SyncError {
    if err.is_connect() {
        return SyncError::Network(format!("Cannot reach service at {url}"));
    }
    if err.is_timeout() {
        return SyncError::Network(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return SyncError::MissingConfiguration(format!("Invalid service URL: {url}"));
    }
    SyncError::Network(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a fallback message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Access key is invalid or expired".to_string(),
        403 => "Access denied by row-level security".to_string(),
        404 => "Table or endpoint not found".to_string(),
        409 => "Write conflicts with an existing row".to_string(),
        s if s >= 500 => format!("Service error (HTTP {s})"),
        s => format!("Unexpected response (HTTP {s})"),
    }
}

/// Prefer the service's own `message`/`details`, keep the raw body otherwise.
fn rejection_detail(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let message = json
            .get("message")
            .or_else(|| json.get("error"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| status_error(status));
        return match json.get("details").and_then(Value::as_str) {
            Some(details) if !details.is_empty() => format!("{message}: {details}"),
            _ => message,
        };
    }
    if body.is_empty() {
        status_error(status)
    } else {
        format!("{}: {body}", status_error(status))
    }
}
