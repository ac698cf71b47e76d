//! Process configuration: remote endpoint credentials and filesystem paths.
//!
//! The endpoint URL and access key come from the environment at startup.
//! Their absence is fatal; everything else has a default.

use std::path::PathBuf;
use tracing::info;

use crate::error::{SyncError, ValidationError};

const ENV_URL: &[&str] = &["SUPABASE_URL", "NEXT_PUBLIC_SUPABASE_URL"];
const ENV_ANON_KEY: &[&str] = &["SUPABASE_ANON_KEY", "NEXT_PUBLIC_SUPABASE_ANON_KEY"];
const ENV_DATA_DIR: &str = "ORDER_SHEET_DATA_DIR";

const APP_DIR_NAME: &str = "com.ordersheet.app";

/// Hosted service endpoint and anonymous access key.
#[derive(Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub anon_key: String,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("anon_key", &"<redacted>")
            .finish()
    }
}

impl RemoteConfig {
    pub fn new(url: &str, anon_key: &str) -> Result<Self, SyncError> {
        let url = normalize_service_url(url);
        if url.is_empty() {
            return Err(SyncError::MissingConfiguration("service URL".into()));
        }
        let anon_key = anon_key.trim();
        if anon_key.is_empty() {
            return Err(SyncError::MissingConfiguration("service access key".into()));
        }
        Ok(Self {
            url,
            anon_key: anon_key.to_string(),
        })
    }

    /// Read `SUPABASE_URL` / `SUPABASE_ANON_KEY` (or their
    /// `NEXT_PUBLIC_` aliases).
    pub fn from_env() -> Result<Self, SyncError> {
        let url = first_env(ENV_URL).ok_or_else(|| {
            SyncError::MissingConfiguration(format!("set {}", ENV_URL.join(" or ")))
        })?;
        let key = first_env(ENV_ANON_KEY).ok_or_else(|| {
            SyncError::MissingConfiguration(format!("set {}", ENV_ANON_KEY.join(" or ")))
        })?;
        let config = Self::new(&url, &key)?;
        info!(url = %config.url, "remote service configured");
        Ok(config)
    }

    /// PostgREST base, e.g. `https://xyz.supabase.co/rest/v1`.
    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.url)
    }

    /// Realtime websocket endpoint with the access key in the query.
    pub fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.url.clone()
        };
        format!(
            "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.anon_key
        )
    }
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// Normalise the service URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_service_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Where the local store and logs live.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl AppPaths {
    pub fn from_env() -> Self {
        let data_dir = std::env::var(ENV_DATA_DIR)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_base_dir().join(APP_DIR_NAME));
        Self::at(data_dir)
    }

    pub fn at(data_dir: PathBuf) -> Self {
        let log_dir = data_dir.join("logs");
        Self { data_dir, log_dir }
    }
}

fn default_base_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .or_else(|_| std::env::var("LOCALAPPDATA"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        })
}

// ---------------------------------------------------------------------------
// Settings form validation
// ---------------------------------------------------------------------------

/// Validate the settings form. Returns the trimmed staff list to store.
///
/// `endpoint_url` is optional; when given it must be HTTPS.
pub fn validate_settings_input(
    staff_list: &str,
    endpoint_url: Option<&str>,
) -> Result<String, Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Some(url) = endpoint_url.map(str::trim).filter(|u| !u.is_empty()) {
        if !url.starts_with("https://") {
            errors.push(ValidationError::InsecureUrl);
        }
    }

    let staff = staff_list.trim();
    if staff.split(',').all(|name| name.trim().is_empty()) {
        errors.push(ValidationError::EmptyStaffList);
    }

    if errors.is_empty() {
        Ok(staff.to_string())
    } else {
        Err(errors)
    }
}
