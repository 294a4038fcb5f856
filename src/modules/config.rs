use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::modules::db::SqliteKvStore;
use crate::modules::kv::{KvStore, MemoryKvStore};
use crate::proxy::config::{ProxyConfig, StoreConfig};

const DATA_DIR: &str = ".gemini_oauth_proxy";
const CONFIG_FILE: &str = "config.json";
const CACHE_DB_FILE: &str = "cache.db";

/// Get data directory path
pub fn get_data_dir() -> AppResult<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| AppError::Config("Failed to get user home directory".to_string()))?;
    let data_dir = home.join(DATA_DIR);

    // Ensure directory exists
    if !data_dir.exists() {
        fs::create_dir_all(&data_dir)?;
    }

    Ok(data_dir)
}

/// Credential file written by the Gemini CLI login flow
pub fn default_credentials_path() -> AppResult<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| AppError::Config("Failed to get user home directory".to_string()))?;
    Ok(home.join(".gemini").join("oauth_creds.json"))
}

/// Load proxy config.
///
/// An explicit path must exist; the default `<data_dir>/config.json` is
/// optional. Environment overrides are applied last.
pub fn load_config(path: Option<&Path>) -> AppResult<ProxyConfig> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => get_data_dir()?.join(CONFIG_FILE),
    };

    let mut config = if config_path.exists() {
        let content = fs::read_to_string(&config_path)?;
        serde_json::from_str(&content).map_err(|e| {
            AppError::Config(format!("Failed to parse config file {:?}: {}", config_path, e))
        })?
    } else if path.is_some() {
        return Err(AppError::Config(format!(
            "Config file not found: {:?}",
            config_path
        )));
    } else {
        ProxyConfig::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Apply environment overrides through `lookup` (empty values are ignored)
pub fn apply_env_overrides<F>(config: &mut ProxyConfig, lookup: F) -> AppResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(project) = get("GEMINI_PROJECT_ID").or_else(|| get("GOOGLE_CLOUD_PROJECT")) {
        config.project.project_id = Some(project);
    }
    if let Some(client_id) = get("GEMINI_OAUTH_CLIENT_ID") {
        config.oauth_client_id = Some(client_id);
    }
    if let Some(client_secret) = get("GEMINI_OAUTH_CLIENT_SECRET") {
        config.oauth_client_secret = Some(client_secret);
    }
    if let Some(creds) = get("GEMINI_OAUTH_CREDS") {
        config.credentials_path = Some(PathBuf::from(creds));
    }
    if let Some(port) = get("PROXY_PORT") {
        config.port = port
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("Invalid PROXY_PORT: {}", port)))?;
    }
    Ok(())
}

/// Build the configured durable store
pub fn open_store(store: &StoreConfig) -> AppResult<Arc<dyn KvStore>> {
    match store {
        StoreConfig::Memory => {
            tracing::info!("Using in-memory cache store");
            Ok(Arc::new(MemoryKvStore::new()))
        }
        StoreConfig::Sqlite { path } => {
            let path = match path {
                Some(p) => p.clone(),
                None => get_data_dir()?.join(CACHE_DB_FILE),
            };
            tracing::info!("Using SQLite cache store at {:?}", path);
            Ok(Arc::new(SqliteKvStore::open(&path)?))
        }
    }
}
