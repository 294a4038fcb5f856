use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::info;

use gemini_oauth_proxy::modules::{config, logger, oauth};
use gemini_oauth_proxy::proxy::{AppState, AxumServer, ProxyConfig};

#[derive(Parser)]
#[command(name = "gemini-oauth-proxy", version, about)]
struct Cli {
    /// Config file (defaults to ~/.gemini_oauth_proxy/config.json)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Bind host, overrides `allow_lan_access`
    #[arg(long)]
    host: Option<String>,
    #[arg(long, env = "PROXY_PORT")]
    port: Option<u16>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("gemini-oauth-proxy failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut proxy_config = config::load_config(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        proxy_config.port = port;
    }

    let log_dir = match cli.log_dir {
        Some(dir) => dir,
        None => logger::default_log_dir()?,
    };
    logger::init_logger(&log_dir)?;

    let creds_path = match proxy_config.credentials_path.clone() {
        Some(path) => path,
        None => config::default_credentials_path()?,
    };
    let credentials = oauth::OAuthCredentials::load(&creds_path)
        .with_context(|| format!("loading OAuth credentials from {:?}", creds_path))?;
    info!("Loaded OAuth credentials from {:?}", creds_path);

    let endpoint = token_endpoint(&proxy_config, &credentials)?;
    let store = config::open_store(&proxy_config.store)?;

    let host = cli
        .host
        .unwrap_or_else(|| proxy_config.get_bind_address().to_string());
    let port = proxy_config.port;
    let state = AppState::new(proxy_config, credentials, endpoint, store)?;

    let (server, handle) = AxumServer::start(&host, port, state)
        .await
        .map_err(|e| anyhow!(e))?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    server.stop();
    let _ = handle.await;
    Ok(())
}

/// The credential file's own client wins over configured values
fn token_endpoint(
    proxy_config: &ProxyConfig,
    credentials: &oauth::OAuthCredentials,
) -> anyhow::Result<Arc<dyn oauth::TokenEndpoint>> {
    let client_id = credentials
        .client_id
        .clone()
        .or_else(|| proxy_config.oauth_client_id.clone())
        .ok_or_else(|| {
            anyhow!("no OAuth client id: set oauth_client_id or GEMINI_OAUTH_CLIENT_ID")
        })?;
    let client_secret = credentials
        .client_secret
        .clone()
        .or_else(|| proxy_config.oauth_client_secret.clone())
        .ok_or_else(|| {
            anyhow!("no OAuth client secret: set oauth_client_secret or GEMINI_OAUTH_CLIENT_SECRET")
        })?;

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    Ok(Arc::new(oauth::GoogleTokenEndpoint::new(
        http,
        client_id,
        client_secret,
    )))
}
