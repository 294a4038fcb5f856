use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::proxy::common::{CircuitBreakerConfig, RetryConfig};
use crate::proxy::project_resolver::ProjectConfig;
use crate::proxy::token_manager::TokenConfig;
use crate::proxy::upstream::client::CODE_ASSIST_ENDPOINT;
use crate::proxy::upstream::pool::PoolConfig;

/// 反代服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// 是否允许局域网访问
    /// - false: 仅本机访问 127.0.0.1（默认，隐私优先）
    /// - true: 允许局域网访问 0.0.0.0
    pub allow_lan_access: bool,

    /// 监听端口
    pub port: u16,

    /// Code Assist base URL
    pub upstream_base_url: String,

    /// OAuth credential file (`oauth_creds.json` shape)
    pub credentials_path: Option<PathBuf>,

    /// OAuth client used for refresh; the credential file may override both
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,

    pub token: TokenConfig,
    pub project: ProjectConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub pool: PoolConfig,
    pub store: StoreConfig,

    /// 上游代理配置
    pub upstream_proxy: UpstreamProxyConfig,

    /// 自定义精确模型映射表 (key: 原始模型名, value: 目标模型名)
    pub model_mapping: HashMap<String, String>,

    /// Non-SSE bodies above this size (or without a length) are rewritten as a stream
    pub large_body_threshold: u64,
}

/// 上游代理配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpstreamProxyConfig {
    /// 是否启用
    pub enabled: bool,
    /// 代理地址 (http://, https://, socks5://)
    pub url: String,
}

/// Durable key-value backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    Sqlite {
        /// Defaults to `<data_dir>/cache.db`
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite { path: None }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allow_lan_access: false, // 默认仅本机访问，隐私优先
            port: 8045,
            upstream_base_url: CODE_ASSIST_ENDPOINT.to_string(),
            credentials_path: None,
            oauth_client_id: None,
            oauth_client_secret: None,
            token: TokenConfig::default(),
            project: ProjectConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
            store: StoreConfig::default(),
            upstream_proxy: UpstreamProxyConfig::default(),
            model_mapping: HashMap::new(),
            large_body_threshold: default_large_body_threshold(),
        }
    }
}

fn default_large_body_threshold() -> u64 {
    1024 * 1024
}

impl ProxyConfig {
    /// 获取实际的监听地址
    /// - allow_lan_access = false: 返回 "127.0.0.1"（默认，隐私优先）
    /// - allow_lan_access = true: 返回 "0.0.0.0"（允许局域网访问）
    pub fn get_bind_address(&self) -> &str {
        if self.allow_lan_access {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }
}
