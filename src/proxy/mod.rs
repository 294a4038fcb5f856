// proxy module - Gemini API reverse proxy service

pub mod config;
pub mod context;
pub mod project_resolver;
pub mod server;
pub mod token_manager;

pub mod common; // Common tools
pub mod handlers; // API endpoint handlers
pub mod mappers; // Protocol mappers
pub mod upstream; // Upstream client

pub use config::ProxyConfig;
pub use project_resolver::ProjectResolver;
pub use server::{AppState, AxumServer};
pub use token_manager::TokenManager;
