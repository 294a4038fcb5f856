// Common tools shared by handlers and core services

pub mod circuit_breaker;
pub mod error_classifier;
pub mod model_mapping;
pub mod retry;
pub mod utils;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use error_classifier::{classify_error, sanitize_message, ErrorClassification, ErrorType};
pub use model_mapping::{ModelNormalizer, NormalizedModel};
pub use retry::{RetryConfig, RetryManager};
