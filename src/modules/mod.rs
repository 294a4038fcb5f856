pub mod config;
pub mod db;
pub mod kv;
pub mod logger;
pub mod oauth;

pub use config::{get_data_dir, load_config, open_store};
pub use logger::init_logger;
