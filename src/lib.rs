pub mod cache;
pub mod compression;
pub mod config;
pub mod config_reload;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod routing;
pub mod security;
pub mod server;
pub mod ssl_cert_gen;

// Re-export commonly used types for easier testing
pub use config::Config;
pub use config_reload::ConfigManager;
pub use proxy::ProxyHandler;
pub use routing::{Route, Router};
pub use server::http_server::HttpServer;
pub use server::request_handler::RequestHandler;
pub use server::tls::CertificateStore;
