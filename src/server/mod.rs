pub mod http_server;
pub mod request_handler;
pub mod response;
pub mod status;
pub mod tls;

pub use http_server::HttpServer;
pub use request_handler::{RequestHandler, Scheme};
pub use response::{ErrorResponse, ResponseBuilder};
pub use status::StatusServer;
pub use tls::CertificateStore;
