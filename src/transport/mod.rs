pub mod http;
pub mod trait_def;

pub use http::HttpTransport;
pub use trait_def::{Headers, Transport, TransportError, TransportResult};
