pub mod config;
pub mod context;
pub mod dom;
pub mod harness;
pub mod models;
pub mod page;
pub mod resolve;
pub mod session;
pub mod tracker;
pub mod transport;

pub use context::TrackingContext;
pub use page::PageSession;
pub use tracker::Tracker;
