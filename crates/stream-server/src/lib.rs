//! FX rate streamer service
//!
//! Hosts the aggregation pipeline and pushes rate updates to WebSocket clients

pub mod server;
pub mod service;
pub mod settings;

pub use server::{NotifyServer, NotifyServerBuilder, NotifyServerConfig, SessionError};
pub use service::{ServiceStats, StreamService};
pub use settings::load_settings;
