// tandem-realtime library entry point.

pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod maintenance;
pub mod offline;
pub mod presence;
pub mod room;
pub mod service;
pub mod ws;

pub use broadcast::{BroadcastEngine, BroadcastReport, EventPublisher};
pub use config::{RealtimeConfig, ServiceSettings};
pub use error::{ErrorCode, RealtimeError};
pub use service::RealtimeService;
