pub mod clock;
pub mod conflation;
pub mod consumer;
pub mod controller;
pub mod event;
pub mod history;
pub mod producer;
pub mod session;
pub mod telemetry;

pub use controller::{MarketController, StopResult};
pub use event::{EventSink, MarketEvent};
pub use session::{Session, StartStreamArgs, StartupMode, StreamConfig};

/// Errors surfaced through the command surface. Everything else is reflected
/// as `market_status` state while the pipeline keeps running.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgs(String),
    #[error("a stream start is already in progress")]
    AlreadyStarting,
    #[error(transparent)]
    Adapter(#[from] exchange::AdapterError),
}

pub(crate) fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
