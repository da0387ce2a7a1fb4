pub mod config;
pub mod engine;
pub mod host;
pub mod reconcile;

pub use config::{EngineConfig, TtlPolicy};
pub use engine::{EngineError, EngineUpdate, SyncEngine};
pub use host::{BannerState, HostSessionHandle, SessionSnapshot};
pub use reconcile::{reconcile_incoming, ReconcileOutcome};
