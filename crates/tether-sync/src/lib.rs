//! The synchronization engine: decides whether a change reaches a session
//! live, persists it when it cannot, replays backlogs in dependency-safe
//! order on reconnect, and reconciles temporary entity ids with the final
//! ids sessions assign.

pub mod dispatcher;
pub mod heartbeat;
pub mod reconcile;
pub mod registry;
pub mod replay;

pub use dispatcher::{DeliveryOutcome, Dispatcher, FlushSummary};
pub use heartbeat::HeartbeatThrottle;
pub use reconcile::{ReconcileSummary, Reconciler};
pub use registry::{ConnectionRegistry, SessionHandle, WsOutbound};
