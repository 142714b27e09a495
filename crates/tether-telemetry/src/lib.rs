//! Tracing setup for the sync server.
//!
//! Stdout gets env-filtered fmt output; warn+ events additionally land in
//! the durable per-session sync trail (see [`trail`]) when a database
//! path is supplied.

mod trail;

pub use trail::{SyncTrail, TrailLayer, TrailRecord};

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Keeps the sync trail alive and queryable after init.
pub struct TelemetryGuard {
    trail: Option<Arc<SyncTrail>>,
}

impl TelemetryGuard {
    /// Access the persisted trail, when one was opened.
    pub fn trail(&self) -> Option<&SyncTrail> {
        self.trail.as_deref()
    }
}

/// Install the global subscriber. Call once at startup.
///
/// A `trail_db` of `None` means stdout logging only. A trail that fails
/// to open is reported and skipped rather than aborting startup.
pub fn init_telemetry(trail_db: Option<&Path>) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(filter);

    let trail = trail_db.and_then(|path| match SyncTrail::open(path) {
        Ok(trail) => Some(Arc::new(trail)),
        Err(e) => {
            eprintln!("tether-telemetry: cannot open sync trail: {e}");
            None
        }
    });
    let trail_layer = trail.clone().map(TrailLayer::new);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(trail_layer)
        .init();

    TelemetryGuard { trail }
}
