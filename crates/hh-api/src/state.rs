use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use tokio::sync::watch;

use hh_alerts::AlertSet;
use hh_bus::{BusStats, CommandDispatcher};
use hh_common::clock::Clock;
use hh_common::config::HubConfig;
use hh_ota::OtaOrchestrator;
use hh_state::StateStore;
use hh_store::{TimeSeriesStore, WriterStats};

/// Read handlers must answer within this deadline.
pub const READ_DEADLINE: Duration = Duration::from_secs(2);
/// Command and OTA handlers get a little longer.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Shared application state for all API routes.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<HubConfig>,
    pub state: Arc<StateStore>,
    pub store: Arc<TimeSeriesStore>,
    pub alerts: Arc<AlertSet>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub ota: Arc<OtaOrchestrator>,
    pub bus_stats: Arc<BusStats>,
    pub writer_stats: Arc<WriterStats>,
    pub clock: Arc<dyn Clock>,
    pub started_at_ms: i64,
    /// Flipped on shutdown; fan-out connections close when it goes true.
    pub shutdown: watch::Receiver<bool>,
    /// Currently connected fan-out clients, for the shutdown drain.
    pub active_clients: Arc<AtomicUsize>,
}
