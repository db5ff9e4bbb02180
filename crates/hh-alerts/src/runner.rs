use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use hh_common::clock::Clock;
use hh_common::events::{ChangeKind, StateChange};
use hh_common::model::ActiveAlert;
use hh_state::StateStore;
use hh_store::{TimeSeriesStore, WriterStats};

use crate::evaluate::{AlertConfig, evaluate};

const EVALUATION_TICK: Duration = Duration::from_secs(5);

/// Holds the current active alert set for the query surface.
pub struct AlertSet {
    current: RwLock<Vec<ActiveAlert>>,
}

impl AlertSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Vec::new()),
        })
    }

    pub async fn current(&self) -> Vec<ActiveAlert> {
        self.current.read().await.clone()
    }
}

/// Evaluator task: re-derives the alert set on every state change and on a
/// 5 s tick, and fans out set transitions through the change stream.
pub async fn run_evaluator(
    alerts: Arc<AlertSet>,
    state: Arc<StateStore>,
    store: Arc<TimeSeriesStore>,
    writer_stats: Arc<WriterStats>,
    clock: Arc<dyn Clock>,
    config: AlertConfig,
) {
    info!("Alert evaluator started (tick {:?})", EVALUATION_TICK);
    let mut rx = state.subscribe();
    let mut tick = tokio::time::interval(EVALUATION_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = rx.recv() => match result {
                // Our own alert-set records come back on the stream; do not
                // feed them back into evaluation.
                Ok(change) if change.kind == ChangeKind::Alerts => continue,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Alert evaluator lagged {} change records", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Change stream closed, stopping alert evaluator");
                    return;
                }
            },
            _ = tick.tick() => {}
        }

        let snapshot = state.snapshot_all().await;
        let open_incidents = match store.open_incidents() {
            Ok(incidents) => incidents,
            Err(e) => {
                warn!("Failed to load open incidents for evaluation: {e:#}");
                Vec::new()
            }
        };

        let next = evaluate(
            &snapshot,
            &open_incidents,
            clock.now_ms(),
            &config,
            writer_stats.is_healthy(),
        );

        let mut current = alerts.current.write().await;
        if *current != next {
            let before = serde_json::to_value(&*current).unwrap_or(Value::Null);
            let after = serde_json::to_value(&next).unwrap_or(Value::Null);
            debug!("Alert set changed: {} active", next.len());
            *current = next;
            drop(current);
            state.emit(StateChange::new("", ChangeKind::Alerts, before, after));
        }
    }
}
