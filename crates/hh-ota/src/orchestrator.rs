use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{info, warn};

use hh_bus::BusHandle;
use hh_codec::Command;
use hh_common::clock::Clock;
use hh_common::config::HubConfig;
use hh_common::events::ChangeKind;
use hh_common::model::{DeviceStatus, OtaManifest};
use hh_state::StateStore;
use hh_store::TimeSeriesStore;

use crate::manifest::{OtaError, build_manifest};

/// In-flight attempts older than this are forgotten.
const ATTEMPT_TIMEOUT_MS: i64 = 10 * 60 * 1000;

struct OtaAttempt {
    git_ref: String,
    started_ms: i64,
}

/// Builds device-scoped manifests and publishes them to the device's
/// update topic. Delivery progress is observed through the device's own
/// status progression; this layer never retries.
pub struct OtaOrchestrator {
    config: Arc<HubConfig>,
    bus: BusHandle,
    state: Arc<StateStore>,
    store: Arc<TimeSeriesStore>,
    clock: Arc<dyn Clock>,
    attempts: Mutex<HashMap<String, OtaAttempt>>,
}

impl OtaOrchestrator {
    pub fn new(
        config: Arc<HubConfig>,
        bus: BusHandle,
        state: Arc<StateStore>,
        store: Arc<TimeSeriesStore>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            state,
            store,
            clock,
            attempts: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve the ref to use, falling back to the configured default.
    fn resolve_ref<'a>(&'a self, git_ref: Option<&'a str>) -> &'a str {
        git_ref.unwrap_or(&self.config.default_ref)
    }

    fn base_url(&self) -> Result<&str, OtaError> {
        // The proxy base, when configured, overrides the raw-content base.
        self.config
            .proxy_base_url
            .as_deref()
            .or(self.config.raw_base_url.as_deref())
            .ok_or(OtaError::NoBaseUrl)
    }

    async fn ensure_known(&self, device_id: &str) -> Result<(), OtaError> {
        if self.state.contains_device(device_id).await {
            return Ok(());
        }
        if self.store.device_exists(device_id).unwrap_or(false) {
            return Ok(());
        }
        Err(OtaError::UnknownDevice(device_id.to_string()))
    }

    /// Build the manifest without publishing it.
    pub async fn preview(
        &self,
        device_id: &str,
        git_ref: Option<&str>,
    ) -> Result<OtaManifest, OtaError> {
        self.ensure_known(device_id).await?;
        let git_ref = self.resolve_ref(git_ref);
        build_manifest(&self.config.source_root, self.base_url()?, device_id, git_ref)
    }

    /// Build the manifest and publish it to the device's update topic.
    pub async fn trigger(
        &self,
        device_id: &str,
        git_ref: Option<&str>,
    ) -> Result<OtaManifest, OtaError> {
        let manifest = self.preview(device_id, git_ref).await?;

        self.bus
            .publish_command(&Command::Update {
                device_id: device_id.to_string(),
                manifest: manifest.clone(),
            })
            .map_err(|_| OtaError::BusUnavailable)?;

        info!(
            "Published update manifest to {} ({} files at ref {})",
            device_id,
            manifest.files.len(),
            manifest.git_ref
        );

        self.attempts.lock().unwrap().insert(
            device_id.to_string(),
            OtaAttempt {
                git_ref: manifest.git_ref.clone(),
                started_ms: self.clock.now_ms(),
            },
        );

        Ok(manifest)
    }

    /// Watch task: observes device status transitions to record attempt
    /// outcomes. A device that asks for help mid-update marks the attempt
    /// failed; one that comes back online marks it succeeded.
    pub async fn run_attempt_watch(self: Arc<Self>) {
        let mut rx = self.state.subscribe();
        loop {
            let change = match rx.recv().await {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Change stream closed, stopping OTA watch");
                    return;
                }
            };
            if change.kind != ChangeKind::Status {
                self.expire_attempts();
                continue;
            }

            let status = change
                .after
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string();
            let was_updating = change
                .before
                .get("status")
                .and_then(|s| s.as_str())
                .map(|s| s == DeviceStatus::Updating.to_string())
                .unwrap_or(false);

            let mut attempts = self.attempts.lock().unwrap();
            if let Some(attempt) = attempts.get(&change.device_id) {
                if status == DeviceStatus::NeedsHelp.to_string() {
                    warn!(
                        "OTA attempt for {} at ref {} failed: device asked for help",
                        change.device_id, attempt.git_ref
                    );
                    attempts.remove(&change.device_id);
                } else if was_updating && status == DeviceStatus::Online.to_string() {
                    info!(
                        "OTA attempt for {} at ref {} completed",
                        change.device_id, attempt.git_ref
                    );
                    attempts.remove(&change.device_id);
                }
            }
            drop(attempts);
            self.expire_attempts();
        }
    }

    fn expire_attempts(&self) {
        let now = self.clock.now_ms();
        let mut attempts = self.attempts.lock().unwrap();
        attempts.retain(|device_id, attempt| {
            let keep = now - attempt.started_ms < ATTEMPT_TIMEOUT_MS;
            if !keep {
                warn!(
                    "OTA attempt for {} at ref {} timed out without completion",
                    device_id, attempt.git_ref
                );
            }
            keep
        });
    }
}
