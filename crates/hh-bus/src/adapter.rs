//! Bus adapter: sole owner of the broker connection.
//!
//! The receive loop polls the bus event loop, decodes publishes through
//! the codec registry and hands typed events to the state store's apply
//! queue. The send loop drains a bounded drop-oldest outbound queue so a
//! broker outage can never wedge a caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event as BusEvent, MqttOptions, Packet, QoS};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

use hh_codec::registry::SUBSCRIPTIONS;
use hh_codec::{CodecRegistry, Event};
use hh_common::config::HubConfig;

const OUTBOUND_QUEUE_CAP: usize = 1024;
const RECONNECT_INITIAL: Duration = Duration::from_millis(200);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// How long the receive loop will wait for apply-queue space before it
/// starts shedding reading events (matches the state store's policy).
const APPLY_ENQUEUE_WAIT: Duration = hh_state::APPLY_ENQUEUE_WAIT;

#[derive(Debug, Default)]
pub struct BusStats {
    pub decode_errors: AtomicU64,
    /// Reading events dropped because the apply queue stayed full past the
    /// enqueue wait.
    pub shed_applies: AtomicU64,
    /// Publishes dropped from the outbound queue on overflow.
    pub dropped_publishes: AtomicU64,
    pub connected: AtomicBool,
}

impl BusStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

struct OutboundMessage {
    topic: String,
    payload: Vec<u8>,
}

/// Bounded outbound publish buffer with a drop-oldest overflow policy.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<OutboundMessage>>,
    notify: Notify,
    stats: Arc<BusStats>,
}

impl OutboundQueue {
    pub fn new(stats: Arc<BusStats>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            stats,
        })
    }

    fn is_full(&self) -> bool {
        self.inner.lock().unwrap().len() >= OUTBOUND_QUEUE_CAP
    }

    fn push_back(&self, message: OutboundMessage) {
        let mut inner = self.inner.lock().unwrap();
        if inner.len() >= OUTBOUND_QUEUE_CAP {
            inner.pop_front();
            self.stats.dropped_publishes.fetch_add(1, Ordering::Relaxed);
        }
        inner.push_back(message);
        drop(inner);
        self.notify.notify_one();
    }

    fn push_front(&self, message: OutboundMessage) {
        self.inner.lock().unwrap().push_front(message);
        self.notify.notify_one();
    }

    async fn pop(&self) -> OutboundMessage {
        loop {
            if let Some(message) = self.inner.lock().unwrap().pop_front() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

/// Clonable publisher handle used by the command dispatcher and the OTA
/// orchestrator. All publishes are serialized through the adapter's
/// outbound queue, preserving per-intent ordering.
#[derive(Clone)]
pub struct BusHandle {
    codec: Arc<CodecRegistry>,
    queue: Arc<OutboundQueue>,
    stats: Arc<BusStats>,
}

/// Enqueueing failed: the bus is disconnected and the buffer is full.
#[derive(Debug)]
pub struct BufferFull;

impl BusHandle {
    pub fn new(codec: Arc<CodecRegistry>, queue: Arc<OutboundQueue>, stats: Arc<BusStats>) -> Self {
        Self {
            codec,
            queue,
            stats,
        }
    }

    /// Encode and enqueue a command publish. While connected the queue
    /// absorbs bursts with drop-oldest; when disconnected a full buffer is
    /// reported to the caller instead of silently shedding its intent.
    pub fn publish_command(&self, command: &hh_codec::Command) -> Result<(), BufferFull> {
        let (topic, payload) = self.codec.encode_command(command);
        if !self.stats.is_connected() && self.queue.is_full() {
            return Err(BufferFull);
        }
        self.queue.push_back(OutboundMessage { topic, payload });
        Ok(())
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }
}

/// Run the bus adapter: connects, subscribes, and drives both the receive
/// and send loops until a fatal error. Reconnects internally with
/// exponential backoff.
pub async fn run_bus(
    config: Arc<HubConfig>,
    codec: Arc<CodecRegistry>,
    queue: Arc<OutboundQueue>,
    stats: Arc<BusStats>,
    apply_tx: mpsc::Sender<Event>,
) -> anyhow::Result<()> {
    let mut options = MqttOptions::new(
        config.bus_client_id.clone(),
        config.bus_host.clone(),
        config.bus_port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&config.bus_username, &config.bus_password) {
        options.set_credentials(user.clone(), pass.clone());
    }

    let (client, eventloop) = AsyncClient::new(options, 64);

    let send = run_send_loop(client.clone(), queue, stats.clone());
    let receive = run_receive_loop(eventloop, client, codec, stats, apply_tx);

    // Neither loop returns in normal operation; whichever fails first
    // takes the adapter down and the supervisor restarts it.
    tokio::select! {
        result = send => result,
        result = receive => result,
    }
}

async fn run_receive_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    codec: Arc<CodecRegistry>,
    stats: Arc<BusStats>,
    apply_tx: mpsc::Sender<Event>,
) -> anyhow::Result<()> {
    let mut backoff = RECONNECT_INITIAL;

    loop {
        match eventloop.poll().await {
            Ok(BusEvent::Incoming(Packet::ConnAck(_))) => {
                info!("Bus connected, subscribing to {} topic filters", SUBSCRIPTIONS.len());
                stats.connected.store(true, Ordering::Relaxed);
                backoff = RECONNECT_INITIAL;
                for filter in SUBSCRIPTIONS {
                    if let Err(e) = client.subscribe(*filter, QoS::AtLeastOnce).await {
                        warn!("Subscribe to {} failed: {}", filter, e);
                    }
                }
            }
            Ok(BusEvent::Incoming(Packet::Publish(publish))) => {
                handle_publish(&codec, &stats, &apply_tx, &publish.topic, &publish.payload)
                    .await?;
            }
            Ok(_) => {}
            Err(e) => {
                if stats.is_connected() {
                    warn!("Bus connection lost: {}", e);
                } else {
                    debug!("Bus connect attempt failed: {}", e);
                }
                stats.connected.store(false, Ordering::Relaxed);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_CAP);
            }
        }
    }
}

async fn handle_publish(
    codec: &CodecRegistry,
    stats: &BusStats,
    apply_tx: &mpsc::Sender<Event>,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    let event = match codec.decode(topic, payload) {
        Ok(Some(event)) => event,
        Ok(None) => return Ok(()),
        Err(e) => {
            stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Decode failed: {}", e);
            return Ok(());
        }
    };

    // Block briefly for apply-queue space, then shed readings only;
    // status, sos and boot events wait for room.
    match apply_tx.send_timeout(event, APPLY_ENQUEUE_WAIT).await {
        Ok(()) => Ok(()),
        Err(SendTimeoutError::Timeout(event)) => {
            if matches!(event, Event::TelemetryReading { .. }) {
                stats.shed_applies.fetch_add(1, Ordering::Relaxed);
                warn!("Apply queue full, shed a reading from {}", topic);
                Ok(())
            } else {
                apply_tx
                    .send(event)
                    .await
                    .map_err(|_| anyhow::anyhow!("state store apply queue closed"))
            }
        }
        Err(SendTimeoutError::Closed(_)) => {
            error!("State store apply queue closed, stopping bus adapter");
            anyhow::bail!("state store apply queue closed");
        }
    }
}

async fn run_send_loop(
    client: AsyncClient,
    queue: Arc<OutboundQueue>,
    stats: Arc<BusStats>,
) -> anyhow::Result<()> {
    loop {
        let message = queue.pop().await;
        match client
            .publish(
                message.topic.clone(),
                QoS::AtLeastOnce,
                false,
                message.payload.clone(),
            )
            .await
        {
            Ok(()) => {
                debug!("Published to {}", message.topic);
            }
            Err(e) => {
                warn!("Publish to {} failed, requeueing: {}", message.topic, e);
                stats.connected.store(false, Ordering::Relaxed);
                queue.push_front(message);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: usize) -> OutboundMessage {
        OutboundMessage {
            topic: format!("home/system/device-{n}/ping"),
            payload: b"{}".to_vec(),
        }
    }

    #[test]
    fn outbound_queue_drops_oldest_on_overflow() {
        let stats = BusStats::new();
        let queue = OutboundQueue::new(stats.clone());

        for n in 0..(OUTBOUND_QUEUE_CAP + 5) {
            queue.push_back(message(n));
        }

        assert_eq!(stats.dropped_publishes.load(Ordering::Relaxed), 5);
        let inner = queue.inner.lock().unwrap();
        assert_eq!(inner.len(), OUTBOUND_QUEUE_CAP);
        assert_eq!(inner.front().unwrap().topic, "home/system/device-5/ping");
    }

    #[test]
    fn publish_command_fails_only_when_disconnected_and_full() {
        let stats = BusStats::new();
        let queue = OutboundQueue::new(stats.clone());
        let handle = BusHandle::new(Arc::new(CodecRegistry::new()), queue, stats.clone());

        let ping = hh_codec::Command::Ping {
            device_id: "garage-controller".to_string(),
        };

        // Disconnected but buffer has room: accepted.
        assert!(handle.publish_command(&ping).is_ok());

        for _ in 0..OUTBOUND_QUEUE_CAP {
            let _ = handle.publish_command(&ping);
        }
        // Disconnected and full: refused.
        assert!(handle.publish_command(&ping).is_err());

        // Connected and full: accepted with drop-oldest.
        stats.connected.store(true, Ordering::Relaxed);
        assert!(handle.publish_command(&ping).is_ok());
    }
}
