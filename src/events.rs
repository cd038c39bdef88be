//! Command events and their replay.
//!
//! Output is captured in full before anything is emitted, then replayed
//! line by line with a synthetic delay. stdout is always replayed before
//! stderr, so the two streams never interleave.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// Capacity of each instance's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Update,
    Error,
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub kind: EventKind,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl SandboxEvent {
    fn new(kind: EventKind, payload: String) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn start(command: &str) -> Self {
        let timestamp = Utc::now();
        let payload = serde_json::json!({
            "type": "start",
            "command": command,
            "timestamp": timestamp.timestamp_millis(),
        });
        Self {
            kind: EventKind::Start,
            payload: payload.to_string(),
            timestamp,
        }
    }

    pub fn end(command: &str, exit_code: i32) -> Self {
        let timestamp = Utc::now();
        let payload = serde_json::json!({
            "type": "end",
            "command": command,
            "exitCode": exit_code,
            "timestamp": timestamp.timestamp_millis(),
        });
        Self {
            kind: EventKind::End,
            payload: payload.to_string(),
            timestamp,
        }
    }

    pub fn update(payload: impl Into<String>) -> Self {
        Self::new(EventKind::Update, payload.into())
    }

    pub fn error(payload: impl Into<String>) -> Self {
        Self::new(EventKind::Error, payload.into())
    }

    /// Subscription name: `"error"` for error events, `"update"` otherwise.
    pub fn name(&self) -> &'static str {
        match self.kind {
            EventKind::Error => "error",
            EventKind::Start | EventKind::Update | EventKind::End => "update",
        }
    }

    /// Structured payload of start/end events.
    pub fn json(&self) -> Option<serde_json::Value> {
        match self.kind {
            EventKind::Start | EventKind::End => serde_json::from_str(&self.payload).ok(),
            EventKind::Update | EventKind::Error => None,
        }
    }
}

/// Delay before the n-th replayed line: `base + n * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayPacing {
    pub base: Duration,
    pub step: Duration,
}

impl ReplayPacing {
    pub const fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            step: Duration::ZERO,
        }
    }

    pub fn delay(&self, index: usize) -> Duration {
        self.base + self.step.saturating_mul(index as u32)
    }
}

impl Default for ReplayPacing {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            step: Duration::from_millis(50),
        }
    }
}

/// Hook invoked with every replayed line of one stream.
pub type OutputCallback = Box<dyn FnMut(&str) + Send>;

/// Bounded fan-out of one instance's events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SandboxEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; an unobserved event is dropped.
    pub fn publish(&self, event: SandboxEvent) {
        let _ = self.tx.send(event);
    }

    /// Replay captured output: stdout lines as updates, stderr lines as
    /// errors followed by one `STDERR:` summary update.
    pub async fn replay(
        &self,
        stdout: &str,
        stderr: &str,
        pacing: ReplayPacing,
        on_stdout: Option<&mut OutputCallback>,
        on_stderr: Option<&mut OutputCallback>,
    ) {
        if !stdout.is_empty() {
            self.replay_lines(stdout, EventKind::Update, pacing, on_stdout)
                .await;
        }
        if !stderr.is_empty() {
            self.replay_lines(stderr, EventKind::Error, pacing, on_stderr)
                .await;
            self.publish(SandboxEvent::update(format!("STDERR: {}", stderr)));
        }
    }

    async fn replay_lines(
        &self,
        text: &str,
        kind: EventKind,
        pacing: ReplayPacing,
        mut callback: Option<&mut OutputCallback>,
    ) {
        let lines = text.split('\n').filter(|line| !line.trim().is_empty());
        for (index, line) in lines.enumerate() {
            let delay = pacing.delay(index);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.publish(SandboxEvent::new(kind, line.to_string()));
            if let Some(callback) = callback.as_deref_mut() {
                callback(line);
            }
        }
    }
}

/// Next event for a subscriber. A subscriber that fell behind skips the
/// overwritten events and keeps going; `None` once the bus is gone.
pub async fn next_event(rx: &mut broadcast::Receiver<SandboxEvent>) -> Option<SandboxEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event subscriber fell behind; {} events skipped", skipped)
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}
