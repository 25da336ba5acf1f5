//! Status-event fan-out to connected SSE clients.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default interval between heartbeat comments.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Kind of status event shown in the UI.
///
/// Unrecognised strings are kept verbatim so the frontend can introduce new
/// states without a server change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Info,
    Investigating,
    Resolving,
    Resolved,
    Error,
    Connected,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Info => "info",
            EventType::Investigating => "investigating",
            EventType::Resolving => "resolving",
            EventType::Resolved => "resolved",
            EventType::Error => "error",
            EventType::Connected => "connected",
            EventType::Other(s) => s,
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "info" => EventType::Info,
            "investigating" => EventType::Investigating,
            "resolving" => EventType::Resolving,
            "resolved" => EventType::Resolved,
            "error" => EventType::Error,
            "connected" => EventType::Connected,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        EventType::from(s.as_str())
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: String,
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl StatusEvent {
    pub fn new(status: impl Into<String>, kind: EventType) -> Self {
        Self {
            status: status.into(),
            kind,
            metadata: serde_json::Map::new(),
            timestamp: None,
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// The greeting written to every new subscriber.
    pub fn connected() -> Self {
        Self::new("Connected to conversation stream", EventType::Connected).stamped()
    }

    /// Fill in `timestamp` when absent.
    pub fn stamped(mut self) -> Self {
        if self.timestamp.is_none() {
            self.timestamp = Some(now_iso());
        }
        self
    }
}

/// ISO-8601 UTC timestamp with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One unit written to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A serialized `StatusEvent`.
    Data(String),
    Heartbeat,
}

impl Frame {
    pub fn into_sse(self) -> Result<Event, Infallible> {
        Ok(match self {
            Frame::Data(json) => Event::default().data(json),
            Frame::Heartbeat => Event::default().comment("heartbeat"),
        })
    }
}

/// Output channel to one connected client. The handle itself is its identity.
pub type Subscriber = mpsc::UnboundedSender<Frame>;

/// Process-wide pub/sub of status events.
///
/// Built once by the composition root and shared through `Arc`.
pub struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Add a subscriber. Returns `false` if the same channel is already registered.
    pub fn subscribe(&self, subscriber: Subscriber) -> bool {
        let mut subs = self.subscribers.lock();
        if subs.iter().any(|s| s.same_channel(&subscriber)) {
            return false;
        }
        subs.push(subscriber);
        info!(subscribers = subs.len(), "SSE client connected");
        true
    }

    /// Remove a subscriber. Absent handles are ignored.
    pub fn unsubscribe(&self, subscriber: &Subscriber) -> bool {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|s| !s.same_channel(subscriber));
        let removed = subs.len() != before;
        if removed {
            info!(subscribers = subs.len(), "SSE client disconnected");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Stamp and deliver an event to every subscriber. Returns the number of
    /// successful deliveries.
    pub fn broadcast(&self, event: StatusEvent) -> usize {
        let event = event.stamped();
        let json = match serde_json::to_string(&event) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize status event");
                return 0;
            }
        };
        debug!(kind = %event.kind, status = %event.status, "broadcast event");
        self.fan_out(Frame::Data(json), "event")
    }

    pub fn heartbeat(&self) -> usize {
        self.fan_out(Frame::Heartbeat, "heartbeat")
    }

    /// Write a frame to every subscriber, dropping the ones whose channel is closed.
    fn fan_out(&self, frame: Frame, label: &str) -> usize {
        let mut subs = self.subscribers.lock();
        let mut delivered = 0usize;
        subs.retain(|s| match s.send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                warn!(label, "write to SSE client failed, dropping subscriber");
                false
            }
        });
        debug!(label, delivered, subscribers = subs.len(), "fan-out complete");
        delivered
    }

    /// Drop every subscriber, ending their streams. Used on shutdown.
    pub fn close(&self) -> usize {
        let drained = std::mem::take(&mut *self.subscribers.lock()).len();
        info!(subscribers = drained, "Closing all SSE streams");
        drained
    }

    /// Emit a heartbeat every `period` for as long as the task lives.
    pub fn spawn_heartbeat(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.heartbeat();
            }
        })
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
