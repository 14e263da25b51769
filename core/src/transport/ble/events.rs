/// Events emitted to the host layer
///
/// Both role controllers report through an injected [`EventSink`]; how events
/// reach listeners (plugin bridge, channel, log) is up to the sink.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Fire-and-forget notifications, named after the host listener they feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum MessagingEvent {
    #[serde(rename = "onAdvertisingStarted")]
    AdvertisingStarted,
    #[serde(rename = "onAdvertisingStopped")]
    AdvertisingStopped,
    #[serde(rename = "onAdvertisingFailed")]
    AdvertisingFailed { reason: String },
    #[serde(rename = "onScanStarted")]
    ScanStarted,
    #[serde(rename = "onScanStopped")]
    ScanStopped,
    #[serde(rename = "onScanFailed")]
    ScanFailed { reason: String },
    #[serde(rename = "onDeviceFound")]
    DeviceFound { uuid: String, rssi: i16 },
    #[serde(rename = "onDeviceConnected")]
    DeviceConnected { uuid: String },
    #[serde(rename = "onDeviceDisconnected")]
    DeviceDisconnected { uuid: String },
    #[serde(rename = "onMessageReceived")]
    MessageReceived {
        from: String,
        message: String,
        /// Milliseconds since the Unix epoch
        timestamp: u64,
    },
}

impl MessagingEvent {
    /// Completed inbound message stamped with the current time
    pub fn message_received(from: impl Into<String>, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        MessagingEvent::MessageReceived {
            from: from.into(),
            message: message.into(),
            timestamp,
        }
    }

    /// Listener name on the host side
    pub fn name(&self) -> &'static str {
        match self {
            MessagingEvent::AdvertisingStarted => "onAdvertisingStarted",
            MessagingEvent::AdvertisingStopped => "onAdvertisingStopped",
            MessagingEvent::AdvertisingFailed { .. } => "onAdvertisingFailed",
            MessagingEvent::ScanStarted => "onScanStarted",
            MessagingEvent::ScanStopped => "onScanStopped",
            MessagingEvent::ScanFailed { .. } => "onScanFailed",
            MessagingEvent::DeviceFound { .. } => "onDeviceFound",
            MessagingEvent::DeviceConnected { .. } => "onDeviceConnected",
            MessagingEvent::DeviceDisconnected { .. } => "onDeviceDisconnected",
            MessagingEvent::MessageReceived { .. } => "onMessageReceived",
        }
    }

    /// Host-facing JSON form: `{"event": "<name>", "data": {...}}`
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for MessagingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessagingEvent::AdvertisingFailed { reason } | MessagingEvent::ScanFailed { reason } => {
                write!(f, "{} {{ reason: {} }}", self.name(), reason)
            }
            MessagingEvent::DeviceFound { uuid, rssi } => {
                write!(f, "{} {{ uuid: {}, rssi: {} }}", self.name(), uuid, rssi)
            }
            MessagingEvent::DeviceConnected { uuid } | MessagingEvent::DeviceDisconnected { uuid } => {
                write!(f, "{} {{ uuid: {} }}", self.name(), uuid)
            }
            MessagingEvent::MessageReceived { from, message, .. } => write!(
                f,
                "{} {{ from: {}, len: {} }}",
                self.name(),
                from,
                message.len()
            ),
            _ => f.write_str(self.name()),
        }
    }
}

/// Observer both role controllers emit to
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MessagingEvent);
}

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<MessagingEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MessagingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: MessagingEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event receiver dropped, event discarded");
        }
    }
}

impl<F> EventSink for F
where
    F: Fn(MessagingEvent) + Send + Sync,
{
    fn emit(&self, event: MessagingEvent) {
        self(event)
    }
}

/// Sink that keeps everything it receives, for tests
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<MessagingEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<MessagingEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<MessagingEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn emit(&self, event: MessagingEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let json = MessagingEvent::DeviceFound {
            uuid: "P".to_string(),
            rssi: -40,
        }
        .to_json()
        .expect("serializes");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert_eq!(value["event"], "onDeviceFound");
        assert_eq!(value["data"]["uuid"], "P");

        let json = MessagingEvent::ScanStarted.to_json().expect("serializes");
        assert_eq!(json, r#"{"event":"onScanStarted"}"#);
    }

    #[test]
    fn test_message_received_is_timestamped() {
        match MessagingEvent::message_received("A", "hi") {
            MessagingEvent::MessageReceived {
                from,
                message,
                timestamp,
            } => {
                assert_eq!(from, "A");
                assert_eq!(message, "hi");
                assert!(timestamp > 0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelEventSink::new();
        sink.emit(MessagingEvent::ScanStopped);
        assert_eq!(rx.try_recv().expect("event"), MessagingEvent::ScanStopped);

        drop(rx);
        // Receiver gone: emitting is a no-op
        sink.emit(MessagingEvent::ScanStopped);
    }

    #[test]
    fn test_closure_sink() {
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink = move |event: MessagingEvent| seen_clone.lock().push(event.name());
        sink.emit(MessagingEvent::AdvertisingStarted);
        assert_eq!(*seen.lock(), vec!["onAdvertisingStarted"]);
    }
}
