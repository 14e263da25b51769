/// Platform radio capability
///
/// The controllers never talk to a BLE stack directly. A platform
/// implementation provides the fire-and-forget operations below and reports
/// every outcome back as a tagged event through a [`RadioEventSender`]. Events
/// for one role land in a single inbox processed on that role's runtime task.

use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::gate::AdapterState;
use super::gatt::{DiscoveredCharacteristic, ServiceIdentity};

/// Failure of a low-level start/stop/connect call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("Radio not ready: {0}")]
    NotReady(AdapterState),
    #[error("Operation rejected by the BLE stack: {0}")]
    Rejected(String),
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
    #[error("Platform error: {0}")]
    Platform(String),
}

/// Peripheral-side (GATT server) operations
pub trait PeripheralRadio: Send {
    /// Publish the messaging service with one notify + write-without-response
    /// characteristic
    fn add_service(&mut self, identity: &ServiceIdentity) -> Result<(), RadioError>;

    /// Remove every published service
    fn remove_services(&mut self);

    /// Begin advertising with `service` in the advertisement payload.
    /// Completion arrives as [`PeripheralEvent::AdvertisingStarted`].
    fn start_advertising(&mut self, service: Uuid) -> Result<(), RadioError>;

    fn stop_advertising(&mut self) -> Result<(), RadioError>;

    /// Notify subscribed centrals with one chunk. `false` means the transmit
    /// queue is full; retry after [`PeripheralEvent::ReadyToUpdateSubscribers`].
    fn notify(&mut self, characteristic: Uuid, value: &[u8]) -> bool;
}

/// Central-side (GATT client) operations
pub trait CentralRadio: Send {
    /// Scan for peripherals advertising `service`
    fn start_scan(&mut self, service: Uuid, allow_duplicates: bool) -> Result<(), RadioError>;

    fn stop_scan(&mut self) -> Result<(), RadioError>;

    /// Request a connection; the outcome arrives as
    /// [`CentralEvent::Connected`] or [`CentralEvent::ConnectFailed`]
    fn connect(&mut self, peer_id: &str) -> Result<(), RadioError>;

    fn cancel_connection(&mut self, peer_id: &str) -> Result<(), RadioError>;

    fn discover_services(&mut self, peer_id: &str, service: Uuid) -> Result<(), RadioError>;

    fn discover_characteristics(
        &mut self,
        peer_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), RadioError>;

    fn set_notify(
        &mut self,
        peer_id: &str,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), RadioError>;

    /// Write one chunk without response. `false` means the stack cannot take
    /// more right now; retry after [`CentralEvent::ReadyToWrite`].
    fn write_without_response(&mut self, peer_id: &str, characteristic: Uuid, value: &[u8])
        -> bool;
}

/// Events the platform reports to the peripheral role
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    AdapterStateChanged(AdapterState),
    ServiceAdded(Result<(), String>),
    AdvertisingStarted(Result<(), String>),
    /// A central enabled notifications on the message characteristic
    Subscribed {
        central_id: String,
        max_update_len: usize,
    },
    Unsubscribed {
        central_id: String,
    },
    WriteReceived {
        central_id: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// Transmit queue has room again
    ReadyToUpdateSubscribers,
}

/// Events the platform reports to the central role
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    AdapterStateChanged(AdapterState),
    PeerDiscovered {
        peer_id: String,
        rssi: i16,
    },
    ScanFailed {
        reason: String,
    },
    Connected {
        peer_id: String,
    },
    ConnectFailed {
        peer_id: String,
        reason: Option<String>,
    },
    Disconnected {
        peer_id: String,
        reason: Option<String>,
    },
    ServicesDiscovered {
        peer_id: String,
        result: Result<Vec<Uuid>, String>,
    },
    CharacteristicsDiscovered {
        peer_id: String,
        service: Uuid,
        result: Result<Vec<DiscoveredCharacteristic>, String>,
    },
    NotificationStateChanged {
        peer_id: String,
        characteristic: Uuid,
        result: Result<bool, String>,
    },
    ValueUpdated {
        peer_id: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    MtuChanged {
        peer_id: String,
        max_write_len: usize,
    },
    /// Write-without-response queue has room again
    ReadyToWrite {
        peer_id: String,
    },
}

impl fmt::Display for PeripheralEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeripheralEvent::AdapterStateChanged(state) => {
                write!(f, "AdapterStateChanged {{ state: {} }}", state)
            }
            PeripheralEvent::ServiceAdded(result) => {
                write!(f, "ServiceAdded {{ ok: {} }}", result.is_ok())
            }
            PeripheralEvent::AdvertisingStarted(result) => {
                write!(f, "AdvertisingStarted {{ ok: {} }}", result.is_ok())
            }
            PeripheralEvent::Subscribed {
                central_id,
                max_update_len,
            } => write!(
                f,
                "Subscribed {{ central: {}, max_update_len: {} }}",
                central_id, max_update_len
            ),
            PeripheralEvent::Unsubscribed { central_id } => {
                write!(f, "Unsubscribed {{ central: {} }}", central_id)
            }
            PeripheralEvent::WriteReceived {
                central_id, value, ..
            } => write!(
                f,
                "WriteReceived {{ central: {}, len: {} }}",
                central_id,
                value.len()
            ),
            PeripheralEvent::ReadyToUpdateSubscribers => write!(f, "ReadyToUpdateSubscribers"),
        }
    }
}

impl fmt::Display for CentralEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CentralEvent::AdapterStateChanged(state) => {
                write!(f, "AdapterStateChanged {{ state: {} }}", state)
            }
            CentralEvent::PeerDiscovered { peer_id, rssi } => {
                write!(f, "PeerDiscovered {{ peer: {}, rssi: {} }}", peer_id, rssi)
            }
            CentralEvent::ScanFailed { reason } => write!(f, "ScanFailed {{ reason: {} }}", reason),
            CentralEvent::Connected { peer_id } => write!(f, "Connected {{ peer: {} }}", peer_id),
            CentralEvent::ConnectFailed { peer_id, .. } => {
                write!(f, "ConnectFailed {{ peer: {} }}", peer_id)
            }
            CentralEvent::Disconnected { peer_id, .. } => {
                write!(f, "Disconnected {{ peer: {} }}", peer_id)
            }
            CentralEvent::ServicesDiscovered { peer_id, result } => write!(
                f,
                "ServicesDiscovered {{ peer: {}, ok: {} }}",
                peer_id,
                result.is_ok()
            ),
            CentralEvent::CharacteristicsDiscovered { peer_id, result, .. } => write!(
                f,
                "CharacteristicsDiscovered {{ peer: {}, ok: {} }}",
                peer_id,
                result.is_ok()
            ),
            CentralEvent::NotificationStateChanged { peer_id, result, .. } => write!(
                f,
                "NotificationStateChanged {{ peer: {}, result: {:?} }}",
                peer_id, result
            ),
            CentralEvent::ValueUpdated { peer_id, value, .. } => write!(
                f,
                "ValueUpdated {{ peer: {}, len: {} }}",
                peer_id,
                value.len()
            ),
            CentralEvent::MtuChanged {
                peer_id,
                max_write_len,
            } => write!(
                f,
                "MtuChanged {{ peer: {}, max_write_len: {} }}",
                peer_id, max_write_len
            ),
            CentralEvent::ReadyToWrite { peer_id } => {
                write!(f, "ReadyToWrite {{ peer: {} }}", peer_id)
            }
        }
    }
}

/// Cloneable handle the platform uses to post events into a role's inbox
#[derive(Debug)]
pub struct RadioEventSender<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for RadioEventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> RadioEventSender<E> {
    /// Post an event. Returns `false` once the role runtime has shut down.
    pub fn post(&self, event: E) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a role's radio inbox
pub type RadioEventReceiver<E> = mpsc::UnboundedReceiver<E>;

/// Create the inbox pair for one role
pub fn radio_event_channel<E>() -> (RadioEventSender<E>, RadioEventReceiver<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RadioEventSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_sender_reports_closed_inbox() {
        let (tx, rx) = radio_event_channel::<PeripheralEvent>();
        assert!(tx.post(PeripheralEvent::ReadyToUpdateSubscribers));
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.post(PeripheralEvent::ReadyToUpdateSubscribers));
    }

    #[test]
    fn test_event_display_hides_payload() {
        let event = CentralEvent::ValueUpdated {
            peer_id: "P".to_string(),
            characteristic: Uuid::nil(),
            value: b"secret".to_vec(),
        };
        let shown = event.to_string();
        assert!(shown.contains("len: 6"));
        assert!(!shown.contains("secret"));
    }
}
