// blemsg core — dual-role BLE messaging engine
#![allow(clippy::empty_line_after_doc_comments)]
//
// One device advertises a GATT service and accepts writes (peripheral), the
// other scans, connects and subscribes (central). Text travels as ordered
// chunks followed by an `EOM` sentinel in both directions.

pub mod config;
pub mod transport;

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub use config::{ConfigError, MessagingConfig};
pub use transport::ble::{
    parse_service_uuid, AdapterState, CentralController, CentralHandle, CentralRadio,
    ChannelEventSink, EventSink, LoopbackAir, MessagingEvent, PeerRecord, PeripheralController,
    PeripheralHandle, PeripheralRadio, RadioError, RadioEventSender, SubscriberRecord,
};

use transport::ble::{
    radio_event_channel, spawn_central, spawn_peripheral, CentralEvent, PeripheralEvent,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),
    #[error("Missing required argument: {0}")]
    MissingArgs(&'static str),
    #[error("Bluetooth is powered off")]
    RadioUnavailable,
    #[error("Bluetooth LE is not supported on this device")]
    RadioUnsupported,
    #[error("Bluetooth use is not authorized")]
    RadioUnauthorized,
    #[error("Failed to start advertising: {0}")]
    AdvertiseStartFailed(String),
    #[error("Failed to start scan: {0}")]
    ScanStartFailed(String),
    #[error("Failed to stop: {0}")]
    StopFailed(String),
    #[error("Failed to connect: {0}")]
    ConnectFailed(String),
    #[error("Role not initialized")]
    NotInitialized,
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Not connected or no message channel")]
    NotConnectedOrNoChannel,
    #[error("Superseded by a newer request")]
    Superseded,
    #[error("Cancelled")]
    Cancelled,
    #[error("Role runtime stopped")]
    RuntimeStopped,
    #[error("Platform error: {0}")]
    Platform(String),
}

/// Coarse error classes reported to host layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    RadioState,
    NotInitialized,
    TransportOperation,
    NotFound,
    Lifecycle,
}

impl MessagingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MessagingError::InvalidUuid(_) | MessagingError::MissingArgs(_) => {
                ErrorKind::Validation
            }
            MessagingError::RadioUnavailable
            | MessagingError::RadioUnsupported
            | MessagingError::RadioUnauthorized => ErrorKind::RadioState,
            MessagingError::NotInitialized => ErrorKind::NotInitialized,
            MessagingError::AdvertiseStartFailed(_)
            | MessagingError::ScanStartFailed(_)
            | MessagingError::StopFailed(_)
            | MessagingError::ConnectFailed(_)
            | MessagingError::NotConnectedOrNoChannel
            | MessagingError::Platform(_) => ErrorKind::TransportOperation,
            MessagingError::DeviceNotFound(_) => ErrorKind::NotFound,
            MessagingError::Superseded
            | MessagingError::Cancelled
            | MessagingError::RuntimeStopped => ErrorKind::Lifecycle,
        }
    }
}

impl From<RadioError> for MessagingError {
    fn from(err: RadioError) -> Self {
        match err {
            RadioError::NotReady(state) => state.failure().unwrap_or(MessagingError::RadioUnavailable),
            RadioError::UnknownPeer(peer) => MessagingError::DeviceNotFound(peer),
            RadioError::Rejected(reason) | RadioError::Platform(reason) => {
                MessagingError::Platform(reason)
            }
        }
    }
}

// ============================================================================
// RADIO PROVIDER
// ============================================================================

/// Factory for platform radios, one per role.
///
/// The facade calls each method at most once per role lifetime and hands the
/// radio the sender for that role's event inbox.
pub trait RadioProvider: Send + Sync {
    fn peripheral(
        &self,
        events: RadioEventSender<PeripheralEvent>,
    ) -> Result<Box<dyn PeripheralRadio>, RadioError>;

    fn central(
        &self,
        events: RadioEventSender<CentralEvent>,
    ) -> Result<Box<dyn CentralRadio>, RadioError>;
}

/// Loopback radios for one device on a shared [`LoopbackAir`]
#[derive(Clone)]
pub struct LoopbackProvider {
    air: LoopbackAir,
    device_id: String,
}

impl LoopbackProvider {
    pub fn new(air: LoopbackAir, device_id: impl Into<String>) -> Self {
        Self {
            air,
            device_id: device_id.into(),
        }
    }
}

impl RadioProvider for LoopbackProvider {
    fn peripheral(
        &self,
        events: RadioEventSender<PeripheralEvent>,
    ) -> Result<Box<dyn PeripheralRadio>, RadioError> {
        Ok(Box::new(self.air.peripheral_radio(self.device_id.clone(), events)))
    }

    fn central(
        &self,
        events: RadioEventSender<CentralEvent>,
    ) -> Result<Box<dyn CentralRadio>, RadioError> {
        Ok(Box::new(self.air.central_radio(self.device_id.clone(), events)))
    }
}

// ============================================================================
// FACADE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Peripheral,
    Central,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Peripheral => write!(f, "peripheral"),
            Role::Central => write!(f, "central"),
        }
    }
}

/// Host-facing entry point. Roles are created on first use; `send_message`
/// goes through whichever role was started last.
pub struct BleMessaging {
    config: MessagingConfig,
    provider: Arc<dyn RadioProvider>,
    sink: Arc<dyn EventSink>,
    peripheral: RwLock<Option<PeripheralHandle>>,
    central: RwLock<Option<CentralHandle>>,
    active_role: RwLock<Option<Role>>,
}

impl BleMessaging {
    pub fn new(
        config: MessagingConfig,
        provider: Arc<dyn RadioProvider>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            sink,
            peripheral: RwLock::new(None),
            central: RwLock::new(None),
            active_role: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Role `send_message` currently targets
    pub fn active_role(&self) -> Option<Role> {
        *self.active_role.read()
    }

    pub async fn start_advertising(&self, service_uuid: &str) -> Result<(), MessagingError> {
        parse_service_uuid(service_uuid)?;
        let handle = self.peripheral_handle()?;
        *self.active_role.write() = Some(Role::Peripheral);
        handle.start_advertising(service_uuid).await
    }

    /// Idempotent; a no-op before the peripheral role exists
    pub async fn stop_advertising(&self) -> Result<(), MessagingError> {
        let handle = self.peripheral.read().clone();
        match handle {
            Some(handle) => handle.stop_advertising().await,
            None => Ok(()),
        }
    }

    /// `scan_timeout` of `None` uses the configured default; zero scans until
    /// stopped
    pub async fn start_scan(
        &self,
        service_uuid: &str,
        scan_timeout: Option<Duration>,
    ) -> Result<(), MessagingError> {
        parse_service_uuid(service_uuid)?;
        let handle = self.central_handle()?;
        *self.active_role.write() = Some(Role::Central);
        handle.start_scan(service_uuid, scan_timeout).await
    }

    pub async fn stop_scan(&self) -> Result<(), MessagingError> {
        self.existing_central()?.stop_scan().await
    }

    pub async fn connect_to_device(&self, uuid: &str) -> Result<(), MessagingError> {
        if uuid.is_empty() {
            return Err(MessagingError::MissingArgs("uuid"));
        }
        self.existing_central()?.connect(uuid).await
    }

    pub async fn disconnect_from_device(&self, uuid: &str) -> Result<(), MessagingError> {
        if uuid.is_empty() {
            return Err(MessagingError::MissingArgs("uuid"));
        }
        self.existing_central()?.disconnect(uuid).await
    }

    pub async fn send_message(&self, to: &str, message: &str) -> Result<(), MessagingError> {
        if to.is_empty() {
            return Err(MessagingError::MissingArgs("to"));
        }
        let role = *self.active_role.read();
        match role {
            Some(Role::Peripheral) => {
                let handle = self.peripheral.read().clone();
                handle
                    .ok_or(MessagingError::NotInitialized)?
                    .send_message(to, message)
                    .await
            }
            Some(Role::Central) => self.existing_central()?.send_message(to, message).await,
            None => Err(MessagingError::NotInitialized),
        }
    }

    pub async fn is_advertising(&self) -> bool {
        let handle = self.peripheral.read().clone();
        match handle {
            Some(handle) => handle.is_advertising().await.unwrap_or(false),
            None => false,
        }
    }

    pub async fn is_scanning(&self) -> bool {
        let handle = self.central.read().clone();
        match handle {
            Some(handle) => handle.is_scanning().await.unwrap_or(false),
            None => false,
        }
    }

    pub async fn discovered_peers(&self) -> Result<Vec<PeerRecord>, MessagingError> {
        self.existing_central()?.discovered_peers().await
    }

    pub async fn subscribers(&self) -> Result<Vec<SubscriberRecord>, MessagingError> {
        let handle = self.peripheral.read().clone();
        handle
            .ok_or(MessagingError::NotInitialized)?
            .subscribers()
            .await
    }

    /// Tear down both roles. Safe to call repeatedly.
    pub async fn cleanup(&self) -> Result<(), MessagingError> {
        let peripheral = self.peripheral.write().take();
        let central = self.central.write().take();
        *self.active_role.write() = None;

        if let Some(handle) = peripheral {
            let _ = handle.cleanup().await;
            handle.shutdown().await;
        }
        if let Some(handle) = central {
            let _ = handle.cleanup().await;
            handle.shutdown().await;
        }
        info!("Messaging cleaned up");
        Ok(())
    }

    fn peripheral_handle(&self) -> Result<PeripheralHandle, MessagingError> {
        let mut slot = self.peripheral.write();
        if let Some(handle) = slot.as_ref().filter(|h| h.is_running()) {
            return Ok(handle.clone());
        }

        let (events_tx, events_rx) = radio_event_channel();
        let radio = self.provider.peripheral(events_tx)?;
        let controller = PeripheralController::new(&self.config, radio, self.sink.clone());
        let handle = spawn_peripheral(controller, events_rx, self.config.command_buffer);
        info!("Peripheral role created");
        *slot = Some(handle.clone());
        Ok(handle)
    }

    fn central_handle(&self) -> Result<CentralHandle, MessagingError> {
        let mut slot = self.central.write();
        if let Some(handle) = slot.as_ref().filter(|h| h.is_running()) {
            return Ok(handle.clone());
        }

        let (events_tx, events_rx) = radio_event_channel();
        let radio = self.provider.central(events_tx)?;
        let controller = CentralController::new(&self.config, radio, self.sink.clone());
        let handle = spawn_central(controller, events_rx, self.config.command_buffer);
        info!("Central role created");
        *slot = Some(handle.clone());
        Ok(handle)
    }

    fn existing_central(&self) -> Result<CentralHandle, MessagingError> {
        self.central
            .read()
            .clone()
            .ok_or(MessagingError::NotInitialized)
    }
}
