/// Central role: scanner, connection chain, single-link reassembly
///
/// Connecting walks the GATT chain one radio event at a time:
/// connected -> services discovered -> characteristic found -> notifications
/// enabled. The link is usable for sending once the messaging characteristic
/// has been found on the connected peer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventSink, MessagingEvent};
use super::framing::{chunk_size, DrainOutcome, Reassembler, SendCursor};
use super::gate::{AdapterState, GateDecision, IntentKind, PendingIntent, RadioGate, Responder};
use super::gatt::{parse_service_uuid, DiscoveredCharacteristic, ServiceIdentity};
use super::radio::{CentralEvent, CentralRadio};
use crate::config::MessagingConfig;
use crate::MessagingError;

/// A peripheral seen during the current scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub rssi: i16,
    pub connected: bool,
}

/// Scan parameters held by the radio gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRequest {
    pub service: Uuid,
    /// `None` scans until stopped
    pub timeout: Option<Duration>,
}

/// Auto-stop request for the current scan. Only a timer whose generation
/// matches the live scan may stop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTimer {
    pub generation: u64,
    pub after: Duration,
}

#[derive(Debug)]
struct Link {
    peer_id: String,
    service: Uuid,
    /// Messaging characteristic found on the peer
    characteristic_ready: bool,
    notifying: bool,
    max_write_len: Option<usize>,
}

impl Link {
    fn new(peer_id: String, service: Uuid) -> Self {
        Self {
            peer_id,
            service,
            characteristic_ready: false,
            notifying: false,
            max_write_len: None,
        }
    }
}

pub struct CentralController {
    identity: ServiceIdentity,
    max_chunk_bytes: usize,
    default_scan_timeout: Duration,
    radio: Box<dyn CentralRadio>,
    sink: Arc<dyn EventSink>,
    gate: RadioGate<ScanRequest>,
    scanning: bool,
    scan_generation: u64,
    scan_timer: Option<ScanTimer>,
    discovered: HashMap<String, PeerRecord>,
    connecting: Option<String>,
    link: Option<Link>,
    inbound: Reassembler,
    outbound: Option<SendCursor>,
}

impl CentralController {
    pub fn new(
        config: &MessagingConfig,
        radio: Box<dyn CentralRadio>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            identity: config.identity(),
            max_chunk_bytes: config.max_chunk_bytes,
            default_scan_timeout: config.default_scan_timeout(),
            radio,
            sink,
            gate: RadioGate::new(),
            scanning: false,
            scan_generation: 0,
            scan_timer: None,
            discovered: HashMap::new(),
            connecting: None,
            link: None,
            inbound: Reassembler::new(),
            outbound: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Peer of the current link, if any
    pub fn connected_peer(&self) -> Option<&str> {
        self.link.as_ref().map(|l| l.peer_id.as_str())
    }

    /// Whether the link can carry outbound messages
    pub fn is_link_ready(&self) -> bool {
        self.link.as_ref().is_some_and(|l| l.characteristic_ready)
    }

    pub fn is_notifying(&self) -> bool {
        self.link.as_ref().is_some_and(|l| l.notifying)
    }

    pub fn is_sending(&self) -> bool {
        self.outbound.is_some()
    }

    /// Snapshot of the discovered set, strongest signal first
    pub fn discovered_peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.discovered.values().cloned().collect();
        peers.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    /// Auto-stop timer armed by the last successful scan start, taken once
    pub fn take_scan_timer(&mut self) -> Option<ScanTimer> {
        self.scan_timer.take()
    }

    /// Validate and gate a scan request. `timeout` of `None` uses the
    /// configured default; a zero duration scans until stopped.
    pub fn start_scan(
        &mut self,
        service_uuid: &str,
        timeout: Option<Duration>,
        responder: Responder,
    ) {
        let service = match parse_service_uuid(service_uuid) {
            Ok(service) => service,
            Err(e) => {
                let _ = responder.send(Err(e));
                return;
            }
        };

        let timeout = timeout.unwrap_or(self.default_scan_timeout);
        let request = ScanRequest {
            service,
            timeout: (!timeout.is_zero()).then_some(timeout),
        };
        let intent = PendingIntent::new(IntentKind::StartScan, request, responder);
        if let GateDecision::Proceed(intent) = self.gate.register(intent) {
            self.perform_scan(intent);
        }
    }

    fn perform_scan(&mut self, intent: PendingIntent<ScanRequest>) {
        let request = *intent.params();
        if let Err(e) = self.radio.start_scan(request.service, true) {
            warn!("Failed to start scan: {}", e);
            intent.fail(MessagingError::ScanStartFailed(e.to_string()));
            return;
        }

        self.identity = self.identity.with_service(request.service);
        self.scanning = true;
        self.discovered.clear();
        self.scan_generation += 1;
        self.scan_timer = request.timeout.map(|after| ScanTimer {
            generation: self.scan_generation,
            after,
        });
        info!(
            "Scanning for {} (timeout {:?})",
            request.service, request.timeout
        );
        self.sink.emit(MessagingEvent::ScanStarted);
        intent.resolve();
    }

    /// Stop scanning and clear the discovered set. A no-op when idle.
    pub fn stop_scan(&mut self) -> Result<(), MessagingError> {
        self.gate.cancel(MessagingError::Cancelled);
        if !self.scanning {
            self.discovered.clear();
            return Ok(());
        }

        self.scanning = false;
        self.scan_timer = None;
        self.discovered.clear();
        let result = self.radio.stop_scan();
        info!("Scan stopped");
        self.sink.emit(MessagingEvent::ScanStopped);
        result.map_err(|e| MessagingError::StopFailed(e.to_string()))
    }

    /// Timer expiry for scan `generation`. Stale generations are ignored.
    pub fn on_scan_timeout(&mut self, generation: u64) {
        if !self.scanning || generation != self.scan_generation {
            debug!("Ignoring stale scan timer {}", generation);
            return;
        }
        info!("Scan timed out");
        if let Err(e) = self.stop_scan() {
            warn!("Stopping timed-out scan failed: {}", e);
        }
    }

    /// Connect to a discovered peer, replacing any existing link
    pub fn connect(&mut self, peer_id: &str) -> Result<(), MessagingError> {
        if peer_id.is_empty() {
            return Err(MessagingError::MissingArgs("uuid"));
        }
        if !self.discovered.contains_key(peer_id) {
            return Err(MessagingError::DeviceNotFound(peer_id.to_string()));
        }
        if self.connected_peer() == Some(peer_id) {
            debug!("Already connected to {}", peer_id);
            return Ok(());
        }

        if let Some(link) = self.link.take() {
            info!("Dropping link to {} for {}", link.peer_id, peer_id);
            if let Err(e) = self.radio.cancel_connection(&link.peer_id) {
                warn!("Cancel connection to {} failed: {}", link.peer_id, e);
            }
            self.reset_link_state();
            self.mark_connected(&link.peer_id, false);
        }
        if let Some(previous) = self.connecting.take() {
            if previous != peer_id {
                if let Err(e) = self.radio.cancel_connection(&previous) {
                    warn!("Cancel connection to {} failed: {}", previous, e);
                }
            }
        }

        self.radio
            .connect(peer_id)
            .map_err(|e| MessagingError::ConnectFailed(e.to_string()))?;
        info!("Connecting to {}", peer_id);
        self.connecting = Some(peer_id.to_string());
        Ok(())
    }

    /// Request disconnection; state is cleared when the radio confirms
    pub fn disconnect(&mut self, peer_id: &str) -> Result<(), MessagingError> {
        if peer_id.is_empty() {
            return Err(MessagingError::MissingArgs("uuid"));
        }
        let linked = self.connected_peer() == Some(peer_id);
        let pending = self.connecting.as_deref() == Some(peer_id);
        if !linked && !pending {
            return Err(MessagingError::NotConnectedOrNoChannel);
        }
        info!("Disconnecting from {}", peer_id);
        self.radio
            .cancel_connection(peer_id)
            .map_err(|e| MessagingError::StopFailed(e.to_string()))
    }

    /// Start sending `text` to the connected peer, replacing any message
    /// still in flight.
    pub fn send_message(&mut self, to: &str, text: String) -> Result<(), MessagingError> {
        if to.is_empty() {
            return Err(MessagingError::MissingArgs("to"));
        }
        match &self.link {
            Some(link) if link.peer_id == to && link.characteristic_ready => {}
            _ => {
                warn!("Cannot send to {}: no usable link", to);
                return Err(MessagingError::NotConnectedOrNoChannel);
            }
        }

        if let Some(previous) = self.outbound.take() {
            debug!(
                "Dropping in-flight message at {}/{} bytes",
                previous.offset(),
                previous.len()
            );
        }
        debug!("Sending {} bytes to {}", text.len(), to);
        self.outbound = Some(SendCursor::new(text));
        self.pump();
        Ok(())
    }

    /// Fail a scan request still waiting on the adapter
    pub fn abort_pending(&mut self, error: MessagingError) {
        self.gate.cancel(error);
    }

    /// Stop scanning, drop the link and every buffer
    pub fn cleanup(&mut self) {
        if let Err(e) = self.stop_scan() {
            warn!("Stop scan during cleanup failed: {}", e);
        }
        if let Some(peer) = self.connecting.take() {
            if let Err(e) = self.radio.cancel_connection(&peer) {
                warn!("Cancel connection to {} failed: {}", peer, e);
            }
        }
        if let Some(link) = self.link.take() {
            if link.notifying {
                if let Err(e) =
                    self.radio
                        .set_notify(&link.peer_id, self.identity.characteristic, false)
                {
                    warn!("Disabling notifications on {} failed: {}", link.peer_id, e);
                }
            }
            if let Err(e) = self.radio.cancel_connection(&link.peer_id) {
                warn!("Cancel connection to {} failed: {}", link.peer_id, e);
            }
        }
        self.reset_link_state();
        self.discovered.clear();
    }

    pub fn handle_event(&mut self, event: CentralEvent) {
        debug!("Central event: {}", event);
        match event {
            CentralEvent::AdapterStateChanged(state) => {
                if state != AdapterState::PoweredOn && self.scanning {
                    self.scanning = false;
                    self.scan_timer = None;
                    self.discovered.clear();
                    self.sink.emit(MessagingEvent::ScanStopped);
                }
                if let GateDecision::Proceed(intent) = self.gate.on_state_changed(state) {
                    self.perform_scan(intent);
                }
            }
            CentralEvent::PeerDiscovered { peer_id, rssi } => self.on_discovered(peer_id, rssi),
            CentralEvent::ScanFailed { reason } => {
                warn!("Scan failed: {}", reason);
                self.scanning = false;
                self.scan_timer = None;
                self.sink.emit(MessagingEvent::ScanFailed { reason });
            }
            CentralEvent::Connected { peer_id } => self.on_connected(peer_id),
            CentralEvent::ConnectFailed { peer_id, reason } => {
                warn!(
                    "Connection to {} failed: {}",
                    peer_id,
                    reason.as_deref().unwrap_or("unknown")
                );
                self.on_link_lost(peer_id);
            }
            CentralEvent::Disconnected { peer_id, reason } => {
                info!(
                    "Disconnected from {} ({})",
                    peer_id,
                    reason.as_deref().unwrap_or("requested")
                );
                self.on_link_lost(peer_id);
            }
            CentralEvent::ServicesDiscovered { peer_id, result } => {
                self.on_services(&peer_id, result)
            }
            CentralEvent::CharacteristicsDiscovered {
                peer_id,
                service,
                result,
            } => self.on_characteristics(&peer_id, service, result),
            CentralEvent::NotificationStateChanged {
                peer_id,
                characteristic,
                result,
            } => {
                let Some(link) = self.link_for(&peer_id) else {
                    return;
                };
                match result {
                    Ok(enabled) => {
                        link.notifying = enabled;
                        info!(
                            "Notifications on {} for {} {}",
                            characteristic,
                            peer_id,
                            if enabled { "enabled" } else { "disabled" }
                        );
                    }
                    Err(reason) => warn!("Enabling notifications on {} failed: {}", peer_id, reason),
                }
            }
            CentralEvent::ValueUpdated {
                peer_id,
                characteristic,
                value,
            } => {
                if characteristic != self.identity.characteristic
                    || self.connected_peer() != Some(peer_id.as_str())
                {
                    debug!("Ignoring value from {} on {}", peer_id, characteristic);
                    return;
                }
                if let Some(message) = self.inbound.push(&value) {
                    info!("Message of {} bytes from {}", message.len(), peer_id);
                    self.sink
                        .emit(MessagingEvent::message_received(peer_id, message));
                }
            }
            CentralEvent::MtuChanged {
                peer_id,
                max_write_len,
            } => {
                if let Some(link) = self.link_for(&peer_id) {
                    debug!("Max write length for {} is {}", peer_id, max_write_len);
                    link.max_write_len = Some(max_write_len);
                }
            }
            CentralEvent::ReadyToWrite { peer_id } => {
                if self.connected_peer() == Some(peer_id.as_str()) {
                    self.pump();
                }
            }
        }
    }

    fn on_discovered(&mut self, peer_id: String, rssi: i16) {
        if !self.scanning {
            debug!("Ignoring late discovery of {}", peer_id);
            return;
        }
        if let Some(record) = self.discovered.get_mut(&peer_id) {
            record.rssi = rssi;
            return;
        }

        info!("Discovered {} (rssi {})", peer_id, rssi);
        let connected = self.connected_peer() == Some(peer_id.as_str());
        self.discovered.insert(
            peer_id.clone(),
            PeerRecord {
                id: peer_id.clone(),
                rssi,
                connected,
            },
        );
        self.sink.emit(MessagingEvent::DeviceFound {
            uuid: peer_id,
            rssi,
        });
    }

    fn on_connected(&mut self, peer_id: String) {
        if self.connecting.as_deref() == Some(peer_id.as_str()) {
            self.connecting = None;
        }
        info!("Connected to {}", peer_id);
        self.reset_link_state();
        self.link = Some(Link::new(peer_id.clone(), self.identity.service));
        self.mark_connected(&peer_id, true);
        self.sink.emit(MessagingEvent::DeviceConnected {
            uuid: peer_id.clone(),
        });

        if let Err(e) = self.radio.discover_services(&peer_id, self.identity.service) {
            warn!("Service discovery on {} failed: {}", peer_id, e);
        }
    }

    fn on_link_lost(&mut self, peer_id: String) {
        if self.connecting.as_deref() == Some(peer_id.as_str()) {
            self.connecting = None;
        }
        if self.connected_peer() == Some(peer_id.as_str()) {
            self.link = None;
            self.reset_link_state();
        }
        self.mark_connected(&peer_id, false);
        self.sink
            .emit(MessagingEvent::DeviceDisconnected { uuid: peer_id });
    }

    fn on_services(&mut self, peer_id: &str, result: Result<Vec<Uuid>, String>) {
        let characteristic = self.identity.characteristic;
        let Some(link) = self.link_for(peer_id) else {
            return;
        };
        let service = link.service;
        match result {
            Ok(services) if services.contains(&service) => {
                if let Err(e) = self
                    .radio
                    .discover_characteristics(peer_id, service, characteristic)
                {
                    warn!("Characteristic discovery on {} failed: {}", peer_id, e);
                }
            }
            Ok(_) => warn!("Peer {} does not expose service {}", peer_id, service),
            Err(reason) => warn!("Service discovery on {} failed: {}", peer_id, reason),
        }
    }

    fn on_characteristics(
        &mut self,
        peer_id: &str,
        service: Uuid,
        result: Result<Vec<DiscoveredCharacteristic>, String>,
    ) {
        let wanted = self.identity.characteristic;
        let Some(link) = self.link_for(peer_id) else {
            return;
        };
        if link.service != service {
            return;
        }

        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(reason) => {
                warn!("Characteristic discovery on {} failed: {}", peer_id, reason);
                return;
            }
        };
        let Some(found) = characteristics.iter().find(|c| c.uuid == wanted) else {
            warn!("Peer {} lacks characteristic {}", peer_id, wanted);
            return;
        };

        link.characteristic_ready = true;
        info!("Link to {} ready", peer_id);
        if found.properties.notify {
            if let Err(e) = self.radio.set_notify(peer_id, wanted, true) {
                warn!("Enabling notifications on {} failed: {}", peer_id, e);
            }
        } else {
            warn!("Characteristic {} on {} does not notify", wanted, peer_id);
        }
    }

    fn link_for(&mut self, peer_id: &str) -> Option<&mut Link> {
        self.link.as_mut().filter(|l| l.peer_id == peer_id)
    }

    fn mark_connected(&mut self, peer_id: &str, connected: bool) {
        if let Some(record) = self.discovered.get_mut(peer_id) {
            record.connected = connected;
        }
    }

    fn reset_link_state(&mut self) {
        let discarded = self.inbound.clear();
        if discarded > 0 {
            warn!("Discarding {} bytes of partial message", discarded);
        }
        if self.outbound.take().is_some() {
            warn!("Link lost mid-message, outbound message dropped");
        }
    }

    fn pump(&mut self) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        let Some(cursor) = self.outbound.as_mut() else {
            return;
        };
        let max = chunk_size(self.max_chunk_bytes, link.max_write_len);
        let radio = &mut self.radio;
        let peer_id = link.peer_id.as_str();
        let characteristic = self.identity.characteristic;
        let mut sink =
            |chunk: &[u8]| radio.write_without_response(peer_id, characteristic, chunk);

        if cursor.drain(&mut sink, max) == DrainOutcome::Complete {
            debug!("Outbound message complete");
            self.outbound = None;
        }
    }
}
