/// In-memory radio pair for tests and demos
///
/// [`LoopbackAir`] plays the part of the 2.4 GHz band: one peripheral and any
/// number of centrals share it, and every operation is answered with the
/// events a real stack would post. An optional write window makes the
/// transmit queues refuse chunks so backpressure paths get exercised.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::gate::AdapterState;
use super::gatt::{CharacteristicProperties, DiscoveredCharacteristic, ServiceIdentity};
use super::radio::{
    CentralEvent, CentralRadio, PeripheralEvent, PeripheralRadio, RadioError, RadioEventSender,
};

/// Signal strength reported for every loopback discovery
pub const LOOPBACK_RSSI: i16 = -42;

struct PeripheralNode {
    id: String,
    events: RadioEventSender<PeripheralEvent>,
    services: Vec<ServiceIdentity>,
    advertising: Option<Uuid>,
    credits: usize,
}

struct CentralNode {
    events: RadioEventSender<CentralEvent>,
    scanning: Option<Uuid>,
    connected_to: Option<String>,
    subscribed: bool,
    credits: usize,
}

struct AirState {
    adapter: AdapterState,
    /// Chunks a queue accepts before refusing once; `None` never refuses
    write_window: Option<usize>,
    max_update_len: usize,
    peripheral: Option<PeripheralNode>,
    centrals: HashMap<String, CentralNode>,
}

impl AirState {
    fn ensure_on(&self) -> Result<(), RadioError> {
        if self.adapter == AdapterState::PoweredOn {
            Ok(())
        } else {
            Err(RadioError::NotReady(self.adapter))
        }
    }

    fn window(&self) -> usize {
        self.write_window.unwrap_or(usize::MAX)
    }

    /// Tell scanning centrals about the advertiser, if it matches their filter
    fn announce(&self) {
        let Some(peripheral) = &self.peripheral else {
            return;
        };
        let Some(advertised) = peripheral.advertising else {
            return;
        };
        for central in self.centrals.values() {
            if central.scanning == Some(advertised) {
                central.events.post(CentralEvent::PeerDiscovered {
                    peer_id: peripheral.id.clone(),
                    rssi: LOOPBACK_RSSI,
                });
            }
        }
    }

    fn sever(&mut self, central_id: &str, reason: Option<String>) {
        let Some(central) = self.centrals.get_mut(central_id) else {
            return;
        };
        let Some(peer_id) = central.connected_to.take() else {
            return;
        };
        let was_subscribed = std::mem::replace(&mut central.subscribed, false);
        central
            .events
            .post(CentralEvent::Disconnected { peer_id, reason });
        if was_subscribed {
            if let Some(peripheral) = &self.peripheral {
                peripheral.events.post(PeripheralEvent::Unsubscribed {
                    central_id: central_id.to_string(),
                });
            }
        }
    }
}

/// Shared medium connecting loopback radios
#[derive(Clone)]
pub struct LoopbackAir {
    state: Arc<Mutex<AirState>>,
}

impl Default for LoopbackAir {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackAir {
    /// Powered-off air with unlimited queues and 20-byte updates
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AirState {
                adapter: AdapterState::PoweredOff,
                write_window: None,
                max_update_len: 20,
                peripheral: None,
                centrals: HashMap::new(),
            })),
        }
    }

    /// Refuse every `window + 1`-th chunk on each transmit queue
    pub fn with_write_window(self, window: usize) -> Self {
        self.state.lock().write_window = Some(window.max(1));
        self
    }

    /// Negotiated update/write length reported on subscribe and connect
    pub fn with_max_update_len(self, len: usize) -> Self {
        self.state.lock().max_update_len = len.max(1);
        self
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.state.lock().adapter
    }

    /// Change the adapter state seen by every attached radio
    pub fn set_adapter_state(&self, adapter: AdapterState) {
        let mut state = self.state.lock();
        state.adapter = adapter;
        if adapter != AdapterState::PoweredOn {
            if let Some(peripheral) = state.peripheral.as_mut() {
                peripheral.advertising = None;
                peripheral.services.clear();
            }
            let ids: Vec<String> = state.centrals.keys().cloned().collect();
            for id in ids {
                state.sever(&id, Some("adapter off".to_string()));
                if let Some(central) = state.centrals.get_mut(&id) {
                    central.scanning = None;
                }
            }
        }
        if let Some(peripheral) = &state.peripheral {
            peripheral
                .events
                .post(PeripheralEvent::AdapterStateChanged(adapter));
        }
        for central in state.centrals.values() {
            central.events.post(CentralEvent::AdapterStateChanged(adapter));
        }
    }

    pub fn power_on(&self) {
        self.set_adapter_state(AdapterState::PoweredOn);
    }

    pub fn power_off(&self) {
        self.set_adapter_state(AdapterState::PoweredOff);
    }

    /// Drop the link of `central_id` as if the peer walked out of range
    pub fn drop_link(&self, central_id: &str) {
        self.state
            .lock()
            .sever(central_id, Some("link lost".to_string()));
    }

    /// Attach the peripheral radio. The current adapter state is posted at once.
    pub fn peripheral_radio(
        &self,
        id: impl Into<String>,
        events: RadioEventSender<PeripheralEvent>,
    ) -> LoopbackPeripheral {
        let id = id.into();
        let mut state = self.state.lock();
        events.post(PeripheralEvent::AdapterStateChanged(state.adapter));
        let credits = state.window();
        state.peripheral = Some(PeripheralNode {
            id: id.clone(),
            events,
            services: Vec::new(),
            advertising: None,
            credits,
        });
        LoopbackPeripheral {
            id,
            air: self.clone(),
        }
    }

    /// Attach a central radio. The current adapter state is posted at once.
    pub fn central_radio(
        &self,
        id: impl Into<String>,
        events: RadioEventSender<CentralEvent>,
    ) -> LoopbackCentral {
        let id = id.into();
        let mut state = self.state.lock();
        events.post(CentralEvent::AdapterStateChanged(state.adapter));
        let credits = state.window();
        state.centrals.insert(
            id.clone(),
            CentralNode {
                events,
                scanning: None,
                connected_to: None,
                subscribed: false,
                credits,
            },
        );
        LoopbackCentral {
            id,
            air: self.clone(),
        }
    }
}

pub struct LoopbackPeripheral {
    id: String,
    air: LoopbackAir,
}

impl LoopbackPeripheral {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl PeripheralRadio for LoopbackPeripheral {
    fn add_service(&mut self, identity: &ServiceIdentity) -> Result<(), RadioError> {
        let mut state = self.air.state.lock();
        state.ensure_on()?;
        let peripheral = state
            .peripheral
            .as_mut()
            .ok_or_else(|| RadioError::Platform("peripheral detached".to_string()))?;
        peripheral.services.retain(|s| s.service != identity.service);
        peripheral.services.push(*identity);
        peripheral.events.post(PeripheralEvent::ServiceAdded(Ok(())));
        Ok(())
    }

    fn remove_services(&mut self) {
        if let Some(peripheral) = self.air.state.lock().peripheral.as_mut() {
            peripheral.services.clear();
        }
    }

    fn start_advertising(&mut self, service: Uuid) -> Result<(), RadioError> {
        let mut state = self.air.state.lock();
        state.ensure_on()?;
        let peripheral = state
            .peripheral
            .as_mut()
            .ok_or_else(|| RadioError::Platform("peripheral detached".to_string()))?;
        peripheral.advertising = Some(service);
        peripheral
            .events
            .post(PeripheralEvent::AdvertisingStarted(Ok(())));
        state.announce();
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), RadioError> {
        if let Some(peripheral) = self.air.state.lock().peripheral.as_mut() {
            peripheral.advertising = None;
        }
        Ok(())
    }

    fn notify(&mut self, characteristic: Uuid, value: &[u8]) -> bool {
        let mut state = self.air.state.lock();
        let window = state.window();
        let Some(peripheral) = state.peripheral.as_mut() else {
            return true;
        };
        if peripheral.credits == 0 {
            peripheral.credits = window;
            peripheral
                .events
                .post(PeripheralEvent::ReadyToUpdateSubscribers);
            return false;
        }
        peripheral.credits -= 1;

        let peer_id = peripheral.id.clone();
        for central in state.centrals.values() {
            if central.subscribed && central.connected_to.as_deref() == Some(peer_id.as_str()) {
                central.events.post(CentralEvent::ValueUpdated {
                    peer_id: peer_id.clone(),
                    characteristic,
                    value: value.to_vec(),
                });
            }
        }
        true
    }
}

pub struct LoopbackCentral {
    id: String,
    air: LoopbackAir,
}

impl LoopbackCentral {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn with_node<T>(
        &self,
        f: impl FnOnce(&mut AirState) -> Result<T, RadioError>,
    ) -> Result<T, RadioError> {
        let mut state = self.air.state.lock();
        if !state.centrals.contains_key(&self.id) {
            return Err(RadioError::Platform("central detached".to_string()));
        }
        f(&mut *state)
    }
}

fn advertiser<'a>(state: &'a AirState, peer_id: &str) -> Result<&'a PeripheralNode, RadioError> {
    state
        .peripheral
        .as_ref()
        .filter(|p| p.id == peer_id)
        .ok_or_else(|| RadioError::UnknownPeer(peer_id.to_string()))
}

impl CentralRadio for LoopbackCentral {
    fn start_scan(&mut self, service: Uuid, _allow_duplicates: bool) -> Result<(), RadioError> {
        let id = self.id.clone();
        self.with_node(|state| {
            state.ensure_on()?;
            if let Some(central) = state.centrals.get_mut(&id) {
                central.scanning = Some(service);
            }
            state.announce();
            Ok(())
        })
    }

    fn stop_scan(&mut self) -> Result<(), RadioError> {
        let id = self.id.clone();
        self.with_node(|state| {
            if let Some(central) = state.centrals.get_mut(&id) {
                central.scanning = None;
            }
            Ok(())
        })
    }

    fn connect(&mut self, peer_id: &str) -> Result<(), RadioError> {
        let id = self.id.clone();
        self.with_node(|state| {
            state.ensure_on()?;
            let reachable = advertiser(state, peer_id).is_ok_and(|p| p.advertising.is_some());
            let max_write_len = state.max_update_len;
            let Some(central) = state.centrals.get_mut(&id) else {
                return Ok(());
            };
            if reachable {
                central.connected_to = Some(peer_id.to_string());
                central.events.post(CentralEvent::Connected {
                    peer_id: peer_id.to_string(),
                });
                central.events.post(CentralEvent::MtuChanged {
                    peer_id: peer_id.to_string(),
                    max_write_len,
                });
            } else {
                central.events.post(CentralEvent::ConnectFailed {
                    peer_id: peer_id.to_string(),
                    reason: Some("peer not advertising".to_string()),
                });
            }
            Ok(())
        })
    }

    fn cancel_connection(&mut self, peer_id: &str) -> Result<(), RadioError> {
        let id = self.id.clone();
        self.with_node(|state| {
            let linked = state
                .centrals
                .get(&id)
                .is_some_and(|c| c.connected_to.as_deref() == Some(peer_id));
            if !linked {
                return Err(RadioError::UnknownPeer(peer_id.to_string()));
            }
            state.sever(&id, None);
            Ok(())
        })
    }

    fn discover_services(&mut self, peer_id: &str, _service: Uuid) -> Result<(), RadioError> {
        let id = self.id.clone();
        self.with_node(|state| {
            let services: Vec<Uuid> = advertiser(state, peer_id)?
                .services
                .iter()
                .map(|s| s.service)
                .collect();
            if let Some(central) = state.centrals.get(&id) {
                central.events.post(CentralEvent::ServicesDiscovered {
                    peer_id: peer_id.to_string(),
                    result: Ok(services),
                });
            }
            Ok(())
        })
    }

    fn discover_characteristics(
        &mut self,
        peer_id: &str,
        service: Uuid,
        _characteristic: Uuid,
    ) -> Result<(), RadioError> {
        let id = self.id.clone();
        self.with_node(|state| {
            let characteristics: Vec<DiscoveredCharacteristic> = advertiser(state, peer_id)?
                .services
                .iter()
                .filter(|s| s.service == service)
                .map(|s| DiscoveredCharacteristic {
                    uuid: s.characteristic,
                    properties: CharacteristicProperties::messaging(),
                })
                .collect();
            if let Some(central) = state.centrals.get(&id) {
                central.events.post(CentralEvent::CharacteristicsDiscovered {
                    peer_id: peer_id.to_string(),
                    service,
                    result: Ok(characteristics),
                });
            }
            Ok(())
        })
    }

    fn set_notify(
        &mut self,
        peer_id: &str,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), RadioError> {
        let id = self.id.clone();
        self.with_node(|state| {
            let max_update_len = state.max_update_len;
            advertiser(state, peer_id)?;
            let Some(central) = state.centrals.get_mut(&id) else {
                return Ok(());
            };
            if central.connected_to.as_deref() != Some(peer_id) {
                return Err(RadioError::UnknownPeer(peer_id.to_string()));
            }
            let changed = central.subscribed != enabled;
            central.subscribed = enabled;
            central.events.post(CentralEvent::NotificationStateChanged {
                peer_id: peer_id.to_string(),
                characteristic,
                result: Ok(enabled),
            });

            if changed {
                if let Some(peripheral) = &state.peripheral {
                    let event = if enabled {
                        PeripheralEvent::Subscribed {
                            central_id: id.clone(),
                            max_update_len,
                        }
                    } else {
                        PeripheralEvent::Unsubscribed {
                            central_id: id.clone(),
                        }
                    };
                    peripheral.events.post(event);
                }
            }
            Ok(())
        })
    }

    fn write_without_response(&mut self, peer_id: &str, characteristic: Uuid, value: &[u8]) -> bool {
        let mut state = self.air.state.lock();
        let window = state.window();
        let Some(central) = state.centrals.get_mut(&self.id) else {
            return true;
        };
        if central.connected_to.as_deref() != Some(peer_id) {
            debug!("Write to {} dropped, no link", peer_id);
            return true;
        }
        if central.credits == 0 {
            central.credits = window;
            central.events.post(CentralEvent::ReadyToWrite {
                peer_id: peer_id.to_string(),
            });
            return false;
        }
        central.credits -= 1;

        if let Some(peripheral) = &state.peripheral {
            peripheral.events.post(PeripheralEvent::WriteReceived {
                central_id: self.id.clone(),
                characteristic,
                value: value.to_vec(),
            });
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::gatt::{CHARACTERISTIC_UUID, SERVICE_UUID};
    use crate::transport::ble::radio::radio_event_channel;

    #[test]
    fn test_attach_posts_adapter_state() {
        let air = LoopbackAir::new();
        let (tx, mut rx) = radio_event_channel();
        let _central = air.central_radio("C", tx);
        assert_eq!(
            rx.try_recv().unwrap(),
            CentralEvent::AdapterStateChanged(AdapterState::PoweredOff)
        );

        air.power_on();
        assert_eq!(
            rx.try_recv().unwrap(),
            CentralEvent::AdapterStateChanged(AdapterState::PoweredOn)
        );
    }

    #[test]
    fn test_operations_refused_while_off() {
        let air = LoopbackAir::new();
        let (tx, _rx) = radio_event_channel();
        let mut peripheral = air.peripheral_radio("P", tx);
        assert_eq!(
            peripheral.start_advertising(SERVICE_UUID),
            Err(RadioError::NotReady(AdapterState::PoweredOff))
        );
    }

    #[test]
    fn test_scan_sees_advertiser() {
        let air = LoopbackAir::new();
        air.power_on();
        let (ptx, _prx) = radio_event_channel();
        let (ctx, mut crx) = radio_event_channel();
        let mut peripheral = air.peripheral_radio("P", ptx);
        let mut central = air.central_radio("C", ctx);
        crx.try_recv().unwrap();

        peripheral
            .add_service(&ServiceIdentity::default())
            .unwrap();
        peripheral.start_advertising(SERVICE_UUID).unwrap();
        central.start_scan(SERVICE_UUID, true).unwrap();
        assert_eq!(
            crx.try_recv().unwrap(),
            CentralEvent::PeerDiscovered {
                peer_id: "P".to_string(),
                rssi: LOOPBACK_RSSI
            }
        );

        // Different filter sees nothing
        central.start_scan(Uuid::nil(), true).unwrap();
        assert!(crx.try_recv().is_err());
    }

    #[test]
    fn test_write_window_refuses_then_signals_ready() {
        let air = LoopbackAir::new().with_write_window(2);
        air.power_on();
        let (ptx, _prx) = radio_event_channel();
        let (ctx, mut crx) = radio_event_channel();
        let mut peripheral = air.peripheral_radio("P", ptx);
        let mut central = air.central_radio("C", ctx);
        peripheral.start_advertising(SERVICE_UUID).unwrap();
        central.connect("P").unwrap();
        while crx.try_recv().is_ok() {}

        assert!(central.write_without_response("P", CHARACTERISTIC_UUID, b"a"));
        assert!(central.write_without_response("P", CHARACTERISTIC_UUID, b"b"));
        assert!(!central.write_without_response("P", CHARACTERISTIC_UUID, b"c"));
        assert_eq!(
            crx.try_recv().unwrap(),
            CentralEvent::ReadyToWrite {
                peer_id: "P".to_string()
            }
        );
        assert!(central.write_without_response("P", CHARACTERISTIC_UUID, b"c"));
    }

    #[test]
    fn test_drop_link_notifies_both_sides() {
        let air = LoopbackAir::new();
        air.power_on();
        let (ptx, mut prx) = radio_event_channel();
        let (ctx, mut crx) = radio_event_channel();
        let mut peripheral = air.peripheral_radio("P", ptx);
        let mut central = air.central_radio("C", ctx);
        peripheral
            .add_service(&ServiceIdentity::default())
            .unwrap();
        peripheral.start_advertising(SERVICE_UUID).unwrap();
        central.connect("P").unwrap();
        central.set_notify("P", CHARACTERISTIC_UUID, true).unwrap();
        while crx.try_recv().is_ok() {}
        while prx.try_recv().is_ok() {}

        air.drop_link("C");
        assert!(matches!(
            crx.try_recv().unwrap(),
            CentralEvent::Disconnected { .. }
        ));
        assert_eq!(
            prx.try_recv().unwrap(),
            PeripheralEvent::Unsubscribed {
                central_id: "C".to_string()
            }
        );
    }
}
