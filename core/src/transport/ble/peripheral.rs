/// Peripheral role: GATT server, advertiser, per-central reassembly
///
/// The controller is a plain state machine. It is driven by caller operations
/// and by [`PeripheralEvent`]s from the platform radio, both delivered on the
/// same runtime task, so none of its state needs a lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventSink, MessagingEvent};
use super::framing::{chunk_size, DrainOutcome, Reassembler, SendCursor};
use super::gate::{GateDecision, IntentKind, PendingIntent, RadioGate, Responder};
use super::gatt::{parse_service_uuid, ServiceIdentity};
use super::radio::{PeripheralEvent, PeripheralRadio};
use crate::config::MessagingConfig;
use crate::MessagingError;

/// A central subscribed to the message characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    pub id: String,
    /// Largest notification payload the link accepts
    pub max_update_len: usize,
}

pub struct PeripheralController {
    identity: ServiceIdentity,
    max_chunk_bytes: usize,
    radio: Box<dyn PeripheralRadio>,
    sink: Arc<dyn EventSink>,
    gate: RadioGate<Uuid>,
    service_published: bool,
    advertising: bool,
    subscribers: HashMap<String, SubscriberRecord>,
    /// Last subscriber; the target of outbound messages
    active_subscriber: Option<String>,
    inbound: HashMap<String, Reassembler>,
    outbound: Option<SendCursor>,
}

impl PeripheralController {
    pub fn new(
        config: &MessagingConfig,
        radio: Box<dyn PeripheralRadio>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            identity: config.identity(),
            max_chunk_bytes: config.max_chunk_bytes,
            radio,
            sink,
            gate: RadioGate::new(),
            service_published: false,
            advertising: false,
            subscribers: HashMap::new(),
            active_subscriber: None,
            inbound: HashMap::new(),
            outbound: None,
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn identity(&self) -> ServiceIdentity {
        self.identity
    }

    pub fn subscribers(&self) -> Vec<SubscriberRecord> {
        self.subscribers.values().cloned().collect()
    }

    pub fn active_subscriber(&self) -> Option<&str> {
        self.active_subscriber.as_deref()
    }

    /// Whether an outbound message is still being drained
    pub fn is_sending(&self) -> bool {
        self.outbound.is_some()
    }

    /// Validate the service UUID and hand the request to the radio gate.
    /// `responder` is settled once the adapter reaches a decisive state.
    pub fn start_advertising(&mut self, service_uuid: &str, responder: Responder) {
        let service = match parse_service_uuid(service_uuid) {
            Ok(service) => service,
            Err(e) => {
                let _ = responder.send(Err(e));
                return;
            }
        };

        let intent = PendingIntent::new(IntentKind::StartAdvertising, service, responder);
        if let GateDecision::Proceed(intent) = self.gate.register(intent) {
            self.perform_advertise(intent);
        }
    }

    fn perform_advertise(&mut self, intent: PendingIntent<Uuid>) {
        let service = *intent.params();

        if !self.service_published || self.identity.service != service {
            if self.service_published {
                self.radio.remove_services();
                self.service_published = false;
            }
            self.identity = self.identity.with_service(service);
            if let Err(e) = self.radio.add_service(&self.identity) {
                warn!("Failed to publish GATT service {}: {}", service, e);
                intent.fail(MessagingError::AdvertiseStartFailed(e.to_string()));
                return;
            }
            self.service_published = true;
            debug!("Published service {} / {}", service, self.identity.characteristic);
        }

        match self.radio.start_advertising(service) {
            Ok(()) => {
                info!("Advertising requested for service {}", service);
                intent.resolve();
            }
            Err(e) => {
                warn!("Failed to start advertising: {}", e);
                intent.fail(MessagingError::AdvertiseStartFailed(e.to_string()));
            }
        }
    }

    /// Stop advertising. Always succeeds and always emits the stopped event.
    pub fn stop_advertising(&mut self) {
        self.gate.cancel(MessagingError::Cancelled);
        if let Err(e) = self.radio.stop_advertising() {
            warn!("Stop advertising reported: {}", e);
        }
        self.advertising = false;
        info!("Advertising stopped");
        self.sink.emit(MessagingEvent::AdvertisingStopped);
    }

    /// Start sending `text` to the active subscriber, replacing any message
    /// still in flight.
    pub fn send_message(&mut self, to: &str, text: String) -> Result<(), MessagingError> {
        if to.is_empty() {
            return Err(MessagingError::MissingArgs("to"));
        }
        if !self.service_published || self.active_subscriber.as_deref() != Some(to) {
            warn!("Cannot send to {}: not the subscribed central", to);
            return Err(MessagingError::NotConnectedOrNoChannel);
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

    /// Fail a start request still waiting on the adapter
    pub fn abort_pending(&mut self, error: MessagingError) {
        self.gate.cancel(error);
    }

    /// Tear down advertising and every piece of per-central state
    /// Emits the stopped event only when there was something to stop.
    pub fn cleanup(&mut self) {
        if self.advertising || self.service_published || self.gate.has_pending() {
            self.stop_advertising();
        }
        if self.service_published {
            self.radio.remove_services();
            self.service_published = false;
        }
        for (id, mut buffer) in self.inbound.drain() {
            discard_partial(&id, &mut buffer);
        }
        self.subscribers.clear();
        self.active_subscriber = None;
        self.outbound = None;
    }

    pub fn handle_event(&mut self, event: PeripheralEvent) {
        debug!("Peripheral event: {}", event);
        match event {
            PeripheralEvent::AdapterStateChanged(state) => {
                if !state.is_decisive() || state.failure().is_some() {
                    self.radio_lost();
                }
                if let GateDecision::Proceed(intent) = self.gate.on_state_changed(state) {
                    self.perform_advertise(intent);
                }
            }
            PeripheralEvent::ServiceAdded(result) => {
                if let Err(reason) = result {
                    warn!("Service registration failed: {}", reason);
                    self.service_published = false;
                }
            }
            PeripheralEvent::AdvertisingStarted(Ok(())) => {
                self.advertising = true;
                info!("Advertising started");
                self.sink.emit(MessagingEvent::AdvertisingStarted);
            }
            PeripheralEvent::AdvertisingStarted(Err(reason)) => {
                self.advertising = false;
                warn!("Advertising failed: {}", reason);
                self.sink.emit(MessagingEvent::AdvertisingFailed { reason });
            }
            PeripheralEvent::Subscribed {
                central_id,
                max_update_len,
            } => {
                info!(
                    "Central {} subscribed (max update {} bytes)",
                    central_id, max_update_len
                );
                self.subscribers.insert(
                    central_id.clone(),
                    SubscriberRecord {
                        id: central_id.clone(),
                        max_update_len,
                    },
                );
                self.active_subscriber = Some(central_id.clone());
                self.sink
                    .emit(MessagingEvent::DeviceConnected { uuid: central_id });
            }
            PeripheralEvent::Unsubscribed { central_id } => {
                info!("Central {} unsubscribed", central_id);
                self.forget_central(&central_id);
                self.sink
                    .emit(MessagingEvent::DeviceDisconnected { uuid: central_id });
            }
            PeripheralEvent::WriteReceived {
                central_id,
                characteristic,
                value,
            } => {
                if characteristic != self.identity.characteristic {
                    debug!("Ignoring write to foreign characteristic {}", characteristic);
                    return;
                }
                debug!("Received {} bytes from {}", value.len(), central_id);
                let buffer = self.inbound.entry(central_id.clone()).or_default();
                if let Some(message) = buffer.push(&value) {
                    info!("Message of {} bytes from {}", message.len(), central_id);
                    self.sink
                        .emit(MessagingEvent::message_received(central_id, message));
                }
            }
            PeripheralEvent::ReadyToUpdateSubscribers => self.pump(),
        }
    }

    /// Drain the outbound cursor for as long as the radio accepts notifications
    fn pump(&mut self) {
        let reported = self
            .active_subscriber
            .as_ref()
            .and_then(|id| self.subscribers.get(id))
            .map(|s| s.max_update_len);
        let max = chunk_size(self.max_chunk_bytes, reported);

        let Some(cursor) = self.outbound.as_mut() else {
            return;
        };
        let radio = &mut self.radio;
        let characteristic = self.identity.characteristic;
        let mut sink = |chunk: &[u8]| radio.notify(characteristic, chunk);

        if cursor.drain(&mut sink, max) == DrainOutcome::Complete {
            debug!("Outbound message complete");
            self.outbound = None;
        }
    }

    fn forget_central(&mut self, central_id: &str) {
        self.subscribers.remove(central_id);
        if let Some(mut buffer) = self.inbound.remove(central_id) {
            discard_partial(central_id, &mut buffer);
        }
        if self.active_subscriber.as_deref() == Some(central_id) {
            self.active_subscriber = None;
            if self.outbound.take().is_some() {
                warn!("Central {} left mid-message, outbound message dropped", central_id);
            }
        }
    }

    /// The adapter went away: advertising, the published service and every
    /// subscription are gone with it.
    fn radio_lost(&mut self) {
        self.service_published = false;
        if self.advertising {
            self.advertising = false;
            self.sink.emit(MessagingEvent::AdvertisingStopped);
        }
        let ids: Vec<String> = self.subscribers.keys().cloned().collect();
        for id in ids {
            self.forget_central(&id);
            self.sink.emit(MessagingEvent::DeviceDisconnected { uuid: id });
        }
    }
}

fn discard_partial(peer: &str, buffer: &mut Reassembler) {
    let discarded = buffer.clear();
    if discarded > 0 {
        warn!("Discarding {} bytes of partial message from {}", discarded, peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::events::RecordingSink;
    use crate::transport::ble::framing::EOM;
    use crate::transport::ble::gate::AdapterState;
    use crate::transport::ble::gatt::CHARACTERISTIC_UUID;
    use crate::transport::ble::radio::RadioError;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct RadioLog {
        services: Vec<ServiceIdentity>,
        advertising: Option<Uuid>,
        advertise_calls: usize,
        notified: Vec<Vec<u8>>,
        /// Outcomes for upcoming notify calls; accepts once exhausted
        notify_script: Vec<bool>,
        fail_advertise: bool,
    }

    struct MockPeripheralRadio {
        log: Arc<Mutex<RadioLog>>,
    }

    impl PeripheralRadio for MockPeripheralRadio {
        fn add_service(&mut self, identity: &ServiceIdentity) -> Result<(), RadioError> {
            self.log.lock().services.push(*identity);
            Ok(())
        }

        fn remove_services(&mut self) {
            self.log.lock().services.clear();
        }

        fn start_advertising(&mut self, service: Uuid) -> Result<(), RadioError> {
            let mut log = self.log.lock();
            log.advertise_calls += 1;
            if log.fail_advertise {
                return Err(RadioError::Rejected("advertiser busy".to_string()));
            }
            log.advertising = Some(service);
            Ok(())
        }

        fn stop_advertising(&mut self) -> Result<(), RadioError> {
            self.log.lock().advertising = None;
            Ok(())
        }

        fn notify(&mut self, _characteristic: Uuid, value: &[u8]) -> bool {
            let mut log = self.log.lock();
            let ok = if log.notify_script.is_empty() {
                true
            } else {
                log.notify_script.remove(0)
            };
            if ok {
                log.notified.push(value.to_vec());
            }
            ok
        }
    }

    fn controller() -> (PeripheralController, Arc<Mutex<RadioLog>>, Arc<RecordingSink>) {
        let log = Arc::new(Mutex::new(RadioLog::default()));
        let sink = RecordingSink::new();
        let radio = MockPeripheralRadio { log: log.clone() };
        let controller =
            PeripheralController::new(&MessagingConfig::default(), Box::new(radio), sink.clone());
        (controller, log, sink)
    }

    fn write(central: &str, value: &[u8]) -> PeripheralEvent {
        PeripheralEvent::WriteReceived {
            central_id: central.to_string(),
            characteristic: CHARACTERISTIC_UUID,
            value: value.to_vec(),
        }
    }

    fn subscribe(controller: &mut PeripheralController, central: &str, mtu: usize) {
        controller.handle_event(PeripheralEvent::Subscribed {
            central_id: central.to_string(),
            max_update_len: mtu,
        });
    }

    fn powered_and_advertising(controller: &mut PeripheralController) {
        controller.handle_event(PeripheralEvent::AdapterStateChanged(AdapterState::PoweredOn));
        let (tx, _rx) = oneshot::channel();
        controller.start_advertising("E20A39F4-73F5-4BC4-A12F-17D1AD07A961", tx);
        controller.handle_event(PeripheralEvent::AdvertisingStarted(Ok(())));
    }

    #[test]
    fn test_invalid_uuid_rejected_synchronously() {
        let (mut controller, log, _sink) = controller();
        let (tx, mut rx) = oneshot::channel();
        controller.start_advertising("nope", tx);
        assert!(matches!(
            rx.try_recv().expect("settled"),
            Err(MessagingError::InvalidUuid(_))
        ));
        assert_eq!(log.lock().advertise_calls, 0);
    }

    #[test]
    fn test_powered_off_fails_without_advertising() {
        let (mut controller, log, _sink) = controller();
        let (tx, mut rx) = oneshot::channel();
        controller.start_advertising("180D", tx);
        assert!(rx.try_recv().is_err());

        controller.handle_event(PeripheralEvent::AdapterStateChanged(AdapterState::PoweredOff));
        assert_eq!(
            rx.try_recv().expect("settled"),
            Err(MessagingError::RadioUnavailable)
        );
        assert_eq!(log.lock().advertise_calls, 0);
        assert!(log.lock().services.is_empty());
        assert!(!controller.is_advertising());
    }

    #[test]
    fn test_powered_on_publishes_then_advertises() {
        let (mut controller, log, sink) = controller();
        let (tx, mut rx) = oneshot::channel();
        controller.start_advertising("180D", tx);
        controller.handle_event(PeripheralEvent::AdapterStateChanged(AdapterState::Resetting));
        controller.handle_event(PeripheralEvent::AdapterStateChanged(AdapterState::PoweredOn));

        assert_eq!(rx.try_recv().expect("settled"), Ok(()));
        let service = parse_service_uuid("180D").expect("valid");
        {
            let log = log.lock();
            assert_eq!(log.services.len(), 1);
            assert_eq!(log.services[0].service, service);
            assert_eq!(log.services[0].characteristic, CHARACTERISTIC_UUID);
            assert_eq!(log.advertising, Some(service));
        }

        assert!(!controller.is_advertising());
        controller.handle_event(PeripheralEvent::AdvertisingStarted(Ok(())));
        assert!(controller.is_advertising());
        assert_eq!(sink.count("onAdvertisingStarted"), 1);
    }

    #[test]
    fn test_low_level_start_failure_fails_intent() {
        let (mut controller, log, _sink) = controller();
        log.lock().fail_advertise = true;
        controller.handle_event(PeripheralEvent::AdapterStateChanged(AdapterState::PoweredOn));

        let (tx, mut rx) = oneshot::channel();
        controller.start_advertising("180D", tx);
        assert!(matches!(
            rx.try_recv().expect("settled"),
            Err(MessagingError::AdvertiseStartFailed(_))
        ));
    }

    #[test]
    fn test_async_advertising_failure_emits_event() {
        let (mut controller, _log, sink) = controller();
        controller.handle_event(PeripheralEvent::AdvertisingStarted(Err(
            "too many advertisers".to_string(),
        )));
        assert!(!controller.is_advertising());
        assert_eq!(
            sink.events(),
            vec![MessagingEvent::AdvertisingFailed {
                reason: "too many advertisers".to_string()
            }]
        );
    }

    #[test]
    fn test_stop_advertising_is_idempotent() {
        let (mut controller, _log, sink) = controller();
        controller.stop_advertising();
        controller.stop_advertising();
        assert_eq!(sink.count("onAdvertisingStopped"), 2);
        assert!(!controller.is_advertising());
    }

    #[test]
    fn test_stop_cancels_pending_intent() {
        let (mut controller, _log, _sink) = controller();
        let (tx, mut rx) = oneshot::channel();
        controller.start_advertising("180D", tx);
        controller.stop_advertising();
        assert_eq!(
            rx.try_recv().expect("settled"),
            Err(MessagingError::Cancelled)
        );
    }

    #[test]
    fn test_interleaved_writers_stay_independent() {
        let (mut controller, _log, sink) = controller();

        controller.handle_event(write("A", b"hello "));
        controller.handle_event(write("B", b"good"));
        controller.handle_event(write("A", b"from A"));
        controller.handle_event(write("B", b"bye from B"));
        controller.handle_event(write("B", EOM));
        controller.handle_event(write("A", EOM));

        let messages: Vec<(String, String)> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MessagingEvent::MessageReceived { from, message, .. } => Some((from, message)),
                _ => None,
            })
            .collect();
        assert_eq!(
            messages,
            vec![
                ("B".to_string(), "goodbye from B".to_string()),
                ("A".to_string(), "hello from A".to_string()),
            ]
        );
    }

    #[test]
    fn test_foreign_characteristic_writes_ignored() {
        let (mut controller, _log, sink) = controller();
        controller.handle_event(PeripheralEvent::WriteReceived {
            central_id: "A".to_string(),
            characteristic: Uuid::nil(),
            value: EOM.to_vec(),
        });
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_send_requires_subscriber() {
        let (mut controller, _log, _sink) = controller();
        powered_and_advertising(&mut controller);

        assert_eq!(
            controller.send_message("A", "hi".to_string()),
            Err(MessagingError::NotConnectedOrNoChannel)
        );
        assert_eq!(
            controller.send_message("", "hi".to_string()),
            Err(MessagingError::MissingArgs("to"))
        );
    }

    #[test]
    fn test_send_uses_subscriber_mtu_and_backpressure() {
        let (mut controller, log, _sink) = controller();
        powered_and_advertising(&mut controller);
        subscribe(&mut controller, "A", 4);

        log.lock().notify_script = vec![true, true, false];
        controller
            .send_message("A", "aaaabbbbccccddddeeee".to_string())
            .expect("send accepted");
        assert_eq!(log.lock().notified, vec![b"aaaa".to_vec(), b"bbbb".to_vec()]);
        assert!(controller.is_sending());

        controller.handle_event(PeripheralEvent::ReadyToUpdateSubscribers);
        assert_eq!(
            log.lock().notified,
            vec![
                b"aaaa".to_vec(),
                b"bbbb".to_vec(),
                b"cccc".to_vec(),
                b"dddd".to_vec(),
                b"eeee".to_vec(),
                EOM.to_vec(),
            ]
        );
        assert!(!controller.is_sending());
    }

    #[test]
    fn test_last_subscriber_is_send_target() {
        let (mut controller, _log, sink) = controller();
        powered_and_advertising(&mut controller);
        subscribe(&mut controller, "A", 20);
        subscribe(&mut controller, "B", 20);

        assert_eq!(controller.active_subscriber(), Some("B"));
        assert_eq!(controller.subscribers().len(), 2);
        assert!(controller.send_message("B", "x".to_string()).is_ok());
        assert_eq!(
            controller.send_message("A", "x".to_string()),
            Err(MessagingError::NotConnectedOrNoChannel)
        );

        controller.handle_event(PeripheralEvent::Unsubscribed {
            central_id: "B".to_string(),
        });
        assert_eq!(controller.active_subscriber(), None);
        assert_eq!(sink.count("onDeviceConnected"), 2);
        assert_eq!(sink.count("onDeviceDisconnected"), 1);
    }

    #[test]
    fn test_unsubscribe_discards_partial_message() {
        let (mut controller, _log, sink) = controller();
        subscribe(&mut controller, "A", 20);
        controller.handle_event(write("A", b"partial"));
        controller.handle_event(PeripheralEvent::Unsubscribed {
            central_id: "A".to_string(),
        });
        controller.handle_event(write("A", EOM));

        let received: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MessagingEvent::MessageReceived { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![String::new()]);
    }

    #[test]
    fn test_power_loss_drops_advertising_and_subscribers() {
        let (mut controller, _log, sink) = controller();
        powered_and_advertising(&mut controller);
        subscribe(&mut controller, "A", 20);
        sink.take();

        controller.handle_event(PeripheralEvent::AdapterStateChanged(AdapterState::PoweredOff));
        assert!(!controller.is_advertising());
        assert!(controller.subscribers().is_empty());
        assert_eq!(
            sink.events(),
            vec![
                MessagingEvent::AdvertisingStopped,
                MessagingEvent::DeviceDisconnected {
                    uuid: "A".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_cleanup_is_repeatable() {
        let (mut controller, log, sink) = controller();
        powered_and_advertising(&mut controller);
        subscribe(&mut controller, "A", 20);
        controller.handle_event(write("A", b"half"));

        controller.cleanup();
        controller.cleanup();
        assert_eq!(sink.count("onAdvertisingStopped"), 1);
        assert!(!controller.is_advertising());
        assert!(controller.subscribers().is_empty());
        assert!(log.lock().services.is_empty());
        assert!(log.lock().advertising.is_none());
    }
}
