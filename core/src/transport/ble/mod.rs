/// BLE (Bluetooth Low Energy) Transport Module
///
/// Protocol-level pieces of the dual-role messaging engine:
///
/// - **framing**: chunk splitting, the `EOM` sentinel, reassembly, the send cursor
/// - **gate**: adapter state tracking and held start intents
/// - **gatt**: service/characteristic identity and UUID parsing
/// - **radio**: the capability traits a platform BLE stack implements
/// - **peripheral** / **central**: the two role controllers
/// - **runtime**: per-role tasks and their command handles
/// - **loopback**: in-memory radios for tests and demos
///
/// Platform code (CoreBluetooth, Android GATT, BlueZ) only has to implement
/// the radio traits and post events; everything here is testable without
/// hardware.

pub mod central;
pub mod events;
pub mod framing;
pub mod gate;
pub mod gatt;
pub mod loopback;
pub mod peripheral;
pub mod radio;
pub mod runtime;

pub use central::{CentralController, PeerRecord, ScanRequest, ScanTimer};
pub use events::{ChannelEventSink, EventSink, MessagingEvent};
pub use framing::{
    chunk_size, is_sentinel, split, ChunkSink, DrainOutcome, Reassembler, SendCursor,
    DEFAULT_CHUNK_SIZE, EOM,
};
pub use gate::{AdapterState, GateDecision, IntentKind, PendingIntent, RadioGate, Responder};
pub use gatt::{
    expand_short_uuid, parse_service_uuid, CharacteristicProperties, DiscoveredCharacteristic,
    ServiceIdentity, BLUETOOTH_BASE_UUID, CCCD_UUID, CHARACTERISTIC_UUID, SERVICE_UUID,
};
pub use loopback::{LoopbackAir, LoopbackCentral, LoopbackPeripheral, LOOPBACK_RSSI};
pub use peripheral::{PeripheralController, SubscriberRecord};
pub use radio::{
    radio_event_channel, CentralEvent, CentralRadio, PeripheralEvent, PeripheralRadio,
    RadioError, RadioEventReceiver, RadioEventSender,
};
pub use runtime::{
    spawn_central, spawn_peripheral, CentralCommand, CentralHandle, PeripheralCommand,
    PeripheralHandle,
};
