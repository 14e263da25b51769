// Transport module — BLE GATT messaging

pub mod ble;

pub use ble::{
    AdapterState, CentralHandle, EventSink, MessagingEvent, PeripheralHandle, RadioError,
};
