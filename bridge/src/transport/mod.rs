//! BLE transport clients (spec §4.2): one generic connect/subscribe/
//! reconnect engine (`ble`), plus a thin typed wrapper per device class
//! that attaches the matching frame parser.

pub mod ble;
pub mod sensor_client;
pub mod timer_client;
