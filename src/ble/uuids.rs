//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants behind the built-in service profiles.

use uuid::Uuid;

// UART Service (Nordic NUS - Nordic UART Service)
/// Nordic UART Service UUID.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// UART RX characteristic UUID (peripheral receives, host writes).
pub const UART_RX_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
/// UART TX characteristic UUID (peripheral transmits, host gets notifications).
pub const UART_TX_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);

// Battery Service (Standard BLE)
/// Standard BLE Battery Service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = uuid_from_u16(0x180f);
/// Battery Level characteristic UUID (percentage, one byte).
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_u16(0x2a19);

// Device Information Service (Standard BLE)
/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = uuid_from_u16(0x180a);
/// Manufacturer Name characteristic UUID.
pub const MANUFACTURER_NAME_UUID: Uuid = uuid_from_u16(0x2a29);
/// Model Number characteristic UUID.
pub const MODEL_NUMBER_UUID: Uuid = uuid_from_u16(0x2a24);
/// Serial Number characteristic UUID.
pub const SERIAL_NUMBER_UUID: Uuid = uuid_from_u16(0x2a25);
/// Hardware Revision characteristic UUID.
pub const HARDWARE_REVISION_UUID: Uuid = uuid_from_u16(0x2a27);
/// Firmware Revision characteristic UUID.
pub const FIRMWARE_REVISION_UUID: Uuid = uuid_from_u16(0x2a26);

/// Advertised name of the stock ESP32 BLE UART firmware.
pub const ESP32_UART_DEVICE_NAME: &str = "ESP32_BLE_UART";

/// Bluetooth base UUID shared by all 16-bit SIG-assigned UUIDs.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit SIG-assigned UUID into its full 128-bit form.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}
