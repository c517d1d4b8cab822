//! Adapters — concrete implementations of the hexagonal port traits.
//!
//! | Adapter      | Implements              | Connects to                   |
//! |--------------|-------------------------|-------------------------------|
//! | `device_id`  | —                       | eFuse MAC, hardware RNG       |
//! | `log_sink`   | EventSink               | Serial log, diagnostic ring   |
//! | `modem_mqtt` | MqttLink, MqttTransport | Modem MQTT stack (`AT+CMQTT`) |
//! | `nvs`        | ConfigPort              | NVS / in-memory store         |
//! |              | StoragePort             |                               |
//! | `time`       | Clock                   | ESP32 system timer            |
//! | `uart`       | SerialPort              | ESP32 UART / simulated modem  |

pub mod device_id;
pub mod log_sink;
pub mod modem_mqtt;
pub mod nvs;
pub mod time;
pub mod uart;
