//! Gatelink Firmware — Main Entry Point
//!
//! Single-threaded, tick-driven: every iteration drives the link stack one
//! step, executes queued gate commands, and publishes whatever the gate
//! service has queued.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  UartSerial   GpioModemLines   ModemMqttClient   NvsAdapter    │
//! │  (SerialPort) (ModemLines)     (MqttLink)        (Config+NVS)  │
//! │  Relay        SystemClock      DiagnosticSink                  │
//! │  (RelayPort)  (Clock)          (EventSink)                     │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │  LinkSupervisor: ModemManager · PppManager · MqttManager│   │
//! │  │  GateService:    dedupe · cooldown · acks · status     │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use anyhow::Result;
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, PinDriver};
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_hal::uart::{UartDriver, config::Config as UartConfig};
use esp_idf_hal::units::Hertz;
use log::{info, warn};

use gatelink::adapters::device_id;
use gatelink::adapters::log_sink::DiagnosticSink;
use gatelink::adapters::modem_mqtt::{ModemMqttClient, ModemMqttTiming};
use gatelink::adapters::nvs::NvsAdapter;
use gatelink::adapters::time::SystemClock;
use gatelink::adapters::uart::UartSerial;
use gatelink::app::ports::{Clock, ConfigPort};
use gatelink::app::service::GateService;
use gatelink::config::{LinkConfig, ModemTiming, PppTiming};
use gatelink::diagnostics::{self, DiagnosticLog};
use gatelink::drivers::modem_lines::GpioModemLines;
use gatelink::drivers::relay::Relay;
use gatelink::drivers::watchdog::{WATCHDOG_TIMEOUT_MS, Watchdog};
use gatelink::link::modem::ModemManager;
use gatelink::link::supervisor::LinkSupervisor;
use gatelink::pins;

/// Connect, subscribe and publish acknowledgements from the modem's client.
const BROKER_TIMEOUT_MS: u32 = 15_000;

fn output(gpio: i32) -> Result<PinDriver<'static, AnyOutputPin, esp_idf_hal::gpio::Output>> {
    // SAFETY: each GPIO number in `pins` is claimed exactly once, here.
    let pin = unsafe { AnyOutputPin::new(gpio) };
    Ok(PinDriver::output(pin)?)
}

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  Gatelink v{}                        ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    // ── 2. Load config from NVS (or defaults) ─────────────────
    let nvs = NvsAdapter::new().map_err(|e| anyhow::anyhow!("NVS init failed: {}", e))?;
    let config = match nvs.load() {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("NVS config load failed ({}), using defaults", e);
            LinkConfig::default()
        }
    };
    diagnostics::install_panic_handler();
    info!(
        "Device {} → {}:{} (apn '{}')",
        config.device_id, config.mqtt_host, config.mqtt_port, config.apn
    );

    // ── 3. Peripherals ────────────────────────────────────────
    let peripherals = Peripherals::take()?;
    let uart = UartDriver::new(
        peripherals.uart1,
        // SAFETY: modem UART pins are not used anywhere else.
        unsafe { AnyIOPin::new(pins::MODEM_TX_GPIO) },
        unsafe { AnyIOPin::new(pins::MODEM_RX_GPIO) },
        Option::<AnyIOPin>::None,
        Option::<AnyIOPin>::None,
        &UartConfig::new().baudrate(Hertz(ModemTiming::default().uart_baud)),
    )?;

    let lines = GpioModemLines::new(
        output(pins::MODEM_POWER_ON_GPIO)?,
        output(pins::MODEM_RESET_GPIO)?,
        output(pins::MODEM_DTR_GPIO)?,
        output(pins::MODEM_PWRKEY_GPIO)?,
    );

    // ── 4. Link stack and gate service ────────────────────────
    let mut clock = SystemClock::new();
    let mut modem = ModemManager::new(
        UartSerial::new(uart),
        lines,
        clock,
        &config,
        ModemTiming::default(),
    );
    let mut link = ModemMqttClient::new(ModemMqttTiming {
        command_ms: config.at_cmd_timeout_ms,
        broker_ms: BROKER_TIMEOUT_MS,
    });
    let mut supervisor =
        LinkSupervisor::new(&config, PppTiming::default(), device_id::client_id_seed());

    let relay = Relay::new(output(pins::RELAY_GPIO)?, clock, config.relay_pulse_ms);
    let mut service = GateService::new(relay, &config, device_id::random_u32());
    let mut diag = DiagnosticLog::new(nvs.clone());
    if diag.has_entries() {
        info!("Diag: {} entries carried over from last boot", diag.entry_count());
    }

    let watchdog = Watchdog::new(WATCHDOG_TIMEOUT_MS);
    info!("System ready. Entering main loop.");

    // ── 5. Main loop ──────────────────────────────────────────
    loop {
        let status = {
            let mut sink = DiagnosticSink::new(clock.now_ms(), &mut diag);
            supervisor.tick(&mut modem, &mut link, &mut service, &mut sink)
        };

        let now = clock.now_ms();
        {
            let mut sink = DiagnosticSink::new(now, &mut diag);
            service.process(now, &mut sink);
        }
        service.on_link(&status, now, &diag);
        service.flush(&mut diag, |topic, payload, retained| {
            supervisor.publish(&mut modem, &mut link, topic, payload, retained)
        });

        watchdog.feed();
        clock.delay_ms(config.tick_interval_ms);
    }
}
