//! Mock hardware for integration tests.
//!
//! The clock only moves when a test (or a blocking delay) moves it, so every
//! timeout in the link stack can be crossed deterministically.  Handles are
//! cheap clones over shared state: hand one to the code under test, keep one
//! to inspect.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use gatelink::adapters::nvs::NvsAdapter;
use gatelink::adapters::uart::SimModemSerial;
use gatelink::app::events::AppEvent;
use gatelink::app::ports::{
    Clock, ConnectOptions, EventSink, ModemLine, ModemLines, MqttLink, MqttTransport, QoS,
    RelayPort, TransportError,
};
use gatelink::app::service::GateService;
use gatelink::config::{LinkConfig, ModemTiming, PppTiming};
use gatelink::link::modem::ModemManager;
use gatelink::link::supervisor::{LinkStatus, LinkSupervisor};

// ── Clock ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MockClock {
    now: Rc<Cell<u64>>,
}

#[allow(dead_code)]
impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    pub fn get(&self) -> u64 {
        self.now.get()
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn delay_ms(&mut self, ms: u32) {
        self.advance(u64::from(ms));
    }
}

// ── Modem control lines ───────────────────────────────────────

#[derive(Default)]
pub struct RecordingLines {
    pub calls: Vec<(ModemLine, bool)>,
}

#[allow(dead_code)]
impl RecordingLines {
    pub fn pulses(&self, line: ModemLine) -> usize {
        self.calls
            .iter()
            .filter(|&&(l, high)| l == line && high)
            .count()
    }
}

impl ModemLines for RecordingLines {
    fn set_level(&mut self, line: ModemLine, high: bool) {
        self.calls.push((line, high));
    }
}

pub type SimModem = ModemManager<SimModemSerial, RecordingLines, MockClock>;

/// A modem manager wired to the simulated A7670.
#[allow(dead_code)]
pub fn sim_modem(config: &LinkConfig) -> (SimModem, SimModemSerial, MockClock) {
    let serial = SimModemSerial::new();
    let clock = MockClock::new();
    let modem = ModemManager::new(
        serial.clone(),
        RecordingLines::default(),
        clock.clone(),
        config,
        ModemTiming::default(),
    );
    (modem, serial, clock)
}

// ── MQTT transport ────────────────────────────────────────────

#[derive(Default)]
pub struct FakeBroker {
    pub refuse_connect: bool,
    pub refuse_subscribe: bool,
    pub refuse_publish: bool,
    pub up: bool,
    pub client_ids: Vec<String>,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>, bool)>,
    pub inbound: Vec<(String, Vec<u8>)>,
}

/// Broker-side fake shared between the test and the supervisor.
#[derive(Clone, Default)]
pub struct FakeLink {
    pub broker: Rc<RefCell<FakeBroker>>,
}

#[allow(dead_code)]
impl FakeLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_attempts(&self) -> usize {
        self.broker.borrow().client_ids.len()
    }

    /// Deliver a message on the next poll.
    pub fn push_inbound(&self, topic: &str, payload: &[u8]) {
        self.broker
            .borrow_mut()
            .inbound
            .push((topic.to_string(), payload.to_vec()));
    }

    /// Drop the session from the broker side.
    pub fn drop_session(&self) {
        self.broker.borrow_mut().up = false;
    }

    pub fn published_on(&self, topic: &str) -> Vec<(Vec<u8>, bool)> {
        self.broker
            .borrow()
            .published
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, p, r)| (p.clone(), *r))
            .collect()
    }
}

impl MqttTransport for FakeLink {
    fn connect(&mut self, opts: &ConnectOptions<'_>) -> Result<(), TransportError> {
        let mut b = self.broker.borrow_mut();
        b.client_ids.push(opts.client_id.to_string());
        if b.refuse_connect {
            return Err(TransportError::ConnectRefused);
        }
        b.up = true;
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        let mut b = self.broker.borrow_mut();
        if b.refuse_subscribe {
            return Err(TransportError::SubscribeRejected);
        }
        b.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), TransportError> {
        let mut b = self.broker.borrow_mut();
        if b.refuse_publish || !b.up {
            return Err(TransportError::PublishFailed);
        }
        b.published.push((topic.to_string(), payload.to_vec(), retained));
        Ok(())
    }

    fn disconnect(&mut self) {
        self.broker.borrow_mut().up = false;
    }

    fn is_connected(&mut self) -> bool {
        self.broker.borrow().up
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        let inbound = std::mem::take(&mut self.broker.borrow_mut().inbound);
        for (topic, payload) in inbound {
            on_message(&topic, &payload);
        }
    }
}

impl<A: ?Sized> MqttLink<A> for FakeLink {
    fn with_transport<R>(&mut self, _at: &mut A, f: impl FnOnce(&mut dyn MqttTransport) -> R) -> R {
        f(self)
    }
}

// ── Relay ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct CountingRelay {
    pub pulses: Rc<Cell<u32>>,
}

#[allow(dead_code)]
impl CountingRelay {
    pub fn count(&self) -> u32 {
        self.pulses.get()
    }
}

impl RelayPort for CountingRelay {
    fn activate_pulse(&mut self) {
        self.pulses.set(self.pulses.get() + 1);
    }
}

// ── Event sink ────────────────────────────────────────────────

#[derive(Default)]
pub struct CollectingSink {
    pub events: Vec<AppEvent>,
}

#[allow(dead_code)]
impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, pred: impl Fn(&AppEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for CollectingSink {
    fn emit(&mut self, event: &AppEvent) {
        self.events.push(event.clone());
    }
}

// ── Storage ───────────────────────────────────────────────────

#[allow(dead_code)]
pub fn host_nvs() -> NvsAdapter {
    match NvsAdapter::new() {
        Ok(nvs) => nvs,
        Err(e) => panic!("host NVS must always open: {e}"),
    }
}

// ── Full link stack ───────────────────────────────────────────

/// Everything `main` wires together, on simulated hardware.
pub struct LinkRig {
    pub config: LinkConfig,
    pub modem: SimModem,
    pub serial: SimModemSerial,
    pub clock: MockClock,
    pub link: FakeLink,
    pub supervisor: LinkSupervisor,
    pub service: GateService<CountingRelay>,
    pub relay: CountingRelay,
    pub sink: CollectingSink,
}

#[allow(dead_code)]
impl LinkRig {
    pub fn new() -> Self {
        Self::with_config(LinkConfig::default())
    }

    pub fn with_config(config: LinkConfig) -> Self {
        let (modem, serial, clock) = sim_modem(&config);
        let relay = CountingRelay::default();
        Self {
            supervisor: LinkSupervisor::new(&config, PppTiming::default(), 0x5EED),
            service: GateService::new(relay.clone(), &config, 0xBEEF),
            relay,
            modem,
            serial,
            clock,
            link: FakeLink::new(),
            sink: CollectingSink::new(),
            config,
        }
    }

    /// One supervisor tick, then 100 ms of wall time.
    pub fn tick(&mut self) -> LinkStatus {
        let status = self.supervisor.tick(
            &mut self.modem,
            &mut self.link,
            &mut self.service,
            &mut self.sink,
        );
        self.clock.advance(100);
        status
    }

    /// Tick until `done` holds; panics after `max_ticks`.
    pub fn tick_until(
        &mut self,
        max_ticks: usize,
        mut done: impl FnMut(&LinkStatus, &CollectingSink) -> bool,
    ) -> LinkStatus {
        for _ in 0..max_ticks {
            let status = self.tick();
            if done(&status, &self.sink) {
                return status;
            }
        }
        panic!("condition not reached in {max_ticks} ticks: {:?}", self.sink.events);
    }

    pub fn connect(&mut self) -> LinkStatus {
        self.tick_until(500, |s, _| s.mqtt_connected)
    }

    /// Publish through the supervisor, the way the main loop does.
    pub fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> bool {
        self.supervisor
            .publish(&mut self.modem, &mut self.link, topic, payload, retained)
    }
}
