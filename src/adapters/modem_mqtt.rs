//! MQTT over the modem's built-in client (SIMCom `AT+CMQTT*`).
//!
//! The modem keeps the TCP session itself, so this adapter never owns a
//! socket: every operation is a short AT dialogue on the channel lent by the
//! [`ModemManager`](crate::link::modem::ModemManager).  Dialogues never wait:
//! each call advances the one in flight as far as the modem has answered and
//! returns [`TransportError::WouldBlock`] until it finishes.
//!
//! ```text
//! connect    [DISC] [REL] [STOP]  START → +CMQTTSTART  ACCQ  CONNECT → +CMQTTCONNECT
//! subscribe  SUBTOPIC > topic  SUB → +CMQTTSUB
//! publish    TOPIC > topic  PAYLOAD > payload  PUB → +CMQTTPUB
//! ```
//!
//! Broker results and session state arrive as unsolicited lines:
//!
//! ```text
//! +CMQTTCONNLOST: 0,<cause>
//! +CMQTTRXSTART: 0,<topic_len>,<payload_len>
//! +CMQTTRXTOPIC: 0,<len>
//! <topic>
//! +CMQTTRXPAYLOAD: 0,<len>
//! <payload>
//! +CMQTTRXEND: 0
//! ```
//!
//! Inbound messages are assembled from those lines and held until the next
//! [`poll`](MqttTransport::poll).

use core::fmt::Write as _;

use log::{debug, info, warn};

use crate::app::ports::{
    AtPoll, AtPort, ConnectOptions, MqttLink, MqttTransport, QoS, TransportError, UrcLine,
};
use crate::link::at::{self, CMD_CAPACITY};
use crate::text;

/// Client slot used for the single session.
const CLIENT_INDEX: u8 = 0;
/// Messages held between polls.
const INBOX_DEPTH: usize = 4;
const TOPIC_CAPACITY: usize = 128;
const PAYLOAD_CAPACITY: usize = 512;
/// Largest message the modem accepts in one `AT+CMQTTPAYLOAD`.
const MAX_PUBLISH_LEN: usize = 10_240;

const CMD_START: &str = "AT+CMQTTSTART";
const CMD_STOP: &str = "AT+CMQTTSTOP";
const CMD_RELEASE: &str = "AT+CMQTTREL=0";
const CMD_DISCONNECT: &str = "AT+CMQTTDISC=0,60";
const CMD_SUBSCRIBE: &str = "AT+CMQTTSUB=0";

type AtCommand = heapless::String<CMD_CAPACITY>;

/// Timeouts for the AT dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemMqttTiming {
    /// Plain command round-trip.
    pub command_ms: u32,
    /// Broker connect, subscribe and publish reports.
    pub broker_ms: u32,
}

impl Default for ModemMqttTiming {
    fn default() -> Self {
        Self {
            command_ms: 5_000,
            broker_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: heapless::String<TOPIC_CAPACITY>,
    pub payload: heapless::Vec<u8, PAYLOAD_CAPACITY>,
}

/// Where the receive assembler is within a `+CMQTTRX*` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxPhase {
    Idle,
    /// Inside a block, waiting for the next header.
    Header,
    TopicLine,
    Payload { remaining: usize },
}

/// Asynchronous `+CMQTT<kind>: ...,<err>` result lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Report {
    Start,
    Connect,
    Subscribe,
    Publish,
}

impl Report {
    fn prefix(self) -> &'static str {
        match self {
            Self::Start => "+CMQTTSTART: ",
            Self::Connect => "+CMQTTCONNECT: 0,",
            Self::Subscribe => "+CMQTTSUB: 0,",
            Self::Publish => "+CMQTTPUB: 0,",
        }
    }
}

const REPORTS: [Report; 4] = [Report::Start, Report::Connect, Report::Subscribe, Report::Publish];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectStep {
    /// Release whatever an earlier session left on the modem.
    Teardown,
    Start { retried: bool },
    StartReport { retried: bool, since_ms: u64 },
    /// `START` was refused: stop the service left running and try once more.
    Restart,
    Acquire,
    Connect,
    ConnectReport { since_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscribeStep {
    Topic,
    TopicData,
    Subscribe,
    Report { since_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishStep {
    Topic,
    TopicData,
    Payload,
    PayloadData,
    Publish,
    Report { since_ms: u64 },
}

/// The dialogue in flight.  Starting a different one abandons it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Connect {
        client_id: heapless::String<64>,
        step: ConnectStep,
        /// Set once the attempt has failed; teardown runs before it is returned.
        failure: Option<TransportError>,
    },
    Subscribe {
        key: u32,
        step: SubscribeStep,
    },
    Publish {
        key: u32,
        step: PublishStep,
    },
}

// ───────────────────────────────────────────────────────────────
// ModemMqttClient
// ───────────────────────────────────────────────────────────────

pub struct ModemMqttClient {
    timing: ModemMqttTiming,
    service_started: bool,
    client_acquired: bool,
    connected: bool,
    op: Option<Op>,
    report: Option<(Report, u8)>,
    rx_phase: RxPhase,
    rx: InboundMessage,
    inbox: heapless::Deque<InboundMessage, INBOX_DEPTH>,
}

impl Default for ModemMqttClient {
    fn default() -> Self {
        Self::new(ModemMqttTiming::default())
    }
}

impl ModemMqttClient {
    pub fn new(timing: ModemMqttTiming) -> Self {
        Self {
            timing,
            service_started: false,
            client_acquired: false,
            connected: false,
            op: None,
            report: None,
            rx_phase: RxPhase::Idle,
            rx: InboundMessage {
                topic: heapless::String::new(),
                payload: heapless::Vec::new(),
            },
            inbox: heapless::Deque::new(),
        }
    }

    pub fn is_session_open(&self) -> bool {
        self.connected
    }

    /// A dialogue is still waiting on the modem.
    pub fn is_busy(&self) -> bool {
        self.op.is_some()
    }

    pub fn pending_messages(&self) -> usize {
        self.inbox.len()
    }

    /// Consume every buffered modem line, updating session state and
    /// assembling inbound messages.
    fn drain_urcs<A: AtPort + ?Sized>(&mut self, at: &mut A) {
        while let Some(line) = at.take_urc() {
            self.on_line(&line);
        }
    }

    fn on_line(&mut self, line: &UrcLine) {
        let line = line.as_str();

        if let Some(args) = line.strip_prefix("+CMQTTCONNLOST:") {
            warn!("MQTT: modem reports connection lost (cause {})", args.trim());
            self.connected = false;
            self.rx_phase = RxPhase::Idle;
            return;
        }
        if let Some(kind) = REPORTS.into_iter().find(|k| line.starts_with(k.prefix())) {
            if let Some(code) = at::parse_result_code(line, kind.prefix()) {
                self.report = Some((kind, code));
            }
            return;
        }
        if line.starts_with("+CMQTTRXSTART:") {
            self.rx.topic.clear();
            self.rx.payload.clear();
            self.rx_phase = RxPhase::Header;
            return;
        }
        if line.starts_with("+CMQTTRXTOPIC:") {
            self.rx_phase = RxPhase::TopicLine;
            return;
        }
        if let Some(args) = line.strip_prefix("+CMQTTRXPAYLOAD:") {
            let remaining = args
                .split(',')
                .nth(1)
                .and_then(|n| n.trim().parse().ok())
                .unwrap_or(0);
            self.rx_phase = RxPhase::Payload { remaining };
            return;
        }
        if line.starts_with("+CMQTTRXEND:") {
            if self.rx_phase != RxPhase::Idle {
                self.deliver();
            }
            self.rx_phase = RxPhase::Idle;
            return;
        }

        match self.rx_phase {
            RxPhase::TopicLine => {
                self.rx.topic = text::truncate(line);
                self.rx_phase = RxPhase::Header;
            }
            RxPhase::Payload { remaining } if remaining > 0 => {
                // The line assembler strips CR/LF; put back the separator for
                // payloads that span lines.
                let mut remaining = remaining;
                if !self.rx.payload.is_empty() && remaining >= 2 {
                    let _ = self.rx.payload.extend_from_slice(b"\r\n");
                    remaining -= 2;
                }
                let take = line.len().min(remaining);
                let room = PAYLOAD_CAPACITY - self.rx.payload.len();
                let _ = self
                    .rx
                    .payload
                    .extend_from_slice(&line.as_bytes()[..take.min(room)]);
                self.rx_phase = RxPhase::Payload {
                    remaining: remaining - take,
                };
            }
            _ => {}
        }
    }

    fn deliver(&mut self) {
        let msg = core::mem::replace(
            &mut self.rx,
            InboundMessage {
                topic: heapless::String::new(),
                payload: heapless::Vec::new(),
            },
        );
        debug!("MQTT: rx {} bytes on {}", msg.payload.len(), msg.topic);
        if self.inbox.is_full() {
            warn!("MQTT: inbox full, dropping oldest message");
            self.inbox.pop_front();
        }
        let _ = self.inbox.push_back(msg);
    }

    /// Wait for the `kind` report that follows an accepted command.
    ///
    /// `Err(WouldBlock)` while it has not arrived, `Err(Modem)` once
    /// `broker_ms` has passed since `since_ms`.
    fn await_report<A: AtPort + ?Sized>(
        &mut self,
        at: &mut A,
        kind: Report,
        since_ms: u64,
    ) -> Result<u8, TransportError> {
        self.drain_urcs(at);
        if let Some((k, code)) = self.report {
            if k == kind {
                self.report = None;
                return Ok(code);
            }
        }
        if at.now_ms().saturating_sub(since_ms) >= u64::from(self.timing.broker_ms) {
            warn!("MQTT: no {} report from the modem", kind.prefix().trim());
            return Err(TransportError::Modem);
        }
        Err(TransportError::WouldBlock)
    }

    /// Forget any report left over from an earlier dialogue.
    fn begin_op<A: AtPort + ?Sized>(&mut self, at: &mut A, op: Op) {
        self.drain_urcs(at);
        self.report = None;
        self.op = Some(op);
    }

    /// Abort the connect in flight; teardown runs before `e` is returned.
    fn fail_connect(&mut self, e: TransportError) {
        if let Some(Op::Connect { step, failure, .. }) = self.op.as_mut() {
            *step = ConnectStep::Teardown;
            *failure = Some(e);
        }
    }

    /// Issue the release command for the innermost thing the modem still
    /// holds for us.  `Ok(true)` once nothing is held.
    fn release_step<A: AtPort + ?Sized>(&mut self, at: &mut A) -> Result<bool, TransportError> {
        let t = self.timing;
        let poll = if self.connected {
            at.exchange(CMD_DISCONNECT, "+CMQTTDISC:", t.broker_ms)
        } else if self.client_acquired {
            at.exchange(CMD_RELEASE, "OK", t.command_ms)
        } else if self.service_started {
            at.exchange(CMD_STOP, "+CMQTTSTOP:", t.command_ms)
        } else {
            return Ok(true);
        };
        if poll.is_pending() {
            return Err(TransportError::WouldBlock);
        }
        // Whatever the answer, the modem no longer holds it for this session.
        if self.connected {
            self.connected = false;
        } else if self.client_acquired {
            self.client_acquired = false;
        } else {
            self.service_started = false;
        }
        self.rx_phase = RxPhase::Idle;
        Ok(false)
    }
}

impl<A: AtPort + ?Sized> MqttLink<A> for ModemMqttClient {
    fn with_transport<R>(
        &mut self,
        at: &mut A,
        f: impl FnOnce(&mut dyn MqttTransport) -> R,
    ) -> R {
        let mut session = ModemMqttSession { client: self, at };
        f(&mut session)
    }
}

// ───────────────────────────────────────────────────────────────
// Per-call session: the client plus the borrowed AT channel
// ───────────────────────────────────────────────────────────────

struct ModemMqttSession<'a, A: ?Sized> {
    client: &'a mut ModemMqttClient,
    at: &'a mut A,
}

/// Format one command line, refusing rather than truncating.
fn command(args: core::fmt::Arguments<'_>) -> Result<AtCommand, TransportError> {
    let mut cmd = AtCommand::new();
    cmd.write_fmt(args)
        .map_err(|_| TransportError::InvalidArgument)?;
    Ok(cmd)
}

/// Map a finished exchange to `Ok(matched)`, or `WouldBlock` while pending.
fn finished(poll: &AtPoll) -> Result<bool, TransportError> {
    match poll {
        AtPoll::Pending => Err(TransportError::WouldBlock),
        AtPoll::Matched(_) => Ok(true),
        AtPoll::Error(_) | AtPoll::TimedOut(_) => Ok(false),
    }
}

fn operation_key(topic: &str, payload: &[u8], flag: bool) -> u32 {
    at::fingerprint(topic.as_bytes()) ^ at::fingerprint(payload).rotate_left(7) ^ u32::from(flag)
}

/// `ACCQ` and `CONNECT` lines for one attempt.
fn connect_commands(opts: &ConnectOptions<'_>) -> Result<(AtCommand, AtCommand), TransportError> {
    let quotable = [opts.client_id, opts.host, opts.username, opts.password]
        .iter()
        .all(|s| text::is_at_quotable(s));
    if !quotable {
        warn!("MQTT: connect option cannot be quoted in an AT command");
        return Err(TransportError::InvalidArgument);
    }
    let acquire = command(format_args!(
        "AT+CMQTTACCQ={},\"{}\",0",
        CLIENT_INDEX, opts.client_id
    ))?;
    let mut connect = command(format_args!(
        "AT+CMQTTCONNECT={},\"tcp://{}:{}\",{},1",
        CLIENT_INDEX, opts.host, opts.port, opts.keep_alive_secs
    ))?;
    if !opts.username.is_empty() {
        connect
            .write_fmt(format_args!(",\"{}\",\"{}\"", opts.username, opts.password))
            .map_err(|_| TransportError::InvalidArgument)?;
    }
    Ok((acquire, connect))
}

impl<A: AtPort + ?Sized> MqttTransport for ModemMqttSession<'_, A> {
    fn connect(&mut self, opts: &ConnectOptions<'_>) -> Result<(), TransportError> {
        let (acquire, connect) = connect_commands(opts)?;
        let Self { client, at } = self;
        let at = &mut **at;
        let t = client.timing;

        let resuming = matches!(
            &client.op,
            Some(Op::Connect { client_id, .. }) if client_id.as_str() == opts.client_id
        );
        if !resuming {
            // Start from a clean slate; a stale slot makes ACCQ fail.
            client.begin_op(
                at,
                Op::Connect {
                    client_id: text::truncate(opts.client_id),
                    step: ConnectStep::Teardown,
                    failure: None,
                },
            );
            client.inbox.clear();
        }

        loop {
            let Some(Op::Connect { step, failure, .. }) = client.op.clone() else {
                return Err(TransportError::Modem);
            };
            let next = match step {
                ConnectStep::Teardown => {
                    if !client.release_step(at)? {
                        continue;
                    }
                    if let Some(e) = failure {
                        client.op = None;
                        return Err(e);
                    }
                    ConnectStep::Start { retried: false }
                }
                ConnectStep::Start { retried } => {
                    if finished(&at.exchange(CMD_START, "OK", t.command_ms))? {
                        client.report = None;
                        ConnectStep::StartReport {
                            retried,
                            since_ms: at.now_ms(),
                        }
                    } else if retried {
                        warn!("MQTT: AT+CMQTTSTART failed");
                        client.fail_connect(TransportError::Modem);
                        continue;
                    } else {
                        ConnectStep::Restart
                    }
                }
                ConnectStep::StartReport { retried, since_ms } => {
                    match client.await_report(at, Report::Start, since_ms) {
                        Ok(0) => {
                            client.service_started = true;
                            ConnectStep::Acquire
                        }
                        Err(TransportError::WouldBlock) => return Err(TransportError::WouldBlock),
                        _ if !retried => ConnectStep::Restart,
                        _ => {
                            warn!("MQTT: AT+CMQTTSTART failed");
                            client.fail_connect(TransportError::Modem);
                            continue;
                        }
                    }
                }
                ConnectStep::Restart => {
                    // Service left running by an earlier boot.
                    finished(&at.exchange(CMD_STOP, "+CMQTTSTOP:", t.command_ms))?;
                    ConnectStep::Start { retried: true }
                }
                ConnectStep::Acquire => {
                    if finished(&at.exchange(&acquire, "OK", t.command_ms))? {
                        client.client_acquired = true;
                        ConnectStep::Connect
                    } else {
                        warn!("MQTT: could not acquire client slot");
                        client.fail_connect(TransportError::Modem);
                        continue;
                    }
                }
                ConnectStep::Connect => {
                    if finished(&at.exchange(&connect, "OK", t.command_ms))? {
                        client.report = None;
                        ConnectStep::ConnectReport {
                            since_ms: at.now_ms(),
                        }
                    } else {
                        warn!("MQTT: broker connect to {}:{} rejected", opts.host, opts.port);
                        client.fail_connect(TransportError::ConnectRefused);
                        continue;
                    }
                }
                ConnectStep::ConnectReport { since_ms } => {
                    match client.await_report(at, Report::Connect, since_ms) {
                        Ok(0) => {
                            client.op = None;
                            client.connected = true;
                            client.rx_phase = RxPhase::Idle;
                            info!("MQTT: modem session open as {}", opts.client_id);
                            return Ok(());
                        }
                        Err(TransportError::WouldBlock) => return Err(TransportError::WouldBlock),
                        outcome => {
                            warn!(
                                "MQTT: broker connect to {}:{} failed ({:?})",
                                opts.host, opts.port, outcome
                            );
                            client.fail_connect(TransportError::ConnectRefused);
                            continue;
                        }
                    }
                }
            };

            if let Some(Op::Connect { step, .. }) = client.op.as_mut() {
                *step = next;
            }
        }
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let Self { client, at } = self;
        let at = &mut **at;
        if !client.connected {
            return Err(TransportError::NotConnected);
        }
        let t = client.timing;
        let key = operation_key(topic, &[qos.level()], false);
        if !matches!(client.op, Some(Op::Subscribe { key: k, .. }) if k == key) {
            client.begin_op(
                at,
                Op::Subscribe {
                    key,
                    step: SubscribeStep::Topic,
                },
            );
        }
        let announce = command(format_args!(
            "AT+CMQTTSUBTOPIC={},{},{}",
            CLIENT_INDEX,
            topic.len(),
            qos.level()
        ))?;

        loop {
            let Some(Op::Subscribe { step, .. }) = client.op else {
                return Err(TransportError::Modem);
            };
            let outcome = match step {
                SubscribeStep::Topic => finished(&at.exchange(&announce, ">", t.command_ms))?
                    .then_some(SubscribeStep::TopicData),
                SubscribeStep::TopicData => {
                    finished(&at.exchange_data(topic.as_bytes(), "OK", t.command_ms))?
                        .then_some(SubscribeStep::Subscribe)
                }
                SubscribeStep::Subscribe => {
                    let accepted = finished(&at.exchange(CMD_SUBSCRIBE, "OK", t.command_ms))?;
                    client.report = None;
                    accepted.then(|| SubscribeStep::Report {
                        since_ms: at.now_ms(),
                    })
                }
                SubscribeStep::Report { since_ms } => {
                    match client.await_report(at, Report::Subscribe, since_ms) {
                        Err(TransportError::WouldBlock) => return Err(TransportError::WouldBlock),
                        result => {
                            client.op = None;
                            return match result {
                                Ok(0) => Ok(()),
                                _ => Err(TransportError::SubscribeRejected),
                            };
                        }
                    }
                }
            };
            match outcome {
                Some(next) => client.op = Some(Op::Subscribe { key, step: next }),
                None => {
                    client.op = None;
                    return Err(TransportError::Modem);
                }
            }
        }
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retained: bool,
    ) -> Result<(), TransportError> {
        let Self { client, at } = self;
        let at = &mut **at;
        if !client.connected {
            return Err(TransportError::NotConnected);
        }
        if payload.len() > MAX_PUBLISH_LEN {
            warn!("MQTT: payload of {} bytes too large", payload.len());
            return Err(TransportError::PublishFailed);
        }
        let t = client.timing;
        let key = operation_key(topic, payload, retained);
        if !matches!(client.op, Some(Op::Publish { key: k, .. }) if k == key) {
            client.begin_op(
                at,
                Op::Publish {
                    key,
                    step: PublishStep::Topic,
                },
            );
        }

        loop {
            let Some(Op::Publish { step, .. }) = client.op else {
                return Err(TransportError::Modem);
            };
            let outcome = match step {
                PublishStep::Topic => {
                    let cmd = command(format_args!(
                        "AT+CMQTTTOPIC={},{}",
                        CLIENT_INDEX,
                        topic.len()
                    ))?;
                    finished(&at.exchange(&cmd, ">", t.command_ms))?
                        .then_some(PublishStep::TopicData)
                }
                PublishStep::TopicData => {
                    finished(&at.exchange_data(topic.as_bytes(), "OK", t.command_ms))?
                        .then_some(PublishStep::Payload)
                }
                PublishStep::Payload => {
                    let cmd = command(format_args!(
                        "AT+CMQTTPAYLOAD={},{}",
                        CLIENT_INDEX,
                        payload.len()
                    ))?;
                    finished(&at.exchange(&cmd, ">", t.command_ms))?
                        .then_some(PublishStep::PayloadData)
                }
                PublishStep::PayloadData => {
                    finished(&at.exchange_data(payload, "OK", t.command_ms))?
                        .then_some(PublishStep::Publish)
                }
                PublishStep::Publish => {
                    let cmd = command(format_args!(
                        "AT+CMQTTPUB={},{},60,{}",
                        CLIENT_INDEX,
                        QoS::AtLeastOnce.level(),
                        u8::from(retained)
                    ))?;
                    let accepted = finished(&at.exchange(&cmd, "OK", t.command_ms))?;
                    client.report = None;
                    accepted.then(|| PublishStep::Report {
                        since_ms: at.now_ms(),
                    })
                }
                PublishStep::Report { since_ms } => {
                    match client.await_report(at, Report::Publish, since_ms) {
                        Err(TransportError::WouldBlock) => return Err(TransportError::WouldBlock),
                        result => {
                            client.op = None;
                            return match result {
                                Ok(0) => Ok(()),
                                _ => Err(TransportError::PublishFailed),
                            };
                        }
                    }
                }
            };
            match outcome {
                Some(next) => client.op = Some(Op::Publish { key, step: next }),
                None => {
                    client.op = None;
                    return Err(TransportError::Modem);
                }
            }
        }
    }

    /// Fire-and-forget `DISC`; the slot and service are released by the
    /// teardown that starts the next connect.
    fn disconnect(&mut self) {
        if self.client.connected {
            let _ = self
                .at
                .exchange(CMD_DISCONNECT, "+CMQTTDISC:", self.client.timing.broker_ms);
        }
        self.client.connected = false;
        self.client.op = None;
        self.client.rx_phase = RxPhase::Idle;
        self.client.inbox.clear();
    }

    fn is_connected(&mut self) -> bool {
        self.client.drain_urcs(&mut *self.at);
        self.client.connected
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        self.client.drain_urcs(&mut *self.at);
        while let Some(msg) = self.client.inbox.pop_front() {
            on_message(&msg.topic, &msg.payload);
        }
    }
}
