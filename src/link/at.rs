//! AT command channel and response parsers.
//!
//! [`AtChannel`] wraps the modem UART and turns it into line-terminated
//! command/response exchanges.  Responses accumulate in a fixed 256-byte
//! rolling window: when it fills, the oldest bytes fall off the front so the
//! trailing `OK` / `ERROR` is always visible.
//!
//! Every received byte is also split into lines and queued (oldest evicted)
//! so unsolicited result codes that arrive mid-exchange are not lost.

use core::net::Ipv4Addr;

use log::{debug, warn};

use crate::app::ports::{
    AT_RESPONSE_CAPACITY, AtPoll, AtResponse, Clock, SerialPort, URC_LINE_CAPACITY, UrcLine,
};
use crate::text;

/// Longest command line kept for in-flight matching.
pub const CMD_CAPACITY: usize = 192;
const EXPECT_CAPACITY: usize = 32;
/// Unsolicited lines held before the oldest is evicted.
const URC_QUEUE_DEPTH: usize = 16;

// ───────────────────────────────────────────────────────────────
// Rolling response window
// ───────────────────────────────────────────────────────────────

/// Fixed-capacity byte window that discards its oldest bytes when full.
#[derive(Debug, Default)]
pub struct RollingBuffer {
    buf: heapless::Vec<u8, AT_RESPONSE_CAPACITY>,
}

impl RollingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        // Only the last CAPACITY bytes of `data` can survive.
        let data = &data[data.len().saturating_sub(AT_RESPONSE_CAPACITY)..];
        let overflow = (self.buf.len() + data.len()).saturating_sub(AT_RESPONSE_CAPACITY);
        if overflow > 0 {
            let keep = self.buf.len() - overflow;
            self.buf.copy_within(overflow.., 0);
            self.buf.truncate(keep);
        }
        // Cannot fail: room was made above.
        let _ = self.buf.extend_from_slice(data);
    }

    pub fn contains(&self, token: &str) -> bool {
        contains(&self.buf, token.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Snapshot as text.  Non-ASCII bytes are replaced with `?`.
    pub fn to_response(&self) -> AtResponse {
        let mut out = AtResponse::new();
        for &b in &self.buf {
            let c = if b.is_ascii() { b as char } else { '?' };
            // Cannot fail: both sides share the same capacity.
            let _ = out.push(c);
        }
        out
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ───────────────────────────────────────────────────────────────
// Unsolicited line queue
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LineAssembler {
    partial: heapless::Vec<u8, URC_LINE_CAPACITY>,
    lines: heapless::Deque<UrcLine, URC_QUEUE_DEPTH>,
}

impl LineAssembler {
    fn push(&mut self, data: &[u8]) {
        for &b in data {
            match b {
                b'\n' => self.finish_line(),
                b'\r' => {}
                // Overlong lines are truncated rather than split.
                _ => {
                    let _ = self.partial.push(b);
                }
            }
        }
    }

    fn finish_line(&mut self) {
        if self.partial.is_empty() {
            return;
        }
        let mut line = UrcLine::new();
        for &b in &self.partial {
            let _ = line.push(if b.is_ascii() { b as char } else { '?' });
        }
        self.partial.clear();
        if self.lines.is_full() {
            self.lines.pop_front();
        }
        let _ = self.lines.push_back(line);
    }

    fn pop(&mut self) -> Option<UrcLine> {
        self.lines.pop_front()
    }
}

// ───────────────────────────────────────────────────────────────
// AT channel
// ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct InFlight {
    cmd: heapless::String<CMD_CAPACITY>,
    expect: heapless::String<EXPECT_CAPACITY>,
    /// Fingerprint of the bytes of a raw write; `None` for command lines.
    raw: Option<u32>,
    started_ms: u64,
    timeout_ms: u32,
    rx: RollingBuffer,
}

/// Command/response exchange over a [`SerialPort`], timed by a [`Clock`].
pub struct AtChannel<S, C> {
    serial: S,
    clock: C,
    inflight: Option<InFlight>,
    urc: LineAssembler,
}

impl<S: SerialPort, C: Clock> AtChannel<S, C> {
    pub fn new(serial: S, clock: C) -> Self {
        Self {
            serial,
            clock,
            inflight: None,
            urc: LineAssembler::default(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.clock.delay_ms(ms);
    }

    pub fn configure(&mut self, baud: u32) {
        self.serial.configure(baud);
    }

    /// Discard pending input (queued as unsolicited lines, never as a response).
    pub fn flush_input(&mut self) {
        let mut chunk = [0u8; 64];
        loop {
            let n = self.serial.read(&mut chunk);
            if n == 0 {
                break;
            }
            self.urc.push(&chunk[..n]);
        }
    }

    /// Abandon the in-flight exchange, if any.
    pub fn cancel(&mut self) {
        if let Some(f) = self.inflight.take() {
            debug!("AT: abandoned '{}'", f.cmd);
        }
    }

    /// Non-blocking exchange; see [`AtPort::exchange`](crate::app::ports::AtPort::exchange).
    pub fn exchange(&mut self, cmd: &str, expect: &str, timeout_ms: u32) -> AtPoll {
        let continuing = matches!(
            &self.inflight,
            Some(f) if f.raw.is_none() && f.cmd.as_str() == truncated_cmd(cmd)
        );
        if !continuing && !self.begin(cmd, expect, timeout_ms) {
            return AtPoll::Error(AtResponse::new());
        }
        self.poll_inflight()
    }

    /// Non-blocking raw write; see
    /// [`AtPort::exchange_data`](crate::app::ports::AtPort::exchange_data).
    pub fn exchange_data(&mut self, data: &[u8], expect: &str, timeout_ms: u32) -> AtPoll {
        let tag = fingerprint(data);
        let continuing = matches!(&self.inflight, Some(f) if f.raw == Some(tag));
        if !continuing {
            self.cancel();
            if let Err(e) = self.serial.write(data) {
                warn!("AT: raw write of {} bytes failed — {}", data.len(), e);
                return AtPoll::Error(AtResponse::new());
            }
            self.inflight = Some(InFlight {
                cmd: heapless::String::new(),
                expect: text::truncate(expect),
                raw: Some(tag),
                started_ms: self.clock.now_ms(),
                timeout_ms,
                rx: RollingBuffer::new(),
            });
        }
        self.poll_inflight()
    }

    pub fn take_urc(&mut self) -> Option<UrcLine> {
        if self.inflight.is_none() {
            self.flush_input();
        }
        self.urc.pop()
    }

    fn begin(&mut self, cmd: &str, expect: &str, timeout_ms: u32) -> bool {
        self.cancel();
        self.flush_input();
        debug!("AT: >> {}", cmd);
        let written = self
            .serial
            .write(cmd.as_bytes())
            .and_then(|()| self.serial.write(b"\r\n"));
        if let Err(e) = written {
            warn!("AT: write of '{}' failed — {}", cmd, e);
            return false;
        }
        self.inflight = Some(InFlight {
            cmd: text::truncate(truncated_cmd(cmd)),
            expect: text::truncate(expect),
            raw: None,
            started_ms: self.clock.now_ms(),
            timeout_ms,
            rx: RollingBuffer::new(),
        });
        true
    }

    fn poll_inflight(&mut self) -> AtPoll {
        let now = self.clock.now_ms();
        let mut chunk = [0u8; 64];
        let Some(f) = self.inflight.as_mut() else {
            return AtPoll::Error(AtResponse::new());
        };
        loop {
            let n = self.serial.read(&mut chunk);
            if n == 0 {
                break;
            }
            f.rx.push(&chunk[..n]);
            self.urc.push(&chunk[..n]);
        }

        let outcome = if f.rx.contains(&f.expect) {
            AtPoll::Matched(f.rx.to_response())
        } else if f.rx.contains("ERROR") {
            AtPoll::Error(f.rx.to_response())
        } else if now.saturating_sub(f.started_ms) >= u64::from(f.timeout_ms) {
            AtPoll::TimedOut(f.rx.to_response())
        } else {
            return AtPoll::Pending;
        };

        match &outcome {
            AtPoll::Matched(_) => debug!("AT: << '{}' ok", f.cmd),
            AtPoll::Error(r) => debug!("AT: << '{}' ERROR ({})", f.cmd, r.trim()),
            _ => debug!("AT: '{}' timed out after {} ms", f.cmd, f.timeout_ms),
        }
        self.inflight = None;
        outcome
    }
}

fn truncated_cmd(cmd: &str) -> &str {
    &cmd[..text::floor_char_boundary(cmd, CMD_CAPACITY)]
}

/// FNV-1a over the bytes and their length.
pub(crate) fn fingerprint(data: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in data.iter().chain(&(data.len() as u32).to_le_bytes()) {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

// ───────────────────────────────────────────────────────────────
// Response parsers
// ───────────────────────────────────────────────────────────────

/// Network registration state as reported by `+CREG` / `+CEREG` / `+CGREG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RegistrationStatus {
    NotRegistered,
    Home,
    Searching,
    Denied,
    Unknown,
    Roaming,
}

impl RegistrationStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::NotRegistered,
            1 => Self::Home,
            2 => Self::Searching,
            3 => Self::Denied,
            4 => Self::Unknown,
            5 => Self::Roaming,
            _ => return None,
        })
    }

    pub fn is_registered(self) -> bool {
        matches!(self, Self::Home | Self::Roaming)
    }
}

/// Fields after `prefix` (e.g. `"+CSQ:"`) on the first line carrying it.
fn fields_after<'a>(resp: &'a str, prefix: &str) -> Option<impl Iterator<Item = &'a str>> {
    let line = resp.lines().find_map(|l| l.trim().strip_prefix(prefix))?;
    Some(line.split(',').map(|f| f.trim().trim_matches('"')))
}

/// Parse a registration query/URC.  The solicited form is `<n>,<stat>[,…]`,
/// the unsolicited form is `<stat>[,…]`.
pub fn parse_registration(resp: &str) -> Option<RegistrationStatus> {
    for prefix in ["+CEREG:", "+CREG:", "+CGREG:"] {
        let Some(fields) = fields_after(resp, prefix) else {
            continue;
        };
        let fields: heapless::Vec<&str, 8> = fields.take(8).collect();
        let stat = match fields.as_slice() {
            [only] => only,
            [_, stat, ..] => stat,
            [] => return None,
        };
        return stat.parse().ok().and_then(RegistrationStatus::from_code);
    }
    None
}

/// `+CSQ: <rssi>,<ber>` → dBm.  `99` (not detectable) yields `None`.
pub fn parse_csq(resp: &str) -> Option<i16> {
    let rssi: u8 = fields_after(resp, "+CSQ:")?.next()?.parse().ok()?;
    match rssi {
        0..=31 => Some(-113 + 2 * i16::from(rssi)),
        _ => None,
    }
}

/// `+CGPADDR: <cid>,<addr>` → a usable IPv4 address (`0.0.0.0` rejected).
pub fn parse_pdp_address(resp: &str) -> Option<Ipv4Addr> {
    let addr: Ipv4Addr = fields_after(resp, "+CGPADDR:")?.nth(1)?.parse().ok()?;
    (!addr.is_unspecified()).then_some(addr)
}

/// Numeric result following `prefix`, as in `+CMQTTCONNECT: 0,<err>` or
/// `+CMQTTSTART: <err>`.  `0` means success for every `+CMQTT*` report.
pub fn parse_result_code(resp: &str, prefix: &str) -> Option<u8> {
    let rest = &resp[resp.find(prefix)? + prefix.len()..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// ICCID from `+ICCID:` / `+CCID:` or a bare digit line.
pub fn parse_ccid(resp: &str) -> Option<heapless::String<24>> {
    let raw = ["+ICCID:", "+CCID:"]
        .iter()
        .find_map(|p| fields_after(resp, p).and_then(|mut f| f.next()))
        .or_else(|| {
            resp.lines()
                .map(str::trim)
                .find(|l| l.len() >= 18 && l.bytes().all(|b| b.is_ascii_alphanumeric()))
        })?;
    (!raw.is_empty() && raw.bytes().all(|b| b.is_ascii_alphanumeric())).then(|| text::truncate(raw))
}
