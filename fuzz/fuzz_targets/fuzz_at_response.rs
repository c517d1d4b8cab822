//! Fuzz target: modem response parsing
//!
//! Drives arbitrary serial output through the AT channel and the response
//! parsers.  Nothing may panic, and whatever the parsers accept must be
//! within the ranges the link stack relies on.
//!
//! cargo fuzz run fuzz_at_response

#![no_main]

use gatelink::app::ports::{AtPoll, Clock, SerialError, SerialPort};
use gatelink::link::at::{self, AtChannel};
use libfuzzer_sys::fuzz_target;

/// Serial port that replays the fuzz input, a few bytes per read.
struct Replay<'a> {
    data: &'a [u8],
}

impl SerialPort for Replay<'_> {
    fn configure(&mut self, _baud: u32) {}

    fn write(&mut self, _data: &[u8]) -> Result<(), SerialError> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.data.len()).min(7);
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data = &self.data[n..];
        n
    }
}

/// Time moves only through `delay_ms`; the loop below ticks it between polls.
struct Ticking(u64);

impl Clock for Ticking {
    fn now_ms(&self) -> u64 {
        self.0
    }

    fn delay_ms(&mut self, ms: u32) {
        self.0 += u64::from(ms);
    }
}

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    if let Some(dbm) = at::parse_csq(&text) {
        assert!((-113..=-51).contains(&dbm));
    }
    if let Some(ip) = at::parse_pdp_address(&text) {
        assert!(!ip.is_unspecified());
    }
    if let Some(iccid) = at::parse_ccid(&text) {
        assert!(iccid.bytes().all(|b| b.is_ascii_alphanumeric()));
    }
    let _ = at::parse_registration(&text);

    let mut channel = AtChannel::new(Replay { data }, Ticking(0));
    let outcome = loop {
        match channel.exchange("AT+CSQ", "OK", 1_000) {
            AtPoll::Pending => channel.delay_ms(10),
            done => break done,
        }
    };
    let resp = match outcome {
        AtPoll::Matched(r) | AtPoll::Error(r) | AtPoll::TimedOut(r) => r,
        AtPoll::Pending => unreachable!(),
    };
    assert!(resp.len() <= gatelink::app::ports::AT_RESPONSE_CAPACITY);
    let _ = at::parse_result_code(&resp, "+CSQ: ");
    while let Some(line) = channel.take_urc() {
        assert!(!line.contains('\n'));
    }
});
