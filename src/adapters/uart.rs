//! Modem UART adapters.
//!
//! | Type             | Target  | Backing                                   |
//! |------------------|---------|-------------------------------------------|
//! | `UartSerial`     | espidf  | `esp_idf_hal::uart::UartDriver`           |
//! | `SimModemSerial` | any     | scripted A7670 that answers AT commands   |
//!
//! The simulated modem answers every command the link stack sends with a
//! healthy reply.  Tests override individual replies with
//! [`SimModemSerial::set_reply`] and push unsolicited lines with
//! [`SimModemSerial::inject`].  Clones share one modem, so a test can keep a
//! handle while the [`ModemManager`](crate::link::modem::ModemManager) owns
//! the other.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::debug;

use crate::app::ports::{SerialError, SerialPort};

// ───────────────────────────────────────────────────────────────
// ESP-IDF UART
// ───────────────────────────────────────────────────────────────

#[cfg(feature = "espidf")]
pub struct UartSerial {
    driver: esp_idf_hal::uart::UartDriver<'static>,
}

#[cfg(feature = "espidf")]
impl UartSerial {
    pub fn new(driver: esp_idf_hal::uart::UartDriver<'static>) -> Self {
        Self { driver }
    }
}

#[cfg(feature = "espidf")]
impl SerialPort for UartSerial {
    fn configure(&mut self, baud: u32) {
        if let Err(e) = self
            .driver
            .change_baudrate(esp_idf_hal::units::Hertz(baud))
        {
            log::warn!("UART: baud change to {} failed — {}", baud, e);
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SerialError> {
        match self.driver.write(data) {
            Ok(n) if n == data.len() => Ok(()),
            Ok(_) => Err(SerialError::ShortWrite),
            Err(_) => Err(SerialError::Io),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.driver
            .read(buf, esp_idf_hal::delay::NON_BLOCK)
            .unwrap_or(0)
    }
}

// ───────────────────────────────────────────────────────────────
// Simulated modem
// ───────────────────────────────────────────────────────────────

/// Reply override: `None` leaves the command unanswered.
type Reply = Option<String>;

#[derive(Default)]
struct SimModem {
    rx: VecDeque<u8>,
    line: Vec<u8>,
    /// Raw bytes still owed after a `>` prompt, and the reply once they arrive.
    awaiting_data: Option<(usize, String)>,
    overrides: Vec<(String, Reply)>,
    commands: Vec<String>,
    baud: u32,
}

impl SimModem {
    fn reply(&mut self, text: &str) {
        self.rx.extend(text.as_bytes());
    }

    fn accept(&mut self, data: &[u8]) {
        for &b in data {
            if let Some((remaining, _)) = self.awaiting_data.as_mut() {
                *remaining -= 1;
                if *remaining == 0 {
                    if let Some((_, reply)) = self.awaiting_data.take() {
                        self.reply(&reply);
                    }
                }
                continue;
            }
            match b {
                b'\r' => {}
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();
                    if !line.is_empty() {
                        self.command(&line);
                    }
                }
                _ => self.line.push(b),
            }
        }
    }

    fn command(&mut self, cmd: &str) {
        debug!("SIM: << {}", cmd);
        self.commands.push(cmd.to_string());

        let scripted = self
            .overrides
            .iter()
            .rev()
            .find(|(prefix, _)| cmd.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone());
        if let Some(reply) = scripted {
            if let Some(text) = reply {
                self.reply(&text);
            }
            return;
        }

        if let Some(len) = prompt_length(cmd) {
            self.reply("\r\n>");
            if len == 0 {
                self.reply("\r\nOK\r\n");
            } else {
                self.awaiting_data = Some((len, "\r\nOK\r\n".into()));
            }
            return;
        }

        let text = default_reply(cmd);
        self.reply(&text);
    }
}

/// Payload length announced by commands that answer with a `>` prompt.
fn prompt_length(cmd: &str) -> Option<usize> {
    let args = cmd
        .strip_prefix("AT+CMQTTTOPIC=")
        .or_else(|| cmd.strip_prefix("AT+CMQTTPAYLOAD="))
        .or_else(|| cmd.strip_prefix("AT+CMQTTSUBTOPIC="))?;
    args.split(',').nth(1)?.trim().parse().ok()
}

fn default_reply(cmd: &str) -> String {
    let body = match cmd {
        "AT" | "ATE0" => "",
        "AT+CCID" => "+CCID: 89972012345678901234\r\n",
        "AT+CREG?" => "+CREG: 0,1\r\n",
        "AT+CEREG?" => "+CEREG: 0,1\r\n",
        "AT+CSQ" => "+CSQ: 21,99\r\n",
        "AT+CGPADDR=1" => "+CGPADDR: 1,10.64.12.7\r\n",
        "AT+CMQTTSTART" => return "\r\nOK\r\n\r\n+CMQTTSTART: 0\r\n".into(),
        "AT+CMQTTSUB=0" => return "\r\nOK\r\n\r\n+CMQTTSUB: 0,0\r\n".into(),
        "AT+CMQTTSTOP" => return "\r\nOK\r\n\r\n+CMQTTSTOP: 0\r\n".into(),
        c if c.starts_with("AT+CMQTTCONNECT=") => {
            return "\r\nOK\r\n\r\n+CMQTTCONNECT: 0,0\r\n".into();
        }
        c if c.starts_with("AT+CMQTTPUB=") => return "\r\nOK\r\n\r\n+CMQTTPUB: 0,0\r\n".into(),
        c if c.starts_with("AT+CMQTTDISC=") => {
            return "\r\nOK\r\n\r\n+CMQTTDISC: 0,0\r\n".into();
        }
        // CGDCONT, CGACT, CMQTTACCQ, CMQTTREL, anything else.
        _ => "",
    };
    format!("\r\n{body}OK\r\n")
}

/// Scripted A7670 behind the [`SerialPort`] trait.
#[derive(Clone, Default)]
pub struct SimModemSerial {
    modem: Rc<RefCell<SimModem>>,
}

impl SimModemSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `reply` (`None` = stay
    /// silent).  Later overrides take precedence.
    pub fn set_reply(&self, prefix: &str, reply: Option<&str>) {
        self.modem
            .borrow_mut()
            .overrides
            .push((prefix.to_string(), reply.map(str::to_string)));
    }

    /// Drop every override.
    pub fn reset_replies(&self) {
        self.modem.borrow_mut().overrides.clear();
    }

    /// Queue unsolicited output.
    pub fn inject(&self, text: &str) {
        self.modem.borrow_mut().reply(text);
    }

    /// Every command line received so far.
    pub fn commands(&self) -> Vec<String> {
        self.modem.borrow().commands.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.modem
            .borrow()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn baud(&self) -> u32 {
        self.modem.borrow().baud
    }
}

impl SerialPort for SimModemSerial {
    fn configure(&mut self, baud: u32) {
        let mut m = self.modem.borrow_mut();
        m.baud = baud;
        m.rx.clear();
        m.line.clear();
        m.awaiting_data = None;
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SerialError> {
        self.modem.borrow_mut().accept(data);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut m = self.modem.borrow_mut();
        let n = buf.len().min(m.rx.len());
        for (slot, b) in buf.iter_mut().zip(m.rx.drain(..n)) {
            *slot = b;
        }
        n
    }
}
