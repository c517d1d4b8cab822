//! Modem bring-up against the simulated A7670.

use gatelink::app::ports::{ModemLine, ModemPort, Progress};
use gatelink::config::LinkConfig;
use gatelink::link::at::RegistrationStatus;
use gatelink::link::modem::ModemState;

use crate::mock_hw::{MockClock, SimModem, sim_modem};

/// Step `init()` every 100 ms until it reports something other than
/// `Pending` or the modem is ready.
fn drive(modem: &mut SimModem, clock: &MockClock, max_steps: usize) -> Progress {
    for _ in 0..max_steps {
        let p = modem.init();
        if p != Progress::Pending || modem.is_ready() {
            return p;
        }
        clock.advance(100);
    }
    Progress::Pending
}

#[test]
fn bring_up_reaches_complete_and_collects_info() {
    let (mut modem, serial, clock) = sim_modem(&LinkConfig::default());

    drive(&mut modem, &clock, 200);

    assert!(modem.is_ready());
    assert_eq!(modem.state(), ModemState::Complete);
    assert_eq!(modem.init(), Progress::Ready, "Complete reports success on every call");
    assert_eq!(modem.init(), Progress::Ready);

    let info = modem.info();
    assert_eq!(info.iccid.as_deref(), Some("89972012345678901234"));
    assert_eq!(info.registration, Some(RegistrationStatus::Home));
    assert_eq!(info.rssi_dbm, Some(-71));

    let cmds = serial.commands();
    let order = ["AT", "ATE0", "AT+CCID", "AT+CREG?", "AT+CSQ"];
    let positions: Vec<usize> = order
        .iter()
        .map(|c| cmds.iter().position(|x| x == c).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{cmds:?}");
    assert_eq!(serial.baud(), 115_200);
}

#[test]
fn power_on_sequences_all_lines() {
    let (mut modem, _serial, _clock) = sim_modem(&LinkConfig::default());

    assert_eq!(modem.init(), Progress::Pending);
    assert!(matches!(modem.state(), ModemState::WaitPower { .. }));

    let lines = modem.lines();
    assert!(lines.calls.contains(&(ModemLine::PowerEnable, true)));
    assert!(lines.calls.contains(&(ModemLine::Dtr, false)));
    assert_eq!(lines.pulses(ModemLine::Reset), 1);
    assert_eq!(lines.pulses(ModemLine::PowerKey), 1);
}

#[test]
fn boot_settle_is_respected() {
    let (mut modem, serial, clock) = sim_modem(&LinkConfig::default());

    modem.init();
    clock.advance(4_000);
    modem.init();
    assert!(matches!(modem.state(), ModemState::WaitPower { .. }));
    assert_eq!(serial.count("AT"), 0, "no AT traffic before the modem has booted");

    clock.advance(1_100);
    modem.init();
    assert!(matches!(modem.state(), ModemState::AtHandshake { .. }));
}

#[test]
fn silent_handshake_restarts_from_power_on() {
    let config = LinkConfig::default();
    let (mut modem, serial, clock) = sim_modem(&config);
    serial.set_reply("AT", None);

    modem.init();
    clock.advance(5_001);
    modem.init();
    assert!(matches!(modem.state(), ModemState::AtHandshake { .. }));

    // Per-command timeouts inside the window keep the handshake going.
    for _ in 0..5 {
        assert_eq!(modem.init(), Progress::Pending);
        clock.advance(5_000);
    }
    assert!(matches!(modem.state(), ModemState::AtHandshake { .. }));

    clock.advance(u64::from(config.at_init_timeout_ms));
    assert_eq!(modem.init(), Progress::Failed);

    assert_eq!(modem.state(), ModemState::PowerOn);
    assert!(!modem.is_ready());

    // The next call re-runs the full power sequence.
    assert_eq!(modem.init(), Progress::Pending);
    assert!(matches!(modem.state(), ModemState::WaitPower { .. }));
    assert_eq!(modem.lines().pulses(ModemLine::PowerKey), 2);
}

#[test]
fn echo_disable_failure_restarts_from_power_on() {
    let (mut modem, serial, clock) = sim_modem(&LinkConfig::default());
    serial.set_reply("ATE0", Some("\r\nERROR\r\n"));

    assert_eq!(drive(&mut modem, &clock, 200), Progress::Failed);
    assert_eq!(modem.state(), ModemState::PowerOn);
    assert!(!modem.is_ready());
    assert_eq!(serial.count("ATE0"), 1);
}

#[test]
fn informational_query_failures_do_not_block_bring_up() {
    let (mut modem, serial, clock) = sim_modem(&LinkConfig::default());
    serial.set_reply("AT+CCID", Some("\r\nERROR\r\n"));
    serial.set_reply("AT+CSQ", Some("\r\nERROR\r\n"));

    drive(&mut modem, &clock, 200);

    assert!(modem.is_ready());
    assert_eq!(modem.info().iccid, None);
    assert_eq!(modem.info().rssi_dbm, None);
    assert_eq!(modem.info().registration, Some(RegistrationStatus::Home));
}

#[test]
fn hard_reset_forgets_everything() {
    let (mut modem, _serial, clock) = sim_modem(&LinkConfig::default());
    drive(&mut modem, &clock, 200);
    assert!(modem.is_ready());
    let before = clock.get();

    modem.hard_reset();

    assert_eq!(modem.state(), ModemState::PowerOn);
    assert!(!modem.is_ready());
    assert_eq!(modem.info().iccid, None);
    assert_eq!(modem.lines().pulses(ModemLine::Reset), 2);
    assert!(clock.get() > before, "reset hold and settle times are waited out");
}

#[test]
fn power_cycle_drops_the_rail() {
    let (mut modem, _serial, clock) = sim_modem(&LinkConfig::default());
    drive(&mut modem, &clock, 200);

    modem.power_cycle();

    assert_eq!(modem.state(), ModemState::PowerOn);
    assert!(!modem.is_ready());
    let calls = &modem.lines().calls;
    let off = calls
        .iter()
        .rposition(|c| *c == (ModemLine::PowerEnable, false))
        .unwrap();
    assert!(calls[off..].contains(&(ModemLine::PowerEnable, true)));
}
