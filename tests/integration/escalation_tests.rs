//! Cross-layer recovery driven by the link supervisor.

use std::net::Ipv4Addr;

use gatelink::app::events::{AppEvent, LinkEvent};
use gatelink::app::ports::{ModemLine, ModemPort};
use gatelink::error::PppError;
use gatelink::link::modem::ModemState;

use crate::mock_hw::{CollectingSink, LinkRig};

fn link_events(sink: &CollectingSink) -> Vec<LinkEvent> {
    sink.events
        .iter()
        .filter_map(|e| match e {
            AppEvent::Link(l) => Some(*l),
            AppEvent::Gate(_) => None,
        })
        .collect()
}

fn saw(sink: &CollectingSink, pred: impl Fn(&LinkEvent) -> bool) -> bool {
    link_events(sink).iter().any(pred)
}

#[test]
fn cold_start_comes_up_bottom_up() {
    let mut rig = LinkRig::new();

    let status = rig.connect();

    assert!(status.modem_ready && status.ppp_up && status.mqtt_connected);
    assert_eq!(status.rssi_dbm, Some(-71));

    let events = link_events(&rig.sink);
    assert_eq!(
        events,
        vec![
            LinkEvent::ModemReady {
                rssi_dbm: Some(-71)
            },
            LinkEvent::PppUp {
                ip: Ipv4Addr::new(10, 64, 12, 7)
            },
            LinkEvent::MqttConnected,
        ]
    );
    assert_eq!(
        rig.link.broker.borrow().subscriptions,
        vec![rig.config.cmd_topic.clone()]
    );
}

#[test]
fn nothing_above_the_modem_runs_before_it_is_ready() {
    let mut rig = LinkRig::new();
    rig.serial.set_reply("AT", None);

    rig.tick_until(1_000, |_, sink| {
        saw(sink, |e| matches!(e, LinkEvent::ModemInitFailed))
    });

    assert_eq!(rig.modem.state(), ModemState::PowerOn);
    assert_eq!(rig.serial.count("AT+CEREG"), 0);
    assert_eq!(rig.serial.count("AT+CGACT"), 0);
    assert_eq!(rig.link.connect_attempts(), 0);
}

#[test]
fn mqtt_failures_rebuild_ppp() {
    let mut rig = LinkRig::new();
    rig.link.broker.borrow_mut().refuse_connect = true;

    rig.tick_until(500, |_, sink| {
        saw(sink, |e| matches!(e, LinkEvent::PppRebuildEscalated { .. }))
    });

    assert!(saw(&rig.sink, |e| *e
        == LinkEvent::PppRebuildEscalated { mqtt_streak: 3 }));
    let failures: Vec<u8> = link_events(&rig.sink)
        .iter()
        .filter_map(|e| match e {
            LinkEvent::MqttFailed { streak } => Some(*streak),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![1, 2, 3]);
    assert_eq!(rig.supervisor.mqtt().fail_streak(), 0);
    assert!(!rig.supervisor.ppp().is_up());
    assert_eq!(rig.serial.count("AT+CGACT=0,1"), 1);
    assert!(rig.modem.is_ready(), "a PPP rebuild leaves the modem alone");

    rig.link.broker.borrow_mut().refuse_connect = false;
    let status = rig.connect();
    assert!(status.ppp_up);
    let ups = link_events(&rig.sink)
        .iter()
        .filter(|e| matches!(e, LinkEvent::PppUp { .. }))
        .count();
    assert_eq!(ups, 2);
}

#[test]
fn ppp_failures_hard_reset_the_modem() {
    let mut rig = LinkRig::new();
    rig.serial
        .set_reply("AT+CEREG?", Some("\r\n+CEREG: 0,3\r\n\r\nOK\r\n"));

    rig.tick_until(500, |_, sink| {
        saw(sink, |e| matches!(e, LinkEvent::ModemResetEscalated { .. }))
    });

    let events = link_events(&rig.sink);
    assert!(events.contains(&LinkEvent::PppFailed {
        reason: PppError::RegistrationDenied,
        streak: 1
    }));
    assert!(events.contains(&LinkEvent::PppFailed {
        reason: PppError::RegistrationDenied,
        streak: 2
    }));
    assert!(events.contains(&LinkEvent::ModemResetEscalated { ppp_streak: 2 }));
    assert_eq!(rig.modem.state(), ModemState::PowerOn);
    assert_eq!(rig.modem.lines().pulses(ModemLine::Reset), 2);
    assert_eq!(rig.supervisor.ppp().fail_streak(), 0);
    assert_eq!(rig.link.connect_attempts(), 0);

    rig.serial.reset_replies();
    let status = rig.connect();
    assert!(status.modem_ready);
    let readies = link_events(&rig.sink)
        .iter()
        .filter(|e| matches!(e, LinkEvent::ModemReady { .. }))
        .count();
    assert_eq!(readies, 2);
}

#[test]
fn broker_drop_is_reported_and_recovered() {
    let mut rig = LinkRig::new();
    rig.connect();

    rig.link.drop_session();
    let status = rig.tick();

    assert!(!status.mqtt_connected);
    assert!(status.ppp_up, "a single drop does not touch PPP");
    assert_eq!(
        link_events(&rig.sink).last(),
        Some(&LinkEvent::MqttLost { streak: 1 })
    );

    let status = rig.connect();
    assert!(status.mqtt_connected);
    assert_eq!(rig.supervisor.mqtt().fail_streak(), 0);
    assert_eq!(rig.link.connect_attempts(), 2);
}

#[test]
fn status_reports_modem_down_during_reset() {
    let mut rig = LinkRig::new();
    rig.connect();

    rig.modem.hard_reset();
    let status = rig.tick();

    assert!(!status.modem_ready);
    assert!(!status.ppp_up);
    assert!(!status.mqtt_connected);
}
