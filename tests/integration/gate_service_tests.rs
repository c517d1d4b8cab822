//! Gate commands end to end: broker → supervisor → gate service → relay →
//! acknowledgement back to the broker.

use gatelink::adapters::nvs::NvsAdapter;
use gatelink::app::events::{AppEvent, GateEvent};
use gatelink::diagnostics::{DiagnosticLevel, DiagnosticLog};
use gatelink::link::supervisor::LinkStatus;
use serde_json::{Value, json};

use crate::mock_hw::{LinkRig, host_nvs};

/// One iteration of the main loop.
fn cycle(rig: &mut LinkRig, diag: &mut DiagnosticLog<NvsAdapter>) -> LinkStatus {
    let status = rig.tick();
    let now = rig.clock.get();
    rig.service.process(now, &mut rig.sink);
    rig.service.on_link(&status, now, diag);
    let (supervisor, modem, link) = (&mut rig.supervisor, &mut rig.modem, &mut rig.link);
    rig.service.flush(diag, |topic, payload, retained| {
        supervisor.publish(&mut *modem, &mut *link, topic, payload, retained)
    });
    status
}

fn command(request_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "requestId": request_id,
        "command": "open",
        "userId": "u-17",
        "issuedAt": 1_712_345_678_901_u64,
    }))
    .unwrap()
}

fn acks(rig: &LinkRig) -> Vec<Value> {
    rig.link
        .published_on(&rig.config.ack_topic)
        .iter()
        .map(|(p, retained)| {
            assert!(!retained, "acks are never retained");
            serde_json::from_slice(p).unwrap()
        })
        .collect()
}

fn connected_rig() -> (LinkRig, DiagnosticLog<NvsAdapter>) {
    let mut rig = LinkRig::new();
    let mut diag = DiagnosticLog::new(host_nvs());
    for _ in 0..500 {
        if cycle(&mut rig, &mut diag).mqtt_connected {
            return (rig, diag);
        }
    }
    panic!("link never came up");
}

#[test]
fn open_command_pulses_relay_and_acks() {
    let (mut rig, mut diag) = connected_rig();
    let cmd_topic = rig.config.cmd_topic.clone();

    rig.link.push_inbound(&cmd_topic, &command("r-1"));
    cycle(&mut rig, &mut diag);

    assert_eq!(rig.relay.count(), 1);
    assert_eq!(acks(&rig), vec![json!({"requestId": "r-1", "ok": true})]);
    assert!(rig.sink.events.iter().any(|e| matches!(
        e,
        AppEvent::Gate(GateEvent::Opened { request_id }) if request_id == "r-1"
    )));
}

#[test]
fn redelivered_command_is_acked_once_more_without_actuation() {
    let (mut rig, mut diag) = connected_rig();
    let cmd_topic = rig.config.cmd_topic.clone();

    rig.link.push_inbound(&cmd_topic, &command("r-1"));
    cycle(&mut rig, &mut diag);
    rig.clock.advance(10_000);
    rig.link.push_inbound(&cmd_topic, &command("r-1"));
    cycle(&mut rig, &mut diag);

    assert_eq!(rig.relay.count(), 1);
    assert_eq!(
        acks(&rig),
        vec![
            json!({"requestId": "r-1", "ok": true}),
            json!({"requestId": "r-1", "ok": true}),
        ]
    );
}

#[test]
fn cooldown_refuses_a_second_opening() {
    let (mut rig, mut diag) = connected_rig();
    let cmd_topic = rig.config.cmd_topic.clone();

    rig.link.push_inbound(&cmd_topic, &command("r-1"));
    cycle(&mut rig, &mut diag);
    rig.link.push_inbound(&cmd_topic, &command("r-2"));
    cycle(&mut rig, &mut diag);

    assert_eq!(rig.relay.count(), 1);
    assert_eq!(
        acks(&rig)[1],
        json!({"requestId": "r-2", "ok": false, "errorCode": "COOLDOWN"})
    );

    // A refused request may be retried once the cooldown is over.
    rig.clock.advance(u64::from(rig.config.gate_cooldown_ms));
    rig.link.push_inbound(&cmd_topic, &command("r-2"));
    cycle(&mut rig, &mut diag);
    assert_eq!(rig.relay.count(), 2);
    assert_eq!(acks(&rig)[2], json!({"requestId": "r-2", "ok": true}));
}

#[test]
fn unknown_and_malformed_commands() {
    let (mut rig, mut diag) = connected_rig();
    let cmd_topic = rig.config.cmd_topic.clone();

    let close = serde_json::to_vec(
        &json!({"requestId": "r-9", "command": "close", "userId": "u", "issuedAt": 1}),
    )
    .unwrap();
    rig.link.push_inbound(&cmd_topic, &close);
    rig.link.push_inbound(&cmd_topic, b"{not json");
    cycle(&mut rig, &mut diag);

    assert_eq!(rig.relay.count(), 0);
    assert_eq!(
        acks(&rig),
        vec![json!({"requestId": "r-9", "ok": false, "errorCode": "UNKNOWN_COMMAND"})]
    );
    assert!(
        rig.sink
            .events
            .iter()
            .any(|e| matches!(e, AppEvent::Gate(GateEvent::Malformed(_))))
    );
}

#[test]
fn ack_survives_a_failed_publish() {
    let (mut rig, mut diag) = connected_rig();
    let cmd_topic = rig.config.cmd_topic.clone();

    rig.link.broker.borrow_mut().refuse_publish = true;
    rig.link.push_inbound(&cmd_topic, &command("r-1"));
    cycle(&mut rig, &mut diag);
    assert_eq!(rig.relay.count(), 1);
    assert!(acks(&rig).is_empty());

    rig.link.broker.borrow_mut().refuse_publish = false;
    cycle(&mut rig, &mut diag);
    assert_eq!(acks(&rig), vec![json!({"requestId": "r-1", "ok": true})]);
}

#[test]
fn status_heartbeat_is_retained() {
    let (mut rig, mut diag) = connected_rig();
    let interval = u64::from(rig.config.status_interval_ms);

    let statuses = rig.link.published_on(&rig.config.status_topic);
    assert_eq!(statuses.len(), 1, "a heartbeat goes out as soon as MQTT is up");
    let (payload, retained) = &statuses[0];
    assert!(retained);
    let status: Value = serde_json::from_slice(payload).unwrap();
    assert_eq!(status["deviceId"], json!(rig.config.device_id));
    assert_eq!(status["online"], json!(true));
    assert_eq!(status["rssi"], json!(-71));
    assert_eq!(status["fwVersion"], json!(rig.config.fw_version));

    rig.clock.advance(interval);
    cycle(&mut rig, &mut diag);
    assert_eq!(rig.link.published_on(&rig.config.status_topic).len(), 2);
}

#[test]
fn diagnostics_from_last_boot_are_uploaded_on_connect() {
    let nvs = host_nvs();
    {
        let mut previous_boot = DiagnosticLog::new(nvs.clone());
        previous_boot.append(1_200, DiagnosticLevel::Error, "ppp_failed", Some("timeout"));
        previous_boot.append(1_900, DiagnosticLevel::Warn, "modem_hard_reset", None);
    }

    let mut rig = LinkRig::new();
    let mut diag = DiagnosticLog::new(nvs.clone());
    assert_eq!(diag.entry_count(), 2);
    for _ in 0..500 {
        if cycle(&mut rig, &mut diag).mqtt_connected {
            break;
        }
    }

    let uploads = rig.link.published_on(&rig.config.diagnostics_topic);
    assert_eq!(uploads.len(), 1);
    let (payload, retained) = &uploads[0];
    assert!(!retained);
    let body: Value = serde_json::from_slice(payload).unwrap();
    assert_eq!(body["sessionId"], json!("0000beef"));
    assert_eq!(body["deviceId"], json!(rig.config.device_id));
    assert_eq!(body["entries"][0]["event"], json!("ppp_failed"));
    assert_eq!(body["entries"][0]["level"], json!("error"));
    assert_eq!(body["entries"][0]["message"], json!("timeout"));
    assert_eq!(body["entries"][1]["event"], json!("modem_hard_reset"));
    assert!(body["entries"][1].get("message").is_none());

    assert!(!diag.has_entries());
    assert!(!DiagnosticLog::new(nvs).has_entries(), "upload is trimmed from flash too");
}
