//! Broker session policy, against a fake broker and against the modem's
//! own MQTT client.

use gatelink::adapters::modem_mqtt::{ModemMqttClient, ModemMqttTiming};
use gatelink::adapters::uart::SimModemSerial;
use gatelink::app::ports::{CommandHandler, ModemPort, MqttLink};
use gatelink::config::LinkConfig;
use gatelink::link::mqtt::{MqttManager, SessionPhase};

use crate::mock_hw::{FakeLink, MockClock, SimModem, sim_modem};

#[derive(Default)]
struct Inbox {
    received: Vec<(String, Vec<u8>)>,
}

impl CommandHandler for Inbox {
    fn on_command(&mut self, topic: &str, payload: &[u8]) {
        self.received.push((topic.to_string(), payload.to_vec()));
    }
}

fn refusing() -> FakeLink {
    let link = FakeLink::new();
    link.broker.borrow_mut().refuse_connect = true;
    link
}

// ── Backoff and throttle ──────────────────────────────────────

#[test]
fn three_failures_back_off_to_four_seconds() {
    let mut mqtt = MqttManager::new(&LinkConfig::default(), 1);
    let mut link = refusing();

    assert!(!mqtt.connect(&mut link, 0));
    assert!(!mqtt.connect(&mut link, 1_000));
    assert!(!mqtt.connect(&mut link, 3_000));

    assert_eq!(link.connect_attempts(), 3);
    assert_eq!(mqtt.fail_streak(), 3);
    assert_eq!(mqtt.backoff().next_delay(), 4_000);
    assert!(mqtt.should_rebuild_ppp());
}

#[test]
fn throttled_connect_does_no_io() {
    let mut mqtt = MqttManager::new(&LinkConfig::default(), 1);
    let mut link = refusing();

    mqtt.connect(&mut link, 0);
    mqtt.connect(&mut link, 1_000);
    mqtt.connect(&mut link, 3_000);
    assert_eq!(mqtt.last_attempt_ms(), Some(3_000));

    assert!(!mqtt.connect(&mut link, 3_500));
    assert!(!mqtt.connect(&mut link, 6_999));
    assert_eq!(link.connect_attempts(), 3, "throttled calls must not touch the broker");
    assert_eq!(mqtt.fail_streak(), 3);

    link.broker.borrow_mut().refuse_connect = false;
    assert!(mqtt.connect(&mut link, 7_000));
    assert_eq!(link.connect_attempts(), 4);
    assert_eq!(mqtt.fail_streak(), 0);
    assert_eq!(mqtt.backoff().next_delay(), 1_000);
}

#[test]
fn backoff_saturates_at_ceiling() {
    let config = LinkConfig::default();
    let mut mqtt = MqttManager::new(&config, 1);
    let mut link = refusing();

    let mut now = 0;
    for _ in 0..12 {
        mqtt.connect(&mut link, now);
        now += 120_000;
    }
    assert_eq!(mqtt.backoff().next_delay(), config.backoff_max_ms);
}

// ── Session health ────────────────────────────────────────────

#[test]
fn healthy_session_is_not_reconnected() {
    let mut mqtt = MqttManager::new(&LinkConfig::default(), 1);
    let mut link = FakeLink::new();

    assert!(mqtt.connect(&mut link, 0));
    assert!(mqtt.connect(&mut link, 10));
    assert!(mqtt.connect(&mut link, 20));

    assert_eq!(link.connect_attempts(), 1);
    assert_eq!(
        link.broker.borrow().subscriptions,
        vec!["pgr/mitspe6/gate/cmd".to_string()]
    );
}

#[test]
fn rejected_subscription_is_a_failure() {
    let mut mqtt = MqttManager::new(&LinkConfig::default(), 1);
    let mut link = FakeLink::new();
    link.broker.borrow_mut().refuse_subscribe = true;

    assert!(!mqtt.connect(&mut link, 0));

    assert!(!mqtt.is_connected());
    assert_eq!(mqtt.fail_streak(), 1);
    assert!(!link.broker.borrow().up, "half-open session is torn down");
}

#[test]
fn poll_routes_only_the_command_topic() {
    let mut mqtt = MqttManager::new(&LinkConfig::default(), 1);
    let mut link = FakeLink::new();
    let mut inbox = Inbox::default();
    assert!(mqtt.connect(&mut link, 0));

    link.push_inbound("pgr/mitspe6/gate/cmd", b"{\"a\":1}");
    link.push_inbound("pgr/other/topic", b"noise");
    assert!(mqtt.poll(&mut link, &mut inbox, 10));

    assert_eq!(
        inbox.received,
        vec![("pgr/mitspe6/gate/cmd".to_string(), b"{\"a\":1}".to_vec())]
    );
}

#[test]
fn dropped_session_found_by_poll_counts_as_failure() {
    let mut mqtt = MqttManager::new(&LinkConfig::default(), 1);
    let mut link = FakeLink::new();
    let mut inbox = Inbox::default();
    assert!(mqtt.connect(&mut link, 0));

    link.drop_session();
    assert!(!mqtt.poll(&mut link, &mut inbox, 500));

    assert!(!mqtt.is_connected());
    assert_eq!(mqtt.fail_streak(), 1);
    assert_eq!(mqtt.last_attempt_ms(), Some(500));
    assert!(!mqtt.connect(&mut link, 900), "reconnect waits out the backoff");
    assert!(mqtt.connect(&mut link, 1_500));
}

#[test]
fn publish_requires_a_session() {
    let mut mqtt = MqttManager::new(&LinkConfig::default(), 1);
    let mut link = FakeLink::new();

    assert!(!mqtt.publish(&mut link, "pgr/mitspe6/gate/ack", b"{}", false));
    assert!(mqtt.connect(&mut link, 0));
    assert!(mqtt.publish(&mut link, "pgr/mitspe6/gate/ack", b"{}", false));

    link.broker.borrow_mut().refuse_publish = true;
    assert!(!mqtt.publish(&mut link, "pgr/mitspe6/gate/ack", b"{}", false));
    assert_eq!(link.published_on("pgr/mitspe6/gate/ack").len(), 1);
}

// ── Modem-hosted client ───────────────────────────────────────

#[test]
fn modem_client_connects_publishes_and_receives() {
    let config = LinkConfig::default();
    let (mut modem, serial, clock) = sim_modem(&config);
    while !modem.is_ready() {
        modem.init();
        clock.advance(100);
    }

    let mut client = ModemMqttClient::default();
    let mut mqtt = MqttManager::new(&config, 9);
    let now = clock.get();
    assert!(client.with_transport(&mut modem, |t| mqtt.connect(t, now)));
    assert!(client.is_session_open());

    let cmds = serial.commands();
    assert!(cmds.iter().any(|c| c == "AT+CMQTTSTART"));
    assert!(
        cmds.iter()
            .any(|c| c.starts_with("AT+CMQTTACCQ=0,\"gate_mitspe6-gate-001_"))
    );
    assert!(cmds.iter().any(|c| {
        c == "AT+CMQTTCONNECT=0,\"tcp://localhost:1883\",60,1,\"pgr_device_mitspe6\",\"\""
    }));
    assert!(cmds.iter().any(|c| c == "AT+CMQTTSUBTOPIC=0,20,1"));
    assert!(cmds.iter().any(|c| c == "AT+CMQTTSUB=0"));

    assert!(client.with_transport(&mut modem, |t| {
        mqtt.publish(t, "pgr/mitspe6/gate/status", b"{\"online\":true}", true)
    }));
    assert_eq!(serial.count("AT+CMQTTPUB=0,1,60,1"), 1);

    let payload = r#"{"requestId":"r-1","command":"open","userId":"u-1","issuedAt":5}"#;
    serial.inject(&format!(
        "\r\n+CMQTTRXSTART: 0,20,{len}\r\n+CMQTTRXTOPIC: 0,20\r\npgr/mitspe6/gate/cmd\r\n\
         +CMQTTRXPAYLOAD: 0,{len}\r\n{payload}\r\n+CMQTTRXEND: 0\r\n",
        len = payload.len()
    ));
    let mut inbox = Inbox::default();
    assert!(client.with_transport(&mut modem, |t| mqtt.poll(t, &mut inbox, now)));
    assert_eq!(
        inbox.received,
        vec![(
            "pgr/mitspe6/gate/cmd".to_string(),
            payload.as_bytes().to_vec()
        )]
    );
}

#[test]
fn modem_connection_loss_is_noticed() {
    let config = LinkConfig::default();
    let (mut modem, serial, clock) = sim_modem(&config);
    while !modem.is_ready() {
        modem.init();
        clock.advance(100);
    }

    let mut client = ModemMqttClient::default();
    let mut mqtt = MqttManager::new(&config, 9);
    let now = clock.get();
    assert!(client.with_transport(&mut modem, |t| mqtt.connect(t, now)));

    serial.inject("\r\n+CMQTTCONNLOST: 0,3\r\n");
    let mut inbox = Inbox::default();
    assert!(!client.with_transport(&mut modem, |t| mqtt.poll(t, &mut inbox, now + 10)));
    assert!(!client.is_session_open());
    assert_eq!(mqtt.fail_streak(), 1);
}

#[test]
fn broker_refusal_through_the_modem() {
    let config = LinkConfig::default();
    let (mut modem, serial, clock) = sim_modem(&config);
    while !modem.is_ready() {
        modem.init();
        clock.advance(100);
    }
    serial.set_reply(
        "AT+CMQTTCONNECT=",
        Some("\r\nOK\r\n\r\n+CMQTTCONNECT: 0,11\r\n"),
    );

    let mut client = ModemMqttClient::default();
    let mut mqtt = MqttManager::new(&config, 9);
    let now = clock.get();
    assert!(!client.with_transport(&mut modem, |t| mqtt.connect(t, now)));

    assert!(!client.is_session_open());
    assert_eq!(mqtt.fail_streak(), 1);
    // The half-acquired client slot is released again.
    assert_eq!(serial.count("AT+CMQTTREL=0"), 1);
    assert_eq!(serial.count("AT+CMQTTSUB"), 0);
}

fn ready_modem(config: &LinkConfig) -> (SimModem, SimModemSerial, MockClock) {
    let (mut modem, serial, clock) = sim_modem(config);
    while !modem.is_ready() {
        modem.init();
        clock.advance(100);
    }
    (modem, serial, clock)
}

#[test]
fn silent_modem_never_stalls_the_caller() {
    let config = LinkConfig::default();
    let (mut modem, serial, clock) = ready_modem(&config);
    serial.set_reply("AT+CMQTTCONNECT=", None);
    serial.set_reply("AT+CMQTTREL", None);
    serial.set_reply("AT+CMQTTSTOP", None);

    let mut client = ModemMqttClient::default();
    let mut mqtt = MqttManager::new(&config, 9);
    let start = clock.get();
    assert!(!client.with_transport(&mut modem, |t| mqtt.connect(t, start)));
    assert_eq!(clock.get(), start, "the call returned without waiting");
    assert!(client.is_busy());
    assert_eq!(mqtt.phase(), SessionPhase::Connecting);
    assert_eq!(mqtt.fail_streak(), 0);

    // The CONNECT answer, then the slot release, then the service stop each
    // run out the command timeout, one call apiece.
    let step = u64::from(ModemMqttTiming::default().command_ms);
    for _ in 0..3 {
        clock.advance(step);
        let now = clock.get();
        assert!(!client.with_transport(&mut modem, |t| mqtt.connect(t, now)));
    }

    assert_eq!(clock.get(), start + 3 * step);
    assert!(!client.is_busy());
    assert!(!client.is_session_open());
    assert_eq!(mqtt.phase(), SessionPhase::Down);
    assert_eq!(mqtt.fail_streak(), 1);
    assert_eq!(serial.count("AT+CMQTTCONNECT="), 1);
    assert_eq!(serial.count("AT+CMQTTREL=0"), 1);
    assert_eq!(serial.count("AT+CMQTTSTOP"), 1);
}

#[test]
fn late_publish_report_completes_on_a_later_call() {
    let config = LinkConfig::default();
    let (mut modem, serial, clock) = ready_modem(&config);
    let mut client = ModemMqttClient::default();
    let mut mqtt = MqttManager::new(&config, 9);
    let now = clock.get();
    assert!(client.with_transport(&mut modem, |t| mqtt.connect(t, now)));

    serial.set_reply("AT+CMQTTPUB=", Some("\r\nOK\r\n"));
    let publish = |client: &mut ModemMqttClient, modem: &mut SimModem, mqtt: &mut MqttManager| {
        client.with_transport(modem, |t| {
            mqtt.publish(t, "pgr/mitspe6/gate/ack", b"{\"ok\":true}", false)
        })
    };
    assert!(!publish(&mut client, &mut modem, &mut mqtt));
    assert!(client.is_busy());
    assert!(mqtt.is_connected(), "an unfinished publish is not a session failure");

    serial.inject("\r\n+CMQTTPUB: 0,0\r\n");
    assert!(publish(&mut client, &mut modem, &mut mqtt));
    assert!(!client.is_busy());
    assert_eq!(serial.count("AT+CMQTTPUB=0,1,60,0"), 1, "the publish is not re-sent");
}

#[test]
fn unquotable_credentials_never_reach_the_modem() {
    let mut config = LinkConfig::default();
    config.mqtt_password = "p\"\r\nAT+CFUN=0\r\n".to_string();
    let (mut modem, serial, clock) = ready_modem(&config);
    let mut client = ModemMqttClient::default();
    let mut mqtt = MqttManager::new(&config, 9);
    let now = clock.get();

    assert!(!client.with_transport(&mut modem, |t| mqtt.connect(t, now)));
    assert_eq!(mqtt.fail_streak(), 1);
    assert_eq!(serial.count("AT+CMQTTCONNECT"), 0);
    assert_eq!(serial.count("AT+CFUN=0"), 0);
}
