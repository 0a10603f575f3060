//! End to end: a gateway built from config answers a transport through the echo application,
//! and a crashing unit is restarted without losing later messages or silently dropping the one
//! it crashed on.

use async_trait::async_trait;
use lib::application::{Application, ApplicationWorker, EchoApplication};
use lib::audit::{AuditKind, AuditLog};
use lib::bus::{LocalBus, MessageBus};
use lib::config::parse_config;
use lib::gateway::Gateway;
use lib::message::{BusRecord, Event, EventStatus, Message};
use lib::transport::TransportHandle;
use lib::worker::{RestartPolicy, Runtime, UnitExit};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"{
    "transports": [{ "name": "sms1" }],
    "applications": [{ "name": "echo", "kind": "echo" }],
    "routes": [{ "transport": "sms1", "application": "echo" }],
    "middleware": [
        { "type": "logging" },
        { "type": "tag", "metadata": { "gateway": "test" } },
        { "type": "session", "ttlSecs": 60 }
    ],
    "metrics": { "enabled": true, "publishIntervalSecs": 1 }
}"#;

#[tokio::test]
async fn echo_reply_returns_to_the_transport() {
    let config = parse_config(CONFIG, Path::new("config.json")).unwrap();
    let gateway = Gateway::new(config, AuditLog::new()).unwrap();
    let runtime = gateway.start().await;
    let sms = TransportHandle::connect("sms1", gateway.bus()).await;

    let msg = Message::inbound("+27831234567", "1234", "sms1", "ping").unwrap();
    sms.submit(msg.clone()).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), sms.next_outbound())
        .await
        .expect("no reply within 5s")
        .unwrap()
        .unwrap();
    assert_eq!(reply.content(), Some("ping"));
    assert_eq!(reply.to_addr(), "+27831234567");
    assert_eq!(reply.in_reply_to(), Some(msg.message_id()));
    assert_eq!(reply.metadata().get("gateway"), Some(&json!("test")));

    let session = gateway
        .store()
        .get(&lib::session::SessionKey::for_message(&msg))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.counter("inbound_count"), 1);
    assert_eq!(session.counter("outbound_count"), 1);

    let reports = runtime.shutdown().await;
    assert!(reports.iter().all(|r| r.exit == UnitExit::Stopped));
    assert!(reports.iter().any(|r| r.name == "dispatcher"));
}

/// Echoes, but panics on the content "crash".
struct Fragile;

#[async_trait]
impl Application for Fragile {
    async fn consume_message(&self, msg: Message) -> anyhow::Result<Vec<Message>> {
        if msg.content() == Some("crash") {
            panic!("fragile application crashed");
        }
        EchoApplication.consume_message(msg).await
    }
}

#[tokio::test]
async fn crashed_application_is_restarted_and_keeps_consuming() {
    let bus = Arc::new(LocalBus::default());
    let (audit, mut records) = AuditLog::with_channel();
    let mut runtime = Runtime::new(
        RestartPolicy {
            max_restarts: 3,
            backoff: Duration::from_millis(10),
        },
        audit.clone(),
    );
    runtime.spawn(Arc::new(ApplicationWorker::new(
        "fragile",
        Arc::new(Fragile),
        bus.clone(),
        audit,
    )));
    let out = bus.subscribe("fragile.outbound").await;

    let crash = Message::inbound("+1", "app", "sms1", "crash").unwrap();
    let after = Message::inbound("+1", "app", "sms1", "still there?").unwrap();
    bus.publish("fragile.inbound", &BusRecord::Message(crash.clone()))
        .await
        .unwrap();
    bus.publish("fragile.inbound", &BusRecord::Message(after))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), out.recv())
        .await
        .expect("restarted unit did not reply")
        .unwrap()
        .unwrap();
    match reply {
        BusRecord::Message(m) => assert_eq!(m.content(), Some("still there?")),
        other => panic!("unexpected record {:?}", other.id()),
    }

    let lost = records.recv().await.unwrap();
    assert_eq!(lost.kind, AuditKind::Lost);
    assert_eq!(lost.message_id, crash.message_id());

    let reports = runtime.shutdown().await;
    assert_eq!(reports[0].restarts, 1);
}

/// Echoes messages, but panics on every delivery event.
struct BrittleEvents;

#[async_trait]
impl Application for BrittleEvents {
    async fn consume_message(&self, msg: Message) -> anyhow::Result<Vec<Message>> {
        EchoApplication.consume_message(msg).await
    }

    async fn consume_event(&self, _event: Event) -> anyhow::Result<()> {
        panic!("event handler crashed");
    }
}

#[tokio::test]
async fn event_lost_to_a_crash_is_audited() {
    let bus = Arc::new(LocalBus::default());
    let (audit, mut records) = AuditLog::with_channel();
    let mut runtime = Runtime::new(
        RestartPolicy {
            max_restarts: 3,
            backoff: Duration::from_millis(10),
        },
        audit.clone(),
    );
    runtime.spawn(Arc::new(ApplicationWorker::new(
        "brittle",
        Arc::new(BrittleEvents),
        bus.clone(),
        audit,
    )));
    let out = bus.subscribe("brittle.outbound").await;

    let sent = Message::outbound("app", "+1", "sms1", "hello").unwrap();
    let ack = Event::ack(&sent);
    bus.publish("brittle.event", &BusRecord::Event(ack.clone()))
        .await
        .unwrap();

    let lost = tokio::time::timeout(Duration::from_secs(5), records.recv())
        .await
        .expect("crashed event left no audit record")
        .unwrap();
    assert_eq!(lost.kind, AuditKind::Lost);
    assert_eq!(lost.message_id, ack.event_id());
    assert_eq!(lost.unit, "brittle");

    // The restarted unit still serves messages.
    let after = Message::inbound("+1", "app", "sms1", "still there?").unwrap();
    bus.publish("brittle.inbound", &BusRecord::Message(after))
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), out.recv())
        .await
        .expect("restarted unit did not reply")
        .unwrap()
        .unwrap();
    match reply {
        BusRecord::Message(m) => assert_eq!(m.content(), Some("still there?")),
        other => panic!("unexpected record {:?}", other.id()),
    }

    let reports = runtime.shutdown().await;
    assert_eq!(reports[0].restarts, 1);
}

#[tokio::test]
async fn transport_ack_reaches_the_application_event_channel() {
    let config = parse_config(CONFIG, Path::new("config.json")).unwrap();
    let gateway = Gateway::new(config, AuditLog::new()).unwrap();
    // Only the dispatcher runs, so the event stays queued on echo.event.
    let mut runtime = Runtime::new(RestartPolicy::default(), AuditLog::new());
    runtime.spawn(gateway.dispatcher());
    let sms = TransportHandle::connect("sms1", gateway.bus()).await;
    let events = gateway.bus().subscribe("echo.event").await;

    let outbound = Message::outbound("1234", "+2783", "sms1", "hi").unwrap();
    sms.ack(&outbound).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event not routed")
        .unwrap()
        .unwrap();
    match event {
        BusRecord::Event(e) => {
            assert_eq!(e.status(), EventStatus::Ack);
            assert_eq!(e.user_message_id(), outbound.message_id());
            assert_eq!(e.metadata().get("gateway"), Some(&json!("test")));
        }
        other => panic!("unexpected record {:?}", other.id()),
    }
    runtime.shutdown().await;
}
