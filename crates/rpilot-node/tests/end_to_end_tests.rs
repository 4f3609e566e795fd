//! Terminal and Pilot wired together, over memory and over loopback TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use rpilot_network::tcp::{bind_line_listener, subscribe};
use rpilot_network::{
    BroadcastSender, FunnelSender, MemoryHub, MemoryPublisher, NetworkError, TcpOptions,
    TcpPublisher, TcpPusher,
};
use rpilot_node::dispatch::HandlerFuture;
use rpilot_node::{
    DiscoverySchedule, EventKind, Pilot, RetryPolicy, Terminal, TerminalEvent, TerminalSettings,
};
use rpilot_protocol::{encode, Address, Envelope, MessageKey};

fn addr(name: &str) -> Address {
    Address::new(name).unwrap()
}

async fn wait_for(
    events: &mut mpsc::Receiver<TerminalEvent>,
    pred: impl Fn(&EventKind) -> bool,
) -> EventKind {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(300), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("observer channel closed");
        if pred(&event.kind) {
            return event.kind;
        }
    }
}

/// Loses the first `lose_first` frames it is asked to publish.
struct Lossy {
    inner: MemoryPublisher,
    lose_first: AtomicUsize,
}

impl BroadcastSender for Lossy {
    fn send(&self, target: &Address, payload: Bytes) -> Result<(), NetworkError> {
        let lose = self
            .lose_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lose {
            return Ok(());
        }
        self.inner.send(target, payload)
    }
}

/// A START handler that records every task value it is given.
fn start_recorder() -> (
    impl Fn(Address, Value) -> HandlerFuture + Send + Sync + 'static,
    mpsc::Receiver<Value>,
) {
    let (tx, rx) = mpsc::channel(16);
    let handler = move |_target: Address, value: Value| -> HandlerFuture {
        let tx = tx.clone();
        Box::pin(async move {
            tx.send(value).await?;
            Ok::<(), anyhow::Error>(())
        })
    };
    (handler, rx)
}

#[tokio::test(start_paused = true)]
async fn test_start_reaches_pilot_and_is_confirmed() {
    let (hub, funnel) = MemoryHub::new(256);
    let (terminal, mut events) =
        Terminal::new(Arc::new(hub.publisher()), TerminalSettings::default());
    let (intake, intake_rx) = MemoryHub::line_channel(16);
    tokio::spawn(terminal.clone().run(intake_rx, funnel));

    let (on_start, mut started) = start_recorder();
    let pilot = Pilot::builder(addr("rig_1"), Arc::new(hub.pusher()))
        .on_start(on_start)
        .build();
    let (_local, local_rx) = MemoryHub::line_channel(16);
    tokio::spawn(pilot.clone().run(hub.subscribe(pilot.filters()), local_rx));

    let report = terminal.discover([addr("rig_1")]).await;
    assert!(report.dead.is_empty());

    intake
        .push(encode(&Envelope::new(
            MessageKey::Start,
            addr("rig_1"),
            json!({"task": "nafc"}),
        )))
        .unwrap();

    assert_eq!(started.recv().await.unwrap(), json!({"task": "nafc"}));
    let confirmed = wait_for(&mut events, |k| matches!(k, EventKind::Confirmed { .. })).await;
    assert!(matches!(confirmed, EventKind::Confirmed { key, .. } if key == "START"));
    assert!(terminal.outbox().is_empty());

    pilot.push(MessageKey::Data, json!({"trial": 1})).unwrap();
    let data = wait_for(&mut events, |k| matches!(k, EventKind::Report { .. })).await;
    assert_eq!(
        data,
        EventKind::Report {
            key: MessageKey::Data,
            from: addr("rig_1"),
            value: json!({"trial": 1})
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_lost_command_is_redelivered() {
    let (hub, funnel) = MemoryHub::new(256);
    let lossy = Lossy {
        inner: hub.publisher(),
        lose_first: AtomicUsize::new(1),
    };
    let (terminal, mut events) = Terminal::new(Arc::new(lossy), TerminalSettings::default());
    let (_intake, intake_rx) = MemoryHub::line_channel(16);
    tokio::spawn(terminal.clone().run(intake_rx, funnel));

    let (on_start, mut started) = start_recorder();
    let pilot = Pilot::builder(addr("rig_2"), Arc::new(hub.pusher()))
        .on_start(on_start)
        .build();
    let (_local, local_rx) = MemoryHub::line_channel(16);
    tokio::spawn(pilot.clone().run(hub.subscribe(pilot.filters()), local_rx));

    let begin = tokio::time::Instant::now();
    let id = terminal.send_reliable(addr("rig_2"), MessageKey::Start, json!({"n": 1}));

    assert_eq!(started.recv().await.unwrap(), json!({"n": 1}));
    assert!(begin.elapsed() >= Duration::from_secs(10), "delivered by the first retry");
    wait_for(&mut events, |k| matches!(k, EventKind::Confirmed { .. })).await;
    assert!(!terminal.outbox().contains(&id));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(started.try_recv().is_err(), "no further deliveries after ack");
}

#[tokio::test(start_paused = true)]
async fn test_local_reports_forwarded_through_pilot() {
    let (hub, funnel) = MemoryHub::new(256);
    let (terminal, mut events) =
        Terminal::new(Arc::new(hub.publisher()), TerminalSettings::default());
    let (_intake, intake_rx) = MemoryHub::line_channel(16);
    tokio::spawn(terminal.clone().run(intake_rx, funnel));

    let pilot = Pilot::builder(addr("rig_3"), Arc::new(hub.pusher())).build();
    let (local, local_rx) = MemoryHub::line_channel(16);
    tokio::spawn(pilot.clone().run(hub.subscribe(pilot.filters()), local_rx));

    local
        .push(encode(&Envelope::new(MessageKey::State, addr("rig_3"), json!("RUNNING"))))
        .unwrap();
    // Commands are not accepted from the local side.
    local
        .push(encode(&Envelope::new(MessageKey::Start, addr("rig_3"), json!({}))))
        .unwrap();
    local
        .push(encode(&Envelope::new(MessageKey::Event, addr("rig_3"), json!({"poke": 2}))))
        .unwrap();

    let mut reports = Vec::new();
    for _ in 0..2 {
        reports.push(wait_for(&mut events, |k| matches!(k, EventKind::Report { .. })).await);
    }
    assert!(reports.contains(&EventKind::Report {
        key: MessageKey::State,
        from: addr("rig_3"),
        value: json!("RUNNING")
    }));
    assert!(reports.contains(&EventKind::Report {
        key: MessageKey::Event,
        from: addr("rig_3"),
        value: json!({"poke": 2})
    }));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(events.try_recv().is_err(), "START from the local side is refused");
}

#[tokio::test]
async fn test_terminal_and_pilot_over_tcp() {
    let options = TcpOptions {
        reconnect_delay: Duration::from_millis(20),
        ..TcpOptions::default()
    };
    let publisher = TcpPublisher::bind("127.0.0.1:0", options.clone()).await.unwrap();
    let broadcast_addr = publisher.local_addr().to_string();
    let (funnel_addr, funnel) = bind_line_listener("127.0.0.1:0", 256).await.unwrap();

    let settings = TerminalSettings {
        retry: RetryPolicy {
            interval: Duration::from_millis(200),
            ..RetryPolicy::default()
        },
        discovery: DiscoverySchedule {
            broadcast_rounds: 10,
            broadcast_interval: Duration::from_millis(50),
            directed_rounds: 5,
            directed_interval: Duration::from_millis(100),
        },
        ..TerminalSettings::default()
    };
    let (terminal, mut events) = Terminal::new(Arc::new(publisher), settings);
    let (_intake, intake_rx) = MemoryHub::line_channel(16);
    tokio::spawn(terminal.clone().run(intake_rx, funnel));

    let pusher = TcpPusher::connect(funnel_addr.to_string(), options.clone());
    let (on_start, mut started) = start_recorder();
    let pilot = Pilot::builder(addr("tcp_rig"), Arc::new(pusher))
        .on_start(on_start)
        .build();
    let broadcast = subscribe(broadcast_addr, pilot.filters(), options);
    let (_local, local_rx) = MemoryHub::line_channel(16);
    tokio::spawn(pilot.clone().run(broadcast, local_rx));

    let report = terminal.discover([addr("tcp_rig")]).await;
    assert!(report.dead.is_empty(), "pilot answered discovery");

    terminal.send_reliable(addr("tcp_rig"), MessageKey::Start, json!({"task": "tcp"}));
    let value = tokio::time::timeout(Duration::from_secs(5), started.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, json!({"task": "tcp"}));

    tokio::time::timeout(
        Duration::from_secs(5),
        wait_for(&mut events, |k| matches!(k, EventKind::Confirmed { .. })),
    )
    .await
    .unwrap();
    assert!(terminal.outbox().is_empty());
}
