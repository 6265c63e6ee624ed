//! Integration tests: sender link and receiver server talking over a
//! real TCP connection on localhost.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use inputlink_core::config::{BackoffConfig, TimeoutConfig};
use inputlink_core::protocol::{ErrorCode, ErrorPayload, HelloPayload};
use inputlink_core::{
    Axes, Connection, ControllerSample, DeviceRegistry, Endpoint, Envelope, EventBus,
    InboundServer, InputMethod, LinkError, LinkEvent, OutboundLink, OutboundQueue, Payload,
    ReceiverConfig, SenderConfig, VirtualDeviceCapability,
};
use parking_lot::Mutex;
use tokio::sync::watch;

// ── Helpers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Create(u32),
    Apply(u32, u64),
    Destroy(u32),
}

/// Capability that records every call it receives.
#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn applied(&self, n: u32) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Apply(number, seq) if number == n => Some(seq),
                _ => None,
            })
            .collect()
    }

    fn has(&self, call: &Call) -> bool {
        self.calls.lock().contains(call)
    }
}

impl VirtualDeviceCapability for Recorder {
    type Handle = u32;

    fn name(&self) -> &str {
        "recorder"
    }

    fn create(&self, n: u32) -> Result<u32, LinkError> {
        self.calls.lock().push(Call::Create(n));
        Ok(n)
    }

    fn apply(&self, handle: &mut u32, sample: &ControllerSample) -> Result<(), LinkError> {
        self.calls.lock().push(Call::Apply(*handle, sample.sequence));
        Ok(())
    }

    fn destroy(&self, handle: u32) -> Result<(), LinkError> {
        self.calls.lock().push(Call::Destroy(handle));
        Ok(())
    }
}

fn receiver_config() -> ReceiverConfig {
    ReceiverConfig {
        listen_host: "127.0.0.1".into(),
        listen_port: 0,
        ..Default::default()
    }
}

/// Start a receiver on an OS-assigned port.
async fn start_receiver(
    config: ReceiverConfig,
) -> (InboundServer<Recorder>, Recorder, EventBus) {
    let recorder = Recorder::default();
    let events = EventBus::default();
    let registry = Arc::new(DeviceRegistry::from_config(
        recorder.clone(),
        &config,
        events.clone(),
    ));
    let server = InboundServer::bind(&config, registry, events.clone())
        .await
        .unwrap();
    (server, recorder, events)
}

fn sender_config(addr: SocketAddr) -> SenderConfig {
    SenderConfig {
        receiver_host: addr.ip().to_string(),
        receiver_port: addr.port(),
        backoff: BackoffConfig {
            base_ms: 20,
            max_ms: 100,
            stability_threshold_ms: 10_000,
        },
        timeouts: TimeoutConfig {
            connect_ms: 500,
            handshake_ms: 500,
            keepalive_ms: 200,
            max_in_flight_age_ms: 500,
            stop_grace_ms: 500,
        },
        ..Default::default()
    }
}

fn sample(n: u32, sequence: u64) -> ControllerSample {
    ControllerSample {
        controller_number: n,
        controller_id: format!("pad-{n}"),
        input_method: InputMethod::Xinput,
        buttons: Default::default(),
        axes: Axes::default(),
        sequence,
        capture_time_us: sequence * 1_000,
    }
}

/// Open a raw client session and claim `numbers`.
async fn hello(addr: SocketAddr, numbers: &[u32]) -> Connection {
    let mut conn = Connection::connect(&Endpoint::from(addr), Duration::from_secs(1))
        .await
        .unwrap();
    let claimed: BTreeSet<u32> = numbers.iter().copied().collect();
    let hello = Envelope::hello(HelloPayload::new("test-sender", &claimed));
    let hello_id = hello.message_id;
    conn.send(&hello).await.unwrap();

    let ack = recv(&mut conn).await;
    let Payload::Status(status) = ack.payload else {
        panic!("expected STATUS, got {:?}", ack.kind());
    };
    assert_eq!(status.in_reply_to, Some(hello_id));
    assert_eq!(status.accepted, claimed.into_iter().collect::<Vec<_>>());
    conn
}

async fn recv(conn: &mut Connection) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), conn.recv())
        .await
        .expect("timeout")
        .expect("recv failed")
}

/// Receive until an ERROR arrives.
async fn recv_error(conn: &mut Connection) -> ErrorPayload {
    loop {
        if let Payload::Error(error) = recv(conn).await.payload {
            return error;
        }
    }
}

/// Poll `f` until it holds, or fail after five seconds.
async fn wait_until(mut f: impl FnMut() -> bool) {
    let poll = async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("condition not reached");
}

// ── Sender → receiver ────────────────────────────────────────────

#[tokio::test]
async fn test_samples_reach_device_in_order() {
    let (mut server, recorder, _) = start_receiver(receiver_config()).await;
    let queue = Arc::new(OutboundQueue::new(64));
    let (_claims_tx, claims) = watch::channel(BTreeSet::from([1, 2]));
    let mut link = OutboundLink::start(
        &sender_config(server.local_addr()),
        queue,
        claims,
        EventBus::default(),
    );

    for seq in 1..=5 {
        link.enqueue(&Envelope::input(sample(1, seq))).unwrap();
        link.enqueue(&Envelope::input(sample(2, seq))).unwrap();
    }

    wait_until(|| recorder.applied(1).len() == 5 && recorder.applied(2).len() == 5).await;
    assert_eq!(recorder.applied(1), vec![1, 2, 3, 4, 5]);
    assert_eq!(recorder.applied(2), vec![1, 2, 3, 4, 5]);
    assert_eq!(server.registry().stats().active, 2);

    link.stop().await;
    wait_until(|| recorder.has(&Call::Destroy(1)) && recorder.has(&Call::Destroy(2))).await;
    server.stop().await;
}

#[tokio::test]
async fn test_sender_reconnects_after_receiver_restart() {
    let (mut first, first_recorder, _) = start_receiver(receiver_config()).await;
    let addr = first.local_addr();

    let queue = Arc::new(OutboundQueue::new(64));
    let (_claims_tx, claims) = watch::channel(BTreeSet::from([1]));
    let events = EventBus::default();
    let mut bus = events.subscribe();
    let mut link = OutboundLink::start(&sender_config(addr), queue, claims, events);

    link.enqueue(&Envelope::input(sample(1, 1))).unwrap();
    wait_until(|| first_recorder.applied(1) == vec![1]).await;

    first.stop().await;
    assert!(first_recorder.has(&Call::Destroy(1)));

    // The link notices the drop and starts backing off.
    let backing_off = async {
        let mut was_connected = false;
        loop {
            if let LinkEvent::LinkState(state) = bus.recv().await.unwrap() {
                if state.is_connected() {
                    was_connected = true;
                } else if was_connected {
                    return;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), backing_off)
        .await
        .expect("link never noticed the restart");

    link.enqueue(&Envelope::input(sample(1, 2))).unwrap();

    let (mut second, second_recorder, _) = start_receiver(ReceiverConfig {
        listen_port: addr.port(),
        ..receiver_config()
    })
    .await;
    wait_until(|| second_recorder.applied(1).contains(&2)).await;
    assert!(link.stats().reconnects >= 1);

    link.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn test_unplugged_controller_is_not_recreated_by_backlog() {
    // Reserve a port with no receiver behind it yet.
    let port = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    let queue = Arc::new(OutboundQueue::new(64));
    let (claims_tx, claims) = watch::channel(BTreeSet::from([1, 2]));
    let mut link = OutboundLink::start(&sender_config(addr), queue, claims, EventBus::default());
    link.enqueue(&Envelope::input(sample(1, 1))).unwrap();
    link.enqueue(&Envelope::input(sample(2, 1))).unwrap();

    // Controller 2 goes away before the receiver comes up.
    claims_tx.send_replace(BTreeSet::from([1]));
    let (mut server, recorder, _) = start_receiver(ReceiverConfig {
        listen_port: port,
        ..receiver_config()
    })
    .await;

    wait_until(|| recorder.applied(1) == vec![1]).await;
    link.enqueue(&Envelope::input(sample(1, 2))).unwrap();
    wait_until(|| recorder.applied(1) == vec![1, 2]).await;

    assert!(!recorder.has(&Call::Create(2)));
    assert_eq!(server.registry().state_of(2), inputlink_core::DeviceState::Unbound);

    link.stop().await;
    server.stop().await;
}

// ── Device limit and ownership ───────────────────────────────────

#[tokio::test]
async fn test_device_limit_rejects_extra_controller() {
    let (mut server, recorder, events) = start_receiver(ReceiverConfig {
        max_virtual_devices: 2,
        ..receiver_config()
    })
    .await;
    let mut bus = events.subscribe();
    let mut conn = hello(server.local_addr(), &[1, 2, 3]).await;

    for n in 1..=3 {
        conn.send(&Envelope::input(sample(n, 1))).await.unwrap();
    }

    let error = recv_error(&mut conn).await;
    assert_eq!(error.code, ErrorCode::DeviceLimit);
    assert_eq!(error.controller_number, Some(3));

    wait_until(|| recorder.applied(1) == vec![1] && recorder.applied(2) == vec![1]).await;
    assert!(!recorder.has(&Call::Create(3)));
    assert_eq!(server.registry().stats().rejected_total, 1);

    let rejected = async {
        loop {
            if let LinkEvent::DeviceRejected { controller_number } = bus.recv().await.unwrap() {
                return controller_number;
            }
        }
    };
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), rejected)
            .await
            .unwrap(),
        3
    );

    server.stop().await;
}

#[tokio::test]
async fn test_second_session_takes_over_controller() {
    let (mut server, recorder, _) = start_receiver(receiver_config()).await;
    let addr = server.local_addr();

    let mut first = hello(addr, &[1]).await;
    first.send(&Envelope::input(sample(1, 1))).await.unwrap();
    wait_until(|| recorder.applied(1) == vec![1]).await;

    let mut second = hello(addr, &[1]).await;
    second.send(&Envelope::input(sample(1, 1))).await.unwrap();
    wait_until(|| recorder.applied(1) == vec![1, 1]).await;

    assert_eq!(
        recorder.calls(),
        vec![
            Call::Create(1),
            Call::Apply(1, 1),
            Call::Destroy(1),
            Call::Create(1),
            Call::Apply(1, 1),
        ]
    );

    // The revoked session is told it no longer owns the controller.
    first.send(&Envelope::input(sample(1, 2))).await.unwrap();
    let error = recv_error(&mut first).await;
    assert_eq!(error.code, ErrorCode::NotOwner);
    assert_eq!(error.controller_number, Some(1));
    assert_eq!(recorder.applied(1), vec![1, 1]);

    server.stop().await;
}

// ── Session lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn test_stale_session_releases_devices() {
    let (mut server, recorder, events) = start_receiver(ReceiverConfig {
        session_timeout_ms: 200,
        ..receiver_config()
    })
    .await;
    let mut bus = events.subscribe();
    let mut conn = hello(server.local_addr(), &[1]).await;
    conn.send(&Envelope::input(sample(1, 1))).await.unwrap();

    // Go quiet until the receiver gives up on us.
    let stale = async {
        loop {
            if let LinkEvent::SessionStale { .. } = bus.recv().await.unwrap() {
                return;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), stale)
        .await
        .expect("session never went stale");

    wait_until(|| recorder.has(&Call::Destroy(1))).await;
    wait_until(|| server.live_sessions() == 0).await;
    assert!(matches!(conn.recv().await, Err(LinkError::ConnectionClosed)));

    server.stop().await;
}

#[tokio::test]
async fn test_receiver_stop_destroys_all_devices() {
    let (mut server, recorder, _) = start_receiver(receiver_config()).await;
    let addr = server.local_addr();

    let mut a = hello(addr, &[1]).await;
    let mut b = hello(addr, &[2]).await;
    a.send(&Envelope::input(sample(1, 1))).await.unwrap();
    b.send(&Envelope::input(sample(2, 1))).await.unwrap();
    wait_until(|| server.registry().stats().active == 2).await;
    assert_eq!(server.sessions().len(), 2);

    tokio::time::timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("stop hung");

    assert!(recorder.has(&Call::Destroy(1)));
    assert!(recorder.has(&Call::Destroy(2)));
    assert_eq!(server.registry().stats().live, 0);
    assert_eq!(server.live_sessions(), 0);
}

#[tokio::test]
async fn test_stop_completes_when_peer_stops_reading() {
    let (mut server, _, _) = start_receiver(ReceiverConfig {
        session_timeout_ms: 60_000,
        ..receiver_config()
    })
    .await;

    // A tiny receive buffer so the server's pongs back up quickly.
    let socket = tokio::net::TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    let stream = socket.connect(server.local_addr()).await.unwrap();
    let mut conn = Connection::new(stream).unwrap();
    let flood = tokio::spawn(async move {
        let mut nonce = 0u64;
        while conn.send(&Envelope::ping(nonce)).await.is_ok() {
            nonce += 1;
        }
    });

    wait_until(|| server.live_sessions() == 1).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    tokio::time::timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("stop hung on a peer that does not read");
    assert_eq!(server.live_sessions(), 0);

    tokio::time::timeout(Duration::from_secs(5), flood)
        .await
        .expect("flood task still writing")
        .unwrap();
}

// ── Error scenarios ──────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_kind_is_ignored() {
    let (mut server, _, _) = start_receiver(receiver_config()).await;
    let mut conn = hello(server.local_addr(), &[1]).await;

    conn.send_encoded(Bytes::from_static(
        br#"{"protocol_version":"1.3","message_id":9,"kind":"rumble","payload":{"strength":1}}"#,
    ))
    .await
    .unwrap();
    conn.send(&Envelope::ping(77)).await.unwrap();

    // The next reply is the pong: nothing was sent back for the unknown kind.
    let reply = recv(&mut conn).await;
    assert!(matches!(reply.payload, Payload::Pong(pong) if pong.nonce == 77));

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_envelope_keeps_session_open() {
    let (mut server, recorder, _) = start_receiver(receiver_config()).await;
    let mut conn = hello(server.local_addr(), &[1]).await;

    conn.send_encoded(Bytes::from_static(b"{not json"))
        .await
        .unwrap();
    let error = recv_error(&mut conn).await;
    assert_eq!(error.code, ErrorCode::InvalidMessage);

    conn.send(&Envelope::input(sample(1, 1))).await.unwrap();
    wait_until(|| recorder.applied(1) == vec![1]).await;
    assert_eq!(server.live_sessions(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_incompatible_version_closes_session() {
    let (mut server, _, _) = start_receiver(receiver_config()).await;
    let mut conn = Connection::connect(&Endpoint::from(server.local_addr()), Duration::from_secs(1))
        .await
        .unwrap();

    conn.send_encoded(Bytes::from_static(
        br#"{"protocol_version":"2.0","message_id":1,"kind":"hello","payload":{"sender_name":"future","claimed":[1]}}"#,
    ))
    .await
    .unwrap();

    let error = recv_error(&mut conn).await;
    assert_eq!(error.code, ErrorCode::IncompatibleVersion);
    let closed = tokio::time::timeout(Duration::from_secs(5), conn.recv())
        .await
        .expect("timeout");
    assert!(matches!(closed, Err(LinkError::ConnectionClosed)));

    server.stop().await;
}
