// ABOUTME: Integration tests for the sender facade against loopback receivers
// ABOUTME: Data egress, short writes, write failures, weights, OOB and peer teardown

use crossbeam::channel::{self, Receiver};
use ristnet::error::Error;
use ristnet::transport::{LoopbackBackend, Op, WriteRecord};
use ristnet::{PeerHandle, RistReceiver, RistSender, Settings};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTEN: &str = "rist://@127.0.0.1:6000";
const TARGET: &str = "rist://127.0.0.1:6000";
const TIMEOUT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `cond` until it holds or the timeout expires
fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Receiver admitting everyone; data blocks arrive on the returned channel
fn listening_receiver(
    backend: &Arc<LoopbackBackend>,
    url: &str,
) -> (RistReceiver<String>, Receiver<(Vec<u8>, u32)>) {
    let (tx, rx) = channel::unbounded();
    let mut receiver = RistReceiver::new(backend.clone());
    receiver
        .on_validate_connection(|ip, port| Some(Arc::new(format!("{}:{}", ip, port))))
        .on_data(move |payload, _, _, flow_id| {
            let _ = tx.send((payload.to_vec(), flow_id));
            0
        });
    receiver.init(&[url], &Settings::default()).unwrap();
    (receiver, rx)
}

fn accepting_sender(backend: &Arc<LoopbackBackend>) -> RistSender<String> {
    let mut sender = RistSender::new(backend.clone());
    sender.on_validate_connection(|ip, port| Some(Arc::new(format!("{}:{}", ip, port))));
    sender
}

#[test]
fn test_send_data_reaches_receiver() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let (receiver, rx) = listening_receiver(&backend, LISTEN);
    let sender = accepting_sender(&backend);
    sender.init(&[(TARGET, 5)], &Settings::default()).unwrap();

    assert_eq!(receiver.client_count(), 1);
    assert_eq!(sender.client_count(), 1);
    assert!(receiver.active_clients(|peers| peers.values().all(|s| s.starts_with("127.0.0.1:"))));
    assert!(sender.active_clients(|peers| peers.values().all(|s| s.as_str() == "127.0.0.1:6000")));

    let payload = vec![0x47u8; 1316];
    sender.send_data(&payload, 9).unwrap();

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (payload, 9));
    assert_eq!(backend.data_writes(), vec![WriteRecord { len: 1316, flow_id: 9 }]);
}

#[test]
fn test_data_arrives_in_order() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let (_receiver, rx) = listening_receiver(&backend, LISTEN);
    let sender = accepting_sender(&backend);
    sender.init(&[(TARGET, 5)], &Settings::default()).unwrap();

    for i in 0u8..50 {
        sender.send_data(&[i; 188], u32::from(i)).unwrap();
    }
    for i in 0u8..50 {
        let (payload, flow_id) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(payload, vec![i; 188]);
        assert_eq!(flow_id, u32::from(i));
    }
}

#[test]
fn test_send_before_init() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let sender = accepting_sender(&backend);

    assert!(matches!(sender.send_data(b"early", 0), Err(Error::NotInitialized)));
    assert!(matches!(sender.destroy(), Err(Error::NotInitialized)));
    assert_eq!(backend.calls(Op::WriteData), 0);
}

#[test]
fn test_short_write_keeps_sender_running() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let (_receiver, _rx) = listening_receiver(&backend, LISTEN);
    let sender = accepting_sender(&backend);
    sender.init(&[(TARGET, 5)], &Settings::default()).unwrap();

    backend.limit_writes(Some(100));
    let result = sender.send_data(&[0u8; 1316], 0);
    assert!(matches!(
        result,
        Err(Error::ShortWrite {
            written: 100,
            expected: 1316
        })
    ));
    assert!(sender.is_initialized());

    backend.limit_writes(None);
    sender.send_data(&[0u8; 1316], 0).unwrap();
}

#[test]
fn test_write_failure_destroys_sender() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let (receiver, _rx) = listening_receiver(&backend, LISTEN);
    let sender = accepting_sender(&backend);
    sender.init(&[(TARGET, 5)], &Settings::default()).unwrap();

    backend.fail(Op::WriteData);
    let result = sender.send_data(b"doomed", 0);
    assert!(matches!(result, Err(Error::Transport { op: "data_write", .. })));
    assert!(!sender.is_initialized());
    assert_eq!(sender.client_count(), 0);

    assert!(matches!(sender.send_data(b"again", 0), Err(Error::NotInitialized)));

    // the receiver sees the association go away
    assert!(wait_until(|| receiver.client_count() == 0));
    assert_eq!(backend.live_contexts(), 1);
}

#[test]
fn test_weights_are_forwarded_unchanged() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let sender = accepting_sender(&backend);

    sender
        .init(
            &[("rist://10.0.0.1:7000", 0), ("rist://10.0.0.2:7000", 9)],
            &Settings::default(),
        )
        .unwrap();

    let weights: Vec<u32> = backend.peer_configs().iter().map(|c| c.weight).collect();
    assert_eq!(weights, vec![0, 9]);
}

#[test]
fn test_url_overrides_apply_per_peer() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let sender = accepting_sender(&backend);

    sender
        .init(
            &[
                ("rist://10.0.0.1:7000?buffer=200&cname=edge", 5),
                ("rist://10.0.0.2:7000", 5),
            ],
            &Settings::new().cname("studio"),
        )
        .unwrap();

    let configs = backend.peer_configs();
    assert_eq!(configs[0].recovery_length_max, 200);
    assert_eq!(configs[0].cname.to_string_lossy(), "edge");
    assert_eq!(configs[1].recovery_length_max, 1000);
    assert_eq!(configs[1].cname.to_string_lossy(), "studio");
}

#[test]
fn test_sender_without_listener_stays_idle() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let sender = accepting_sender(&backend);

    sender.init(&[(TARGET, 5)], &Settings::default()).unwrap();
    assert!(sender.is_initialized());
    assert_eq!(sender.client_count(), 0);
    sender.send_data(b"into the void", 0).unwrap();
}

#[test]
fn test_default_sender_validate_rejects_receiver() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let (receiver, rx) = listening_receiver(&backend, LISTEN);

    let sender: RistSender<()> = RistSender::new(backend.clone());
    sender.init(&[(TARGET, 5)], &Settings::default()).unwrap();

    assert_eq!(sender.client_count(), 0);
    assert!(wait_until(|| receiver.client_count() == 0));

    sender.send_data(b"unlinked", 0).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_one_sender_feeds_two_receivers() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let (_first, rx_first) = listening_receiver(&backend, "rist://@127.0.0.1:6100");
    let (_second, rx_second) = listening_receiver(&backend, "rist6://@[::1]:6200");
    let sender = accepting_sender(&backend);

    sender
        .init(
            &[("rist://127.0.0.1:6100", 5), ("rist6://[::1]:6200", 5)],
            &Settings::default(),
        )
        .unwrap();
    assert_eq!(sender.client_count(), 2);

    sender.send_data(b"fan-out", 2).unwrap();
    assert_eq!(rx_first.recv_timeout(TIMEOUT).unwrap(), (b"fan-out".to_vec(), 2));
    assert_eq!(rx_second.recv_timeout(TIMEOUT).unwrap(), (b"fan-out".to_vec(), 2));
}

#[test]
fn test_oob_between_sender_and_receiver() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());

    let (to_receiver, at_receiver) = channel::unbounded();
    let mut receiver: RistReceiver<()> = RistReceiver::new(backend.clone());
    receiver
        .on_validate_connection(|_, _| Some(Arc::new(())))
        .on_oob_data(move |payload, _, peer| {
            let _ = to_receiver.send((payload.to_vec(), peer));
        });
    receiver.init(&[LISTEN], &Settings::default()).unwrap();

    let (to_sender, at_sender) = channel::unbounded();
    let mut sender = accepting_sender(&backend);
    sender.on_oob_data(move |payload, state, _| {
        let _ = to_sender.send((payload.to_vec(), state.as_str().to_owned()));
    });
    sender.init(&[(TARGET, 5)], &Settings::default()).unwrap();

    let towards_receiver = sender.active_clients(|peers| *peers.keys().next().unwrap());
    sender.send_oob_data(towards_receiver, b"hello receiver").unwrap();
    let (payload, from_sender) = at_receiver.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(payload, b"hello receiver");

    receiver.send_oob_data(from_sender, b"hello sender").unwrap();
    assert_eq!(
        at_sender.recv_timeout(TIMEOUT).unwrap(),
        (b"hello sender".to_vec(), "127.0.0.1:6000".to_string())
    );
}

#[test]
fn test_oob_to_unknown_peer_destroys_sender() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let sender = accepting_sender(&backend);
    sender.init(&[(TARGET, 5)], &Settings::default()).unwrap();

    let result = sender.send_oob_data(PeerHandle::from_raw(9999), b"?");
    assert!(matches!(result, Err(Error::Transport { op: "oob_write", .. })));
    assert!(!sender.is_initialized());
    assert_eq!(backend.live_contexts(), 0);
}

#[test]
fn test_close_client_connection_disconnects_receiver() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let (receiver, _rx) = listening_receiver(&backend, LISTEN);
    let sender = accepting_sender(&backend);
    sender.init(&[(TARGET, 5)], &Settings::default()).unwrap();

    let peer = sender.active_clients(|peers| *peers.keys().next().unwrap());
    sender.close_client_connection(peer).unwrap();

    assert_eq!(sender.client_count(), 0);
    assert!(wait_until(|| receiver.client_count() == 0));
    assert!(sender.is_initialized());
}

#[test]
fn test_receiver_destroy_disconnects_sender() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let (receiver, _rx) = listening_receiver(&backend, LISTEN);
    let sender = accepting_sender(&backend);
    sender.init(&[(TARGET, 5)], &Settings::default()).unwrap();
    assert_eq!(sender.client_count(), 1);

    receiver.destroy().unwrap();
    assert!(wait_until(|| sender.client_count() == 0));
    sender.send_data(b"nobody listens", 0).unwrap();
}

#[test]
fn test_init_failure_leaves_sender_clean() {
    init_logging();
    let steps = [
        Op::ConfigureLogging,
        Op::CreateContext,
        Op::ParseAddress,
        Op::CreatePeer,
        Op::SetOobHandler,
        Op::SetAuthHandler,
        Op::Start,
    ];

    for step in steps {
        let backend = Arc::new(LoopbackBackend::new());
        let sender = accepting_sender(&backend);

        backend.fail(step);
        assert!(sender.init(&[(TARGET, 5)], &Settings::default()).is_err());
        assert!(!sender.is_initialized(), "{:?} left the sender initialised", step);
        assert_eq!(backend.live_contexts(), 0, "{:?} leaked a context", step);
    }

    // senders never install a data handler
    let backend = Arc::new(LoopbackBackend::new());
    let sender = accepting_sender(&backend);
    backend.fail(Op::SetDataHandler);
    sender.init(&[(TARGET, 5)], &Settings::default()).unwrap();
    assert_eq!(backend.calls(Op::SetDataHandler), 0);
}

#[test]
fn test_drop_destroys_sender_context() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let (receiver, _rx) = listening_receiver(&backend, LISTEN);
    {
        let sender = accepting_sender(&backend);
        sender.init(&[(TARGET, 5)], &Settings::default()).unwrap();
        assert_eq!(backend.live_contexts(), 2);
    }
    assert_eq!(backend.live_contexts(), 1);
    assert!(wait_until(|| receiver.client_count() == 0));
}

#[test]
fn test_receiver_on_wildcard_address() {
    init_logging();
    let backend = Arc::new(LoopbackBackend::new());
    let (receiver, rx) = listening_receiver(&backend, "rist://@0.0.0.0:6300");
    let sender = accepting_sender(&backend);
    sender
        .init(&[("rist://127.0.0.1:6300", 5)], &Settings::default())
        .unwrap();

    assert_eq!(receiver.client_count(), 1);
    assert_eq!(sender.client_count(), 1);
    sender.send_data(b"any address", 4).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (b"any address".to_vec(), 4));
}
