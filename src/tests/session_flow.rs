//! End-to-end session establishment scenarios over the mock transport and
//! the in-memory signaling store.

use std::sync::Arc;
use std::time::Duration;

use crate::capability::{CapabilityRegistry, RenegotiationHandle};
use crate::config::{Config, GatheringTimeoutPolicy};
use crate::session::{SessionCoordinator, SessionError, SessionState};
use crate::signaling::{SignalSlot, SignalingStore, memory::InMemorySignalingStore, slot_path};
use crate::transport::{DescriptorKind, PeerTransport, SessionDescriptor, SessionRole};
use crate::transport::mock::{MockPeerTransport, MockTransportFactory};

use super::support::{test_config, wait_for_session_state};

struct Peer {
    coordinator: Arc<SessionCoordinator>,
    reneg_rx: tokio::sync::mpsc::UnboundedReceiver<()>,
}

fn make_peer(
    session_id: &str,
    role: SessionRole,
    config: Config,
    store: Arc<InMemorySignalingStore>,
    transports: Vec<Arc<MockPeerTransport>>,
) -> Peer {
    let factory = MockTransportFactory::new();
    for transport in transports {
        factory.push(transport);
    }
    let (handle, reneg_rx) = RenegotiationHandle::new();
    let registry = Arc::new(CapabilityRegistry::new(handle));
    let coordinator = SessionCoordinator::new(
        session_id,
        role,
        config,
        store as Arc<dyn SignalingStore>,
        Arc::new(factory),
        registry,
    );
    Peer {
        coordinator,
        reneg_rx,
    }
}

async fn connect_both(parent: Peer, child: Peer) -> (Arc<SessionCoordinator>, Arc<SessionCoordinator>) {
    let parent_coord = parent.coordinator.clone();
    let child_coord = child.coordinator.clone();
    let parent_task = tokio::spawn(async move { parent.coordinator.connect(parent.reneg_rx).await });
    let child_task = tokio::spawn(async move { child.coordinator.connect(child.reneg_rx).await });
    tokio::time::timeout(Duration::from_secs(2), parent_task)
        .await
        .expect("parent connect timed out")
        .expect("parent task panicked")
        .expect("parent connect failed");
    tokio::time::timeout(Duration::from_secs(2), child_task)
        .await
        .expect("child connect timed out")
        .expect("child task panicked")
        .expect("child connect failed");
    (parent_coord, child_coord)
}

#[tokio::test]
async fn full_handshake_connects_both_roles() {
    let (a, b) = MockPeerTransport::pair_ready();
    let store = Arc::new(InMemorySignalingStore::new());
    let session = SessionCoordinator::generate_session_id();
    let parent = make_peer(&session, SessionRole::Offerer, test_config(), store.clone(), vec![a]);
    let child = make_peer(&session, SessionRole::Answerer, test_config(), store.clone(), vec![b]);

    let (parent, child) = connect_both(parent, child).await;

    assert_eq!(*parent.state().borrow(), SessionState::Connected);
    assert_eq!(*child.state().borrow(), SessionState::Connected);
    assert!(store.read(&slot_path(&session, SignalSlot::Offer)).is_some());
    assert!(store.read(&slot_path(&session, SignalSlot::Answer)).is_some());
    assert!(parent.multiplexer().await.is_some());

    parent.shutdown().await;
    child.shutdown().await;
    assert_eq!(*parent.state().borrow(), SessionState::Closed);
    assert!(store.read(&slot_path(&session, SignalSlot::Offer)).is_none());
    assert!(store.read(&slot_path(&session, SignalSlot::Answer)).is_none());
}

#[tokio::test]
async fn offer_is_published_only_after_gathering_completes() {
    let (a, b) = MockPeerTransport::pair();
    let store = Arc::new(InMemorySignalingStore::new());
    let parent = make_peer("s-gather", SessionRole::Offerer, test_config(), store.clone(), vec![a.clone()]);
    let child = make_peer("s-gather", SessionRole::Answerer, test_config(), store.clone(), vec![b.clone()]);

    let parent_coord = parent.coordinator.clone();
    let mut states = parent_coord.state();
    let parent_task = tokio::spawn(async move { parent.coordinator.connect(parent.reneg_rx).await });
    let child_task = tokio::spawn(async move { child.coordinator.connect(child.reneg_rx).await });

    wait_for_session_state(&mut states, SessionState::GatheringCandidates).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        store.read(&slot_path("s-gather", SignalSlot::Offer)).is_none(),
        "offer must not be published while gathering is pending"
    );

    a.complete_gathering();
    b.complete_gathering();

    parent_task.await.unwrap().expect("parent connect failed");
    child_task.await.unwrap().expect("child connect failed");
    assert!(store.read(&slot_path("s-gather", SignalSlot::Offer)).is_some());
}

#[tokio::test]
async fn shutdown_cancels_an_inflight_connect() {
    let (a, _b) = MockPeerTransport::pair();
    let store = Arc::new(InMemorySignalingStore::new());
    let session = SessionCoordinator::generate_session_id();
    store
        .write(
            &slot_path(&session, SignalSlot::Offer),
            serde_json::to_value(SessionDescriptor {
                kind: DescriptorKind::Offer,
                sdp: "v=0".to_string(),
            })
            .expect("descriptor json"),
        )
        .await
        .expect("seed offer");

    let child = make_peer(&session, SessionRole::Answerer, test_config(), store.clone(), vec![a]);
    let coordinator = child.coordinator.clone();
    let handle = coordinator.spawn_connect(child.reneg_rx);

    // Let the handshake reach candidate gathering, which never completes
    // on this transport.
    tokio::time::sleep(Duration::from_millis(100)).await;
    coordinator.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("connect should resolve promptly after shutdown")
        .expect("connect task panicked");
    assert!(matches!(result, Err(SessionError::Closed)));
    // The terminal state stays Closed, even for an observer that
    // subscribes only now.
    assert_eq!(*coordinator.state().borrow(), SessionState::Closed);
}

#[tokio::test]
async fn gathering_timeout_fails_session_under_strict_policy() {
    let (a, _b) = MockPeerTransport::pair();
    let store = Arc::new(InMemorySignalingStore::new());
    let config = Config {
        gathering_timeout: Duration::from_millis(50),
        gathering_timeout_policy: GatheringTimeoutPolicy::FailSession,
        ..test_config()
    };
    let parent = make_peer("s-strict", SessionRole::Offerer, config, store.clone(), vec![a]);

    let err = parent
        .coordinator
        .connect(parent.reneg_rx)
        .await
        .expect_err("connect should fail");
    assert!(matches!(err, SessionError::GatheringTimeout));
    assert_eq!(*parent.coordinator.state().borrow(), SessionState::Failed);
    assert!(store.read(&slot_path("s-strict", SignalSlot::Offer)).is_none());
}

#[tokio::test]
async fn gathering_timeout_publishes_partial_by_default() {
    let (a, b) = MockPeerTransport::pair();
    let store = Arc::new(InMemorySignalingStore::new());
    let config = Config {
        gathering_timeout: Duration::from_millis(50),
        gathering_timeout_policy: GatheringTimeoutPolicy::PublishPartial,
        ..test_config()
    };
    let parent = make_peer("s-partial", SessionRole::Offerer, config.clone(), store.clone(), vec![a]);
    let child = make_peer("s-partial", SessionRole::Answerer, config, store.clone(), vec![b]);

    connect_both(parent, child).await;
    assert!(store.read(&slot_path("s-partial", SignalSlot::Offer)).is_some());
}

#[tokio::test]
async fn renegotiation_requests_coalesce_into_one_followup() {
    let (a, b) = MockPeerTransport::pair_ready();
    let store = Arc::new(InMemorySignalingStore::new());
    let parent = make_peer("s-reneg", SessionRole::Offerer, test_config(), store.clone(), vec![a.clone()]);
    let child = make_peer("s-reneg", SessionRole::Answerer, test_config(), store.clone(), vec![b]);
    let (parent, _child) = connect_both(parent, child).await;

    // Watch the offer slot: the initial offer is already there, so the
    // subscription starts with one delivery.
    let mut offers = store
        .subscribe(&slot_path("s-reneg", SignalSlot::Offer))
        .await
        .unwrap();
    assert!(offers.try_recv().is_ok());

    // Keep each cycle in flight long enough for the later requests to land
    // while the first is running.
    a.set_negotiation_delay(Duration::from_millis(150));

    let first = {
        let parent = parent.clone();
        tokio::spawn(async move { parent.request_renegotiation().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    parent.request_renegotiation().await;
    parent.request_renegotiation().await;
    first.await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut republished = 0;
    while offers.try_recv().is_ok() {
        republished += 1;
    }
    assert_eq!(
        republished, 2,
        "three requests must collapse into the in-flight cycle plus one follow-up"
    );
    assert_eq!(*parent.state().borrow(), SessionState::Connected);
}

#[tokio::test]
async fn transient_flap_does_not_trigger_restart() {
    let (a, b) = MockPeerTransport::pair_ready();
    let store = Arc::new(InMemorySignalingStore::new());
    // No spare transports queued: an unwarranted restart would fail and
    // close the session.
    let parent = make_peer("s-flap", SessionRole::Offerer, test_config(), store.clone(), vec![a.clone()]);
    let child = make_peer("s-flap", SessionRole::Answerer, test_config(), store.clone(), vec![b]);
    let (parent, child) = connect_both(parent, child).await;

    a.flap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    a.recover();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(*parent.state().borrow(), SessionState::Connected);
    assert_eq!(*child.state().borrow(), SessionState::Connected);
}

#[tokio::test]
async fn sustained_failure_restarts_once() {
    let (a1, b1) = MockPeerTransport::pair_ready();
    let (a2, b2) = MockPeerTransport::pair_ready();
    let store = Arc::new(InMemorySignalingStore::new());
    let parent = make_peer(
        "s-restart",
        SessionRole::Offerer,
        test_config(),
        store.clone(),
        vec![a1.clone(), a2.clone()],
    );
    let child = make_peer(
        "s-restart",
        SessionRole::Answerer,
        test_config(),
        store.clone(),
        vec![b1, b2],
    );
    let (parent, child) = connect_both(parent, child).await;

    let first_mux = parent.multiplexer().await.expect("first multiplexer");
    let mut parent_states = parent.state();

    a1.fail();

    // Both peers debounce, tear down the first generation and reconnect
    // over the second transport pair.
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Some(current) = parent.multiplexer().await {
                if !Arc::ptr_eq(&current, &first_mux) {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        parent_states
            .wait_for(|s| *s == SessionState::Connected)
            .await
            .unwrap();
    })
    .await
    .expect("peers did not reconnect after sustained failure");
    assert!(a2.channel_open(), "second transport generation must carry the channel");
    let mut child_states = child.state();
    tokio::time::timeout(Duration::from_secs(2), child_states.wait_for(|s| *s == SessionState::Connected))
        .await
        .expect("child did not reconnect")
        .unwrap();

    // The restart budget is spent: a second sustained failure closes the
    // session instead of reconnecting again.
    a2.fail();
    tokio::time::timeout(Duration::from_secs(3), async {
        parent_states
            .wait_for(|s| *s == SessionState::Closed)
            .await
            .unwrap();
    })
    .await
    .expect("session should close after exhausting the restart budget");
}
