//! End-to-end tests: several in-process services wired together by a relay
//! that plays the role of the remote transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::fmt::MakeWriter;

use crate::engine::{Curve, TrafficOut};
use crate::error::SessionError;
use crate::session::{KeygenInit, SessionKind, SessionService, SignInit};

use mock::MockEngineFactory;

const IDS: [&str; 3] = ["alice", "bob", "carol"];

// sort keys put bob first: canonical order is [bob, alice, carol]
fn participants_json() -> String {
    r#"[
        {"id": "alice", "moniker": "Alice", "uniqueKey": "10"},
        {"id": "bob", "moniker": "Bob", "uniqueKey": "5"},
        {"id": "carol", "moniker": "Carol", "uniqueKey": "20"}
    ]"#
    .to_owned()
}

fn keygen_init(self_id: &str, timeout: Duration) -> KeygenInit {
    KeygenInit {
        self_id: self_id.to_owned(),
        participants: participants_json(),
        pre_params: b"preparams".to_vec(),
        curve: Curve::Secp256k1,
        timeout,
    }
}

fn sign_init(self_id: &str, timeout: Duration) -> SignInit {
    SignInit {
        self_id: self_id.to_owned(),
        participants: participants_json(),
        message: b"hello".to_vec(),
        save_data: b"save-data".to_vec(),
        curve: Curve::Secp256k1,
        timeout,
    }
}

/// Deliver each party's outbound traffic to its peers: broadcasts go to
/// everyone but the sender, p2p messages only to the addressees.
fn spawn_relay(
    mut outgoing: mpsc::UnboundedReceiver<TrafficOut>,
    peers: Vec<(String, SessionService<MockEngineFactory>)>,
    kind: SessionKind,
) {
    tokio::spawn(async move {
        while let Some(msg) = outgoing.recv().await {
            for (peer_id, peer) in &peers {
                if *peer_id == msg.from {
                    continue;
                }
                if !msg.is_broadcast && !msg.to.contains(peer_id) {
                    continue;
                }
                // late messages for an already finished session are dropped
                let _ = match kind {
                    SessionKind::Keygen => peer
                        .update_keygen(&msg.payload, &msg.from, msg.is_broadcast)
                        .map(|_| true),
                    SessionKind::Sign => peer.update_sign(&msg.payload, &msg.from, msg.is_broadcast),
                };
            }
        }
    });
}

fn new_network() -> Vec<(String, SessionService<MockEngineFactory>)> {
    IDS.iter()
        .map(|id| {
            (
                (*id).to_owned(),
                SessionService::new(MockEngineFactory::echo()),
            )
        })
        .collect()
}

#[tokio::test]
async fn keygen_completes_for_all_parties() {
    let services = new_network();

    // admit every party before any relay starts delivering; early traffic
    // buffers in the unbounded channels meanwhile
    let mut outcomes = Vec::new();
    let mut relays = Vec::new();
    for (id, service) in &services {
        let (tx, rx) = mpsc::unbounded_channel();
        let done = service
            .start_keygen(keygen_init(id, Duration::from_secs(10)), tx)
            .unwrap();
        relays.push(rx);
        outcomes.push(done);
    }
    for rx in relays {
        spawn_relay(rx, services.clone(), SessionKind::Keygen);
    }

    let mut blobs = Vec::new();
    for done in outcomes {
        blobs.push(done.await.unwrap().unwrap());
    }

    // every party must agree on the canonical ordering baked into the blob
    let ids: Vec<String> = serde_json::from_slice(&blobs[0]).unwrap();
    assert_eq!(ids, vec!["bob", "alice", "carol"]);
    assert!(blobs.iter().all(|b| *b == blobs[0]));

    // all sessions are released again
    for (_, service) in &services {
        assert!(!service.manager().is_active(SessionKind::Keygen));
    }
}

#[tokio::test]
async fn sign_completes_for_all_parties() {
    let services = new_network();

    let mut outcomes = Vec::new();
    let mut relays = Vec::new();
    for (id, service) in &services {
        let (tx, rx) = mpsc::unbounded_channel();
        let done = service
            .start_sign(sign_init(id, Duration::from_secs(10)), tx)
            .unwrap();
        relays.push(rx);
        outcomes.push(done);
    }
    for rx in relays {
        spawn_relay(rx, services.clone(), SessionKind::Sign);
    }

    for done in outcomes {
        let blob = done.await.unwrap().unwrap();
        assert_eq!(blob, b"signed:hello");
    }
}

#[tokio::test]
async fn second_keygen_start_is_rejected_while_running() {
    let service = SessionService::new(MockEngineFactory::stall());

    let (tx, _rx) = mpsc::unbounded_channel();
    let _done = service
        .start_keygen(keygen_init("alice", Duration::from_secs(10)), tx)
        .unwrap();

    let (tx2, _rx2) = mpsc::unbounded_channel();
    let err = service
        .start_keygen(keygen_init("alice", Duration::from_secs(10)), tx2)
        .unwrap_err();
    assert_eq!(err, SessionError::InvalidParams);

    // the running session is untouched by the rejected request
    assert!(service.update_keygen(b"payload", "bob", true).is_ok());
}

#[tokio::test]
async fn keygen_and_sign_slots_are_independent() {
    let service = SessionService::new(MockEngineFactory::stall());

    let (tx, _rx) = mpsc::unbounded_channel();
    service
        .start_keygen(keygen_init("alice", Duration::from_secs(10)), tx)
        .unwrap();

    let (tx2, _rx2) = mpsc::unbounded_channel();
    service
        .start_sign(sign_init("alice", Duration::from_secs(10)), tx2)
        .unwrap();

    assert!(service.manager().is_active(SessionKind::Keygen));
    assert!(service.manager().is_active(SessionKind::Sign));
}

#[tokio::test(start_paused = true)]
async fn timeout_releases_the_session() {
    let service = SessionService::new(MockEngineFactory::stall());

    let (tx, _rx) = mpsc::unbounded_channel();
    let done = service
        .start_keygen(keygen_init("alice", Duration::from_secs(1)), tx)
        .unwrap();

    let outcome = done.await.unwrap();
    assert_eq!(outcome, Err(SessionError::TimeoutExceeded));

    // the slot is released: a new keygen session is admitted immediately
    let (tx2, _rx2) = mpsc::unbounded_channel();
    assert!(service
        .start_keygen(keygen_init("alice", Duration::from_secs(1)), tx2)
        .is_ok());
}

#[tokio::test]
async fn update_from_unknown_sender_is_rejected() {
    let factory = MockEngineFactory::stall();
    let submissions = factory.submissions();
    let service = SessionService::new(factory);

    let (tx, _rx) = mpsc::unbounded_channel();
    service
        .start_keygen(keygen_init("alice", Duration::from_secs(10)), tx)
        .unwrap();

    let err = service
        .update_keygen(b"payload", "mallory", true)
        .unwrap_err();
    assert_eq!(err, SessionError::InvalidParams);
    // the bad message never reached the engine
    assert!(submissions.lock().unwrap().is_empty());

    service.update_keygen(b"payload", "bob", true).unwrap();
    assert_eq!(*submissions.lock().unwrap(), vec!["bob".to_owned()]);
}

#[tokio::test]
async fn update_without_active_session_is_rejected() {
    let service = SessionService::new(MockEngineFactory::echo());

    let err = service.update_keygen(b"payload", "bob", true).unwrap_err();
    assert_eq!(err, SessionError::InvalidParams);
    let err = service.update_sign(b"payload", "bob", true).unwrap_err();
    assert_eq!(err, SessionError::InvalidParams);
}

#[tokio::test]
async fn malformed_start_leaves_running_session_alone() {
    let service = SessionService::new(MockEngineFactory::stall());

    let (tx, _rx) = mpsc::unbounded_channel();
    service
        .start_keygen(keygen_init("alice", Duration::from_secs(10)), tx)
        .unwrap();

    let mut broken = keygen_init("alice", Duration::from_secs(10));
    broken.participants = "not json".to_owned();
    let (tx2, _rx2) = mpsc::unbounded_channel();
    let err = service.start_keygen(broken, tx2).unwrap_err();
    assert_eq!(err, SessionError::InvalidParams);

    // the first session is still live and accepting updates
    assert!(service.update_keygen(b"payload", "carol", true).is_ok());
}

#[tokio::test]
async fn sign_rejects_missing_save_data() {
    let service = SessionService::new(MockEngineFactory::echo());

    let mut init = sign_init("alice", Duration::from_secs(10));
    init.save_data = Vec::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = service.start_sign(init, tx).unwrap_err();
    assert_eq!(err, SessionError::InvalidParams);

    // the failed engine construction released the slot
    assert!(!service.manager().is_active(SessionKind::Sign));
}

#[tokio::test]
async fn prepare_params_round_trips() {
    let service = SessionService::new(MockEngineFactory::echo());

    let blob = service
        .prepare_params(Curve::Ed25519, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(blob, b"preparams for Ed25519");
}

#[tokio::test]
async fn prepare_params_hands_the_budget_to_the_factory() {
    let factory = MockEngineFactory::echo();
    let budgets = factory.prepare_budgets();
    let service = SessionService::new(factory);

    service
        .prepare_params(Curve::Secp256k1, Duration::from_secs(7))
        .await
        .unwrap();
    assert_eq!(*budgets.lock().unwrap(), vec![Duration::from_secs(7)]);
}

// the factory here overruns its budget, so the service's own enforcement
// has to produce the timeout
#[tokio::test]
async fn prepare_params_respects_its_deadline() {
    let service = SessionService::new(MockEngineFactory::with_slow_prepare());

    let err = service
        .prepare_params(Curve::Secp256k1, Duration::from_millis(5))
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::TimeoutExceeded);
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::test]
async fn session_span_carries_the_key_facts() {
    let logs = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let service = SessionService::new(MockEngineFactory::stall());
    let (tx, _rx) = mpsc::unbounded_channel();
    service
        .start_keygen(keygen_init("alice", Duration::from_secs(10)), tx)
        .unwrap();

    let output = logs.contents();
    assert!(output.contains("keygen"));
    assert!(output.contains("uid=alice"));
    assert!(output.contains("t=1"));
    assert!(output.contains("n=3"));
}
