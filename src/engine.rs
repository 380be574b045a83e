//! Contract between the orchestration layer and the protocol engine.
//!
//! The engine owns all cryptography; this crate only starts it, forwards its
//! outbound messages, feeds it inbound messages addressed to the local party,
//! and waits for its single terminal event. Payloads and result blobs are
//! opaque here.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::party::{ParticipantSet, PartyId};
use crate::TssResult;

/// Curve the engine computes on; an explicit per-session parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    Secp256k1,
    Ed25519,
}

/// One outbound protocol message, addressed by party id. An empty `to` list
/// with `is_broadcast` set means every other participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficOut {
    pub from: String,
    pub to: Vec<String>,
    pub payload: Vec<u8>,
    pub is_broadcast: bool,
}

/// The engine's two event sources: a lazily produced stream of outbound
/// messages and the single terminal event that ends it.
pub struct EngineChannels {
    pub outgoing: mpsc::UnboundedReceiver<TrafficOut>,
    pub done: oneshot::Receiver<TssResult<Vec<u8>>>,
}

/// Inbound sink of a running engine.
///
/// `submit` must only enqueue: a slow engine stalls its own session toward
/// the deadline, never the admission path. The returned bool is the engine's
/// ack that the message was accepted for the current round.
pub trait EngineHandle: Send + Sync {
    fn submit(&self, payload: &[u8], from: &PartyId, is_broadcast: bool) -> TssResult<bool>;
}

/// Setup material for a keygen engine.
pub struct KeygenSetup {
    pub participants: Arc<ParticipantSet>,
    /// Position of the local party in the canonical ordering.
    pub self_index: usize,
    pub threshold: usize,
    pub curve: Curve,
    /// Opaque pre-generated parameter blob from `prepare_params`.
    pub pre_params: Vec<u8>,
}

/// Setup material for a sign engine.
pub struct SignSetup {
    pub participants: Arc<ParticipantSet>,
    pub self_index: usize,
    pub threshold: usize,
    pub curve: Curve,
    /// Digest or message bytes to sign; opaque to the orchestration.
    pub message: Vec<u8>,
    /// Opaque save-data blob produced by a completed keygen session.
    pub save_data: Vec<u8>,
}

/// Constructs and starts engine instances. Implemented by the embedding host
/// over the actual MPC library.
pub trait EngineFactory: Send + Sync + 'static {
    type Handle: EngineHandle + 'static;

    /// Precompute curve-dependent setup material. Cpu-bound and blocking.
    /// The factory must give up and return an error once `timeout` elapses;
    /// the service enforces the same budget from the outside, but only the
    /// factory can actually stop the computation.
    fn prepare_params(&self, curve: Curve, timeout: Duration) -> TssResult<Vec<u8>>;

    /// Construct and start a keygen engine. A failure here means the setup
    /// was invalid; nothing was started.
    fn keygen(&self, setup: KeygenSetup) -> TssResult<(Self::Handle, EngineChannels)>;

    /// Construct and start a sign engine.
    fn sign(&self, setup: SignSetup) -> TssResult<(Self::Handle, EngineChannels)>;
}
