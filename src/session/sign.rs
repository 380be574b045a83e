//! Sign session lifecycle. Same shape as keygen; differs in the engine
//! construction parameters and in the terminal payload being a signature
//! blob instead of save-data.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{error, info, span, warn, Level};

use super::manager::{ActiveSession, SessionKind};
use super::protocol::execute_session;
use super::{sanitize_participants, SessionService};
use crate::engine::{Curve, EngineFactory, SignSetup, TrafficOut};
use crate::error::{SessionError, SessionOutcome};

/// Caller-supplied parameters of a sign session.
#[derive(Debug, Clone)]
pub struct SignInit {
    /// Id of the local party; must appear in `participants`.
    pub self_id: String,
    /// JSON array of participant descriptors, in arbitrary order.
    pub participants: String,
    /// Digest or message bytes to sign; opaque to the orchestration.
    pub message: Vec<u8>,
    /// Opaque save-data blob produced by a completed keygen session.
    pub save_data: Vec<u8>,
    pub curve: Curve,
    /// Wall-clock budget for the whole exchange.
    pub timeout: Duration,
}

impl<E: EngineFactory> SessionService<E> {
    pub(super) fn handle_start_sign(
        &self,
        init: SignInit,
        messages: mpsc::UnboundedSender<TrafficOut>,
    ) -> Result<oneshot::Receiver<SessionOutcome>, SessionError> {
        let (participants, self_index) = sanitize_participants(&init.participants, &init.self_id)
            .map_err(|err| {
                error!("rejecting sign request: {:#}", err);
                SessionError::InvalidParams
            })?;

        let threshold = participants.threshold();
        let sign_span = span!(
            Level::INFO,
            "sign",
            uid = %init.self_id,
            t = threshold,
            n = participants.len(),
        );
        let _enter = sign_span.enter();

        let permit = self.manager.try_acquire(SessionKind::Sign).ok_or_else(|| {
            warn!("rejecting sign request: a sign session is already active");
            SessionError::InvalidParams
        })?;

        info!("starting session with participants {:?}", participants.ids());

        let setup = SignSetup {
            participants: Arc::clone(&participants),
            self_index,
            threshold,
            curve: init.curve,
            message: init.message,
            save_data: init.save_data,
        };
        let (handle, chans) = self.engines.sign(setup).map_err(|err| {
            error!("sign engine construction failed: {:#}", err);
            SessionError::InvalidParams
        })?;

        permit.activate(ActiveSession {
            participants,
            engine: Arc::new(handle),
        });

        let deadline = Instant::now() + init.timeout;
        let (done_tx, done_rx) = oneshot::channel();
        let router_span = sign_span.clone();
        tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(execute_session(
                chans,
                messages,
                deadline,
                router_span.clone(),
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(parent: &router_span, "sign router task panicked");
                Err(SessionError::InvalidParams)
            });
            drop(permit);
            let _ = done_tx.send(outcome);
        });

        Ok(done_rx)
    }
}
