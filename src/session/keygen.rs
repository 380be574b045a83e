//! Keygen session lifecycle: sanitize the request, admit it, start the
//! engine, and hand the session to the router task.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{error, info, span, warn, Level};

use super::manager::{ActiveSession, SessionKind};
use super::protocol::execute_session;
use super::{sanitize_participants, SessionService};
use crate::engine::{Curve, EngineFactory, KeygenSetup, TrafficOut};
use crate::error::{SessionError, SessionOutcome};

/// Caller-supplied parameters of a keygen session.
#[derive(Debug, Clone)]
pub struct KeygenInit {
    /// Id of the local party; must appear in `participants`.
    pub self_id: String,
    /// JSON array of participant descriptors, in arbitrary order.
    pub participants: String,
    /// Opaque pre-generated parameter blob from `prepare_params`.
    pub pre_params: Vec<u8>,
    pub curve: Curve,
    /// Wall-clock budget for the whole exchange.
    pub timeout: Duration,
}

impl<E: EngineFactory> SessionService<E> {
    pub(super) fn handle_start_keygen(
        &self,
        init: KeygenInit,
        messages: mpsc::UnboundedSender<TrafficOut>,
    ) -> Result<oneshot::Receiver<SessionOutcome>, SessionError> {
        // sanitize before touching the slot; these rejections have no side
        // effects on a session that may already be running
        let (participants, self_index) = sanitize_participants(&init.participants, &init.self_id)
            .map_err(|err| {
                error!("rejecting keygen request: {:#}", err);
                SessionError::InvalidParams
            })?;

        let threshold = participants.threshold();
        let keygen_span = span!(
            Level::INFO,
            "keygen",
            uid = %init.self_id,
            t = threshold,
            n = participants.len(),
        );
        let _enter = keygen_span.enter();

        let permit = self
            .manager
            .try_acquire(SessionKind::Keygen)
            .ok_or_else(|| {
                warn!("rejecting keygen request: a keygen session is already active");
                SessionError::InvalidParams
            })?;

        info!("starting session with participants {:?}", participants.ids());

        let setup = KeygenSetup {
            participants: Arc::clone(&participants),
            self_index,
            threshold,
            curve: init.curve,
            pre_params: init.pre_params,
        };
        // on failure the permit drops here and the slot is released
        let (handle, chans) = self.engines.keygen(setup).map_err(|err| {
            error!("keygen engine construction failed: {:#}", err);
            SessionError::InvalidParams
        })?;

        permit.activate(ActiveSession {
            participants,
            engine: Arc::new(handle),
        });

        let deadline = Instant::now() + init.timeout;
        let (done_tx, done_rx) = oneshot::channel();
        let router_span = keygen_span.clone();
        tokio::spawn(async move {
            // the permit lives in this task: every exit path, panic unwind
            // included, releases the slot before the outcome is delivered
            let outcome = std::panic::AssertUnwindSafe(execute_session(
                chans,
                messages,
                deadline,
                router_span.clone(),
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(parent: &router_span, "keygen router task panicked");
                Err(SessionError::InvalidParams)
            });
            drop(permit);
            let _ = done_tx.send(outcome);
        });

        Ok(done_rx)
    }
}
