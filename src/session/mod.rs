//! Session orchestration: admission, message routing, inbound updates.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tracing::{error, warn};

mod keygen;
mod manager;
mod protocol;
mod sign;

pub use keygen::KeygenInit;
pub use manager::{SessionKind, SessionManager};
pub use sign::SignInit;

use crate::engine::{Curve, EngineFactory, TrafficOut};
use crate::error::{SessionError, SessionOutcome};
use crate::party::{ParticipantSet, PartyDescriptor};
use crate::TssResult;

/// Entry point of the crate. Holds the engine factory and the two session
/// slots; cheap to clone into the transport glue.
pub struct SessionService<E> {
    engines: Arc<E>,
    manager: Arc<SessionManager>,
}

impl<E> Clone for SessionService<E> {
    fn clone(&self) -> Self {
        Self {
            engines: Arc::clone(&self.engines),
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<E: EngineFactory> SessionService<E> {
    pub fn new(engines: E) -> Self {
        Self {
            engines: Arc::new(engines),
            manager: Arc::new(SessionManager::new()),
        }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// One-shot precomputation of curve-dependent setup material. Touches no
    /// session state and may run while sessions are active. The budget is
    /// handed to the factory so it can stop its own work; it is enforced
    /// here as well in case the factory overruns.
    pub async fn prepare_params(
        &self,
        curve: Curve,
        timeout: Duration,
    ) -> Result<Vec<u8>, SessionError> {
        let engines = Arc::clone(&self.engines);
        let work = task::spawn_blocking(move || engines.prepare_params(curve, timeout));

        match tokio::time::timeout(timeout, work).await {
            Err(_) => {
                warn!("prepare_params exceeded its {:?} budget", timeout);
                Err(SessionError::TimeoutExceeded)
            }
            Ok(Err(join_err)) => {
                error!("prepare_params task failed: {}", join_err);
                Err(SessionError::InvalidParams)
            }
            Ok(Ok(Err(err))) => {
                error!("prepare_params failed: {:#}", err);
                Err(SessionError::InvalidParams)
            }
            Ok(Ok(Ok(blob))) => Ok(blob),
        }
    }

    /// Start the local side of a keygen session.
    ///
    /// Outbound protocol messages are pushed into `messages` for the caller's
    /// transport to deliver; the returned receiver resolves exactly once with
    /// the session outcome. A synchronous error means nothing was started:
    /// malformed input or a keygen session already active.
    pub fn start_keygen(
        &self,
        init: KeygenInit,
        messages: mpsc::UnboundedSender<TrafficOut>,
    ) -> Result<oneshot::Receiver<SessionOutcome>, SessionError> {
        self.handle_start_keygen(init, messages)
    }

    /// Feed one transport-delivered message into the active keygen session.
    pub fn update_keygen(
        &self,
        payload: &[u8],
        from_id: &str,
        is_broadcast: bool,
    ) -> Result<(), SessionError> {
        self.submit(SessionKind::Keygen, payload, from_id, is_broadcast)
            .map(|_| ())
    }

    /// Start the local side of a sign session. Same contract shape as
    /// [`Self::start_keygen`].
    pub fn start_sign(
        &self,
        init: SignInit,
        messages: mpsc::UnboundedSender<TrafficOut>,
    ) -> Result<oneshot::Receiver<SessionOutcome>, SessionError> {
        self.handle_start_sign(init, messages)
    }

    /// Feed one transport-delivered message into the active sign session.
    /// Returns the engine's ack.
    pub fn update_sign(
        &self,
        payload: &[u8],
        from_id: &str,
        is_broadcast: bool,
    ) -> Result<bool, SessionError> {
        self.submit(SessionKind::Sign, payload, from_id, is_broadcast)
    }

    // Shared inbound-update entry point. Serialized against admission and
    // teardown through the per-kind slot mutex.
    fn submit(
        &self,
        kind: SessionKind,
        payload: &[u8],
        from_id: &str,
        is_broadcast: bool,
    ) -> Result<bool, SessionError> {
        self.manager
            .with_active(kind, |session| {
                let index = match session.participants.position(from_id) {
                    Some(index) => index,
                    None => {
                        warn!(
                            "ignore inbound {} msg: unknown sender [{}]",
                            kind.as_str(),
                            from_id
                        );
                        return Err(SessionError::InvalidParams);
                    }
                };
                // the set produced the index, so the lookup cannot miss
                let from = session
                    .participants
                    .get(index)
                    .ok_or(SessionError::InvalidParams)?;

                // an engine fault on one message is not fatal: the round
                // either recovers or the session runs into its deadline
                match session.engine.submit(payload, from, is_broadcast) {
                    Ok(ack) => Ok(ack),
                    Err(err) => {
                        warn!(
                            "{} engine rejected message from [{}]: {:#}",
                            kind.as_str(),
                            from_id,
                            err
                        );
                        Ok(false)
                    }
                }
            })
            .unwrap_or_else(|| {
                warn!("ignore inbound msg: no active {} session", kind.as_str());
                Err(SessionError::InvalidParams)
            })
    }
}

// shared by both lifecycles so every party computes the identical ordering
fn sanitize_participants(
    participants_json: &str,
    self_id: &str,
) -> TssResult<(Arc<ParticipantSet>, usize)> {
    let descriptors: Vec<PartyDescriptor> = serde_json::from_str(participants_json)
        .context("participant descriptors are not valid JSON")?;
    let participants = ParticipantSet::from_descriptors(descriptors)?;
    let self_index = participants
        .position(self_id)
        .ok_or_else(|| anyhow!("own id [{}] not found among participants", self_id))?;
    Ok((Arc::new(participants), self_index))
}
