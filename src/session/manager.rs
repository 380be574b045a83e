//! Per-kind session slots.
//!
//! At most one keygen session and, independently, one sign session may be
//! active locally at any time. A slot is occupied from admission until the
//! owning `SessionPermit` drops, which covers every exit path of the router
//! task, panic unwind included.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::engine::EngineHandle;
use crate::party::ParticipantSet;

/// The two session kinds; their slots are independent of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Keygen,
    Sign,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Keygen => "keygen",
            SessionKind::Sign => "sign",
        }
    }
}

/// Shared state of an admitted session, visible to the inbound-update entry
/// point while the router task runs.
pub(crate) struct ActiveSession {
    pub(crate) participants: Arc<ParticipantSet>,
    pub(crate) engine: Arc<dyn EngineHandle>,
}

enum Slot {
    Idle,
    /// Admitted; engine construction still in flight, updates not yet valid.
    Reserved,
    Active(ActiveSession),
}

/// One mutexed slot per session kind. The same mutex serializes admission,
/// the inbound-update entry point, and teardown, so a new session can never
/// be admitted while a stale one is still finalizing.
pub struct SessionManager {
    keygen: Mutex<Slot>,
    sign: Mutex<Slot>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            keygen: Mutex::new(Slot::Idle),
            sign: Mutex::new(Slot::Idle),
        }
    }

    // recover from poisoning: the slot state is a plain enum and stays
    // consistent even if a holder panicked mid-swap
    fn lock(&self, kind: SessionKind) -> MutexGuard<'_, Slot> {
        let slot = match kind {
            SessionKind::Keygen => &self.keygen,
            SessionKind::Sign => &self.sign,
        };
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to occupy the slot for `kind`. Returns `None` if a session of
    /// that kind is already admitted; the caller must then reject the
    /// request without side effects.
    pub(crate) fn try_acquire(self: &Arc<Self>, kind: SessionKind) -> Option<SessionPermit> {
        let mut slot = self.lock(kind);
        match *slot {
            Slot::Idle => {
                *slot = Slot::Reserved;
                Some(SessionPermit {
                    manager: Arc::clone(self),
                    kind,
                })
            }
            _ => None,
        }
    }

    /// Whether a session of `kind` is currently admitted.
    pub fn is_active(&self, kind: SessionKind) -> bool {
        !matches!(*self.lock(kind), Slot::Idle)
    }

    /// Run `f` against the active session of `kind`, if any. The slot stays
    /// locked for the duration of `f`.
    pub(crate) fn with_active<R>(
        &self,
        kind: SessionKind,
        f: impl FnOnce(&ActiveSession) -> R,
    ) -> Option<R> {
        match &*self.lock(kind) {
            Slot::Active(session) => Some(f(session)),
            _ => None,
        }
    }

    fn activate(&self, kind: SessionKind, session: ActiveSession) {
        let mut slot = self.lock(kind);
        if matches!(*slot, Slot::Active(_)) {
            // only the permit holder activates; seeing this means a logic bug
            warn!("replacing an already active {} session", kind.as_str());
        }
        *slot = Slot::Active(session);
    }

    /// Idempotent: clearing an idle slot is a no-op.
    pub(crate) fn release(&self, kind: SessionKind) {
        *self.lock(kind) = Slot::Idle;
    }
}

/// Exclusive ownership of a session slot. Dropping the permit releases the
/// slot, whatever path the session took to get there.
pub(crate) struct SessionPermit {
    manager: Arc<SessionManager>,
    kind: SessionKind,
}

impl SessionPermit {
    /// Publish the participant set and engine handle for the inbound-update
    /// entry point.
    pub(crate) fn activate(&self, session: ActiveSession) {
        self.manager.activate(self.kind, session);
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.manager.release(self.kind);
    }
}
