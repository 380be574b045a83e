//! The per-session router task.
//!
//! Multiplexes the three event sources of a running session: engine output,
//! the engine's terminal result, and the wall-clock deadline. This is the
//! only place a running session blocks.

use tokio::sync::mpsc;
use tokio::sync::oneshot::error::RecvError;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, span, warn, Level, Span};

use crate::engine::{EngineChannels, TrafficOut};
use crate::error::SessionError;
use crate::TssResult;

/// Pump engine output to the transport channel until the engine reports its
/// terminal result or the deadline fires.
///
/// The deadline arm is polled first: on expiry, buffered-but-unforwarded
/// output is discarded. Outbound messages are forwarded in emission order,
/// no batching, no reordering.
pub(super) async fn execute_session(
    mut chans: EngineChannels,
    messages: mpsc::UnboundedSender<TrafficOut>,
    deadline: Instant,
    span: Span,
) -> Result<Vec<u8>, SessionError> {
    let timeout = sleep_until(deadline);
    tokio::pin!(timeout);

    // arm order matters: the deadline beats everything, and buffered
    // outbound traffic drains before the terminal result is honored so the
    // final round's messages still reach the peers. Draining first cannot
    // starve `done`: the engine closes its outgoing stream before emitting
    // the terminal event, and an endless stream still hits the deadline arm
    let mut forwarded = 0_usize;
    loop {
        tokio::select! {
            biased;
            () = &mut timeout => {
                warn!(
                    parent: &span,
                    "deadline elapsed after forwarding {} messages", forwarded
                );
                return Err(SessionError::TimeoutExceeded);
            }
            out = chans.outgoing.recv() => match out {
                Some(msg) => {
                    forward(&messages, msg, forwarded, &span);
                    forwarded += 1;
                }
                // engine closed its outgoing stream; only the terminal
                // result or the deadline can end the session now
                None => break,
            },
            result = &mut chans.done => {
                return finish(result, &span);
            }
        }
    }

    tokio::select! {
        biased;
        () = &mut timeout => {
            warn!(parent: &span, "deadline elapsed while waiting for terminal result");
            Err(SessionError::TimeoutExceeded)
        }
        result = &mut chans.done => finish(result, &span),
    }
}

fn forward(
    messages: &mpsc::UnboundedSender<TrafficOut>,
    msg: TrafficOut,
    seq: usize,
    span: &Span,
) {
    // temp span per message so logs don't scramble across `.await`s
    let send_span = span!(parent: span, Level::DEBUG, "outgoing", seq);
    let _enter = send_span.enter();

    if msg.is_broadcast {
        debug!("out bcast from [{}]", msg.from);
    } else {
        debug!("out p2p from [{}] to {:?}", msg.from, msg.to);
    }

    // a dropped transport receiver is transient from the protocol's point of
    // view; the round stalls toward the deadline instead of failing here
    if messages.send(msg).is_err() {
        warn!("transport channel closed; dropping outbound message");
    }
}

fn finish(
    result: Result<TssResult<Vec<u8>>, RecvError>,
    span: &Span,
) -> Result<Vec<u8>, SessionError> {
    match result {
        Ok(Ok(blob)) => {
            info!(parent: span, "session completed");
            Ok(blob)
        }
        Ok(Err(err)) => {
            error!(parent: span, "engine fault: {:#}", err);
            Err(SessionError::InvalidParams)
        }
        Err(_) => {
            error!(parent: span, "engine dropped without a terminal result");
            Err(SessionError::InvalidParams)
        }
    }
}
