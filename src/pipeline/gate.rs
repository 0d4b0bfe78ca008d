//! Per-user FIFO turn gate.
//!
//! A place in line is taken synchronously with [`TurnGate::enter`], so the
//! order in which messages are registered is the order in which their turns
//! run, regardless of how the runtime schedules the tasks that wait.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Sent by a ticket abandoned before its turn: the signal it was still waiting on.
struct Handoff(oneshot::Receiver<Handoff>);

#[derive(Default)]
struct GateState {
    /// Per user: sequence number of the newest ticket and the signal it fires when done.
    tails: Mutex<HashMap<String, (u64, oneshot::Receiver<Handoff>)>>,
    next_seq: AtomicU64,
}

#[derive(Clone, Default)]
pub struct TurnGate {
    state: Arc<GateState>,
}

/// A reserved place in a user's queue. Call [`TurnTicket::wait`] to run.
///
/// Dropping a ticket, or cancelling `wait`, gives the place up without
/// letting later tickets overtake the turn that is still ahead of it.
pub struct TurnTicket {
    guard: TurnGuard,
}

/// Held for the duration of a turn; releases the next ticket on drop.
pub struct TurnGuard {
    state: Arc<GateState>,
    user_id: String,
    seq: u64,
    /// Earlier ticket still to finish; `None` once this turn is running.
    waiting_on: Option<(u64, oneshot::Receiver<Handoff>)>,
    done: Option<oneshot::Sender<Handoff>>,
}

impl TurnGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, user_id: &str) -> TurnTicket {
        let (done_tx, done_rx) = oneshot::channel();
        let seq = self.state.next_seq.fetch_add(1, Ordering::Relaxed);
        let waiting_on = self
            .state
            .tails
            .lock()
            .insert(user_id.to_string(), (seq, done_rx));

        TurnTicket {
            guard: TurnGuard {
                state: Arc::clone(&self.state),
                user_id: user_id.to_string(),
                seq,
                waiting_on,
                done: Some(done_tx),
            },
        }
    }

    /// Users with a turn running or queued.
    pub fn active_users(&self) -> usize {
        self.state.tails.lock().len()
    }
}

impl TurnTicket {
    /// Whether an earlier turn for the same user was registered first.
    pub fn is_queued(&self) -> bool {
        self.guard.waiting_on.is_some()
    }

    pub async fn wait(self) -> TurnGuard {
        let mut guard = self.guard;
        while let Some((_, previous)) = guard.waiting_on.as_mut() {
            match (&mut *previous).await {
                // The ticket ahead gave up its place; wait on what it was waiting on.
                Ok(Handoff(next)) => *previous = next,
                // Sender dropped: the earlier turn finished.
                Err(_) => guard.waiting_on = None,
            }
        }
        guard
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let mut tails = self.state.tails.lock();
        let is_tail = tails
            .get(&self.user_id)
            .is_some_and(|(seq, _)| *seq == self.seq);

        match self.waiting_on.take() {
            None => {
                if is_tail {
                    tails.remove(&self.user_id);
                }
            }
            // Abandoned as the newest ticket: the user's tail goes back to what it waited on.
            Some((previous_seq, mut previous)) if is_tail => match previous.try_recv() {
                Err(TryRecvError::Empty) => {
                    tails.insert(self.user_id.clone(), (previous_seq, previous));
                }
                Ok(Handoff(next)) => {
                    tails.insert(self.user_id.clone(), (previous_seq, next));
                }
                Err(TryRecvError::Closed) => {
                    tails.remove(&self.user_id);
                }
            },
            Some((_, previous)) => {
                if let Some(done) = self.done.take() {
                    let _ = done.send(Handoff(previous));
                }
            }
        }
    }
}
