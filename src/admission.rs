//! Admission router: decides whether an incoming change goes to the
//! bypass lane or the main queue, under a single global mutex serialized
//! against queue state -- one writer, no half-applied queue state ever
//! visible to a reader.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::change::Change;
use crate::conflict::ConflictPredicate;
use crate::errors::AdmissionError;

/// Shared queue state: ordered main queue plus the bounded bypass lane. The
/// coordinator's tick loop reads and mutates this through the same mutex the
/// router serializes submissions against -- there is no second lock to get
/// out of step with.
#[derive(Default)]
pub struct QueueState {
    pub main_queue: VecDeque<Change>,
    pub bypass_lane: Vec<Change>,
}

pub struct AdmissionRouter {
    conflict: Arc<dyn ConflictPredicate>,
    max_bypass_slots: usize,
    state: Arc<Mutex<QueueState>>,
    shutting_down: AtomicBool,
}

impl AdmissionRouter {
    pub fn new(conflict: Arc<dyn ConflictPredicate>, max_bypass_slots: usize) -> Self {
        Self {
            conflict,
            max_bypass_slots,
            state: Arc::new(Mutex::new(QueueState::default())),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn describe_predicate(&self) -> String {
        self.conflict.describe()
    }

    pub fn state(&self) -> Arc<Mutex<QueueState>> {
        self.state.clone()
    }

    /// Routes `change` under the global mutex. A change independent
    /// of everything currently queued goes to the bypass lane if there's
    /// room, otherwise to the main queue tail; a non-independent change
    /// always joins the main queue tail. Never half-admits: either the
    /// whole routing decision commits, or an error is returned and queue
    /// state is untouched.
    pub async fn submit(&self, change: Change, caller: &CancellationToken) -> Result<(), AdmissionError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(AdmissionError::ShuttingDown);
        }
        if caller.is_cancelled() {
            return Err(AdmissionError::CallerCancelled);
        }

        let mut state = self.state.lock();
        let independent = !state
            .main_queue
            .iter()
            .chain(state.bypass_lane.iter())
            .any(|existing| self.conflict.conflicts(&change, existing));

        if independent && state.bypass_lane.len() < self.max_bypass_slots {
            state.bypass_lane.push(change);
        } else {
            state.main_queue.push_back(change);
        }
        Ok(())
    }

    /// Marks the router as shutting down; every subsequent `submit` fails.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}
