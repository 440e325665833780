//! Ticket-based serializer for log emission order.
//!
//! Observation tasks run concurrently, but log lines must appear in call
//! order. Each task takes a sequence ticket when it starts processing and
//! waits for its ticket to become head-of-line before emitting. Waiting
//! is bounded by a safety timeout so one stuck task can reorder lines but
//! never wedge unrelated calls.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Safety valve on sequence waits. Fail-open: on timeout the waiter
/// proceeds out of order rather than blocking forever.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

struct State {
    counter: u64,
    /// Lowest sequence not yet known complete; waiters for sequences at
    /// or below this value proceed immediately.
    next: u64,
    active: HashSet<u64>,
    waiters: HashMap<u64, oneshot::Sender<()>>,
}

pub struct OrderedProcessor {
    state: Mutex<State>,
    stop: CancellationToken,
}

impl OrderedProcessor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                counter: 0,
                next: 1,
                active: HashSet::new(),
                waiters: HashMap::new(),
            }),
            stop: CancellationToken::new(),
        }
    }

    /// Release all waiters with a negative result; used at shutdown.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Issue the next sequence number and mark it active.
    pub fn next_sequence(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        state.counter += 1;
        let seq = state.counter;
        state.active.insert(seq);

        seq
    }

    /// Wait until every sequence below `seq` has completed.
    ///
    /// Returns true when the turn arrived or the safety timeout fired,
    /// false when the processor was stopped.
    pub async fn wait_for_sequence(&self, seq: u64) -> bool {
        let rx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            advance(&mut state);

            if seq <= state.next {
                return true;
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.insert(seq, tx);
            rx
        };

        tokio::select! {
            _ = rx => true,
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(WAIT_TIMEOUT) => true,
        }
    }

    /// Mark a sequence complete and wake any waiter that became eligible.
    pub fn complete_sequence(&self, seq: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active.remove(&seq);
        advance(&mut state);
    }

    /// RAII ticket: completes its sequence when dropped, so early returns
    /// in observation tasks cannot leak an active sequence.
    pub fn sequence_guard(&self) -> SequenceGuard<'_> {
        SequenceGuard {
            processor: self,
            seq: self.next_sequence(),
        }
    }
}

impl Default for OrderedProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Advance `next` past completed sequences, waking eligible waiters.
fn advance(state: &mut State) {
    while state.next <= state.counter && !state.active.contains(&state.next) {
        state.next += 1;

        let next = state.next;
        if let Some(waiter) = state.waiters.remove(&next) {
            let _ = waiter.send(());
        }
    }
}

pub struct SequenceGuard<'a> {
    processor: &'a OrderedProcessor,
    seq: u64,
}

impl SequenceGuard<'_> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub async fn wait(&self) -> bool {
        self.processor.wait_for_sequence(self.seq).await
    }
}

impl Drop for SequenceGuard<'_> {
    fn drop(&mut self) {
        self.processor.complete_sequence(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn head_of_line_proceeds_immediately() {
        let op = OrderedProcessor::new();
        let seq = op.next_sequence();
        assert_eq!(seq, 1);
        assert!(op.wait_for_sequence(seq).await);
        op.complete_sequence(seq);
    }

    #[tokio::test]
    async fn waiter_blocks_until_predecessor_completes() {
        let op = Arc::new(OrderedProcessor::new());
        let first = op.next_sequence();
        let second = op.next_sequence();

        let waiter = {
            let op = op.clone();
            tokio::spawn(async move { op.wait_for_sequence(second).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        op.complete_sequence(first);

        let reached = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .expect("waiter task");
        assert!(reached);
    }

    #[tokio::test]
    async fn out_of_order_completion_releases_in_order() {
        let op = Arc::new(OrderedProcessor::new());
        let s1 = op.next_sequence();
        let s2 = op.next_sequence();
        let s3 = op.next_sequence();

        // s2 completes before s1; s3's waiter must stay blocked.
        op.complete_sequence(s2);

        let waiter = {
            let op = op.clone();
            tokio::spawn(async move { op.wait_for_sequence(s3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Completing s1 unblocks everything up to s3.
        op.complete_sequence(s1);
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("released")
            .expect("task"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_fail_open() {
        let op = OrderedProcessor::new();
        let _stuck = op.next_sequence();
        let second = op.next_sequence();

        // The predecessor never completes; the safety valve fires.
        assert!(op.wait_for_sequence(second).await);
    }

    #[tokio::test]
    async fn stop_releases_waiters_with_false() {
        let op = Arc::new(OrderedProcessor::new());
        let _first = op.next_sequence();
        let second = op.next_sequence();

        let waiter = {
            let op = op.clone();
            tokio::spawn(async move { op.wait_for_sequence(second).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        op.stop();

        let reached = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("released")
            .expect("task");
        assert!(!reached);
    }

    #[tokio::test]
    async fn guard_completes_on_drop() {
        let op = Arc::new(OrderedProcessor::new());

        let second = {
            let _guard = op.sequence_guard();
            op.next_sequence()
            // guard drops here, completing sequence 1
        };

        assert!(op.wait_for_sequence(second).await);
    }
}
