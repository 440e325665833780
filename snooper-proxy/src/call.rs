//! Per-call context: identity, sliding deadline, cancellation, scratchpad.
//!
//! Each proxied call gets a context with a process-unique id and a
//! cancellation token governed by a sliding deadline. The deadline is
//! extended by non-blocking sends into an update channel (event-stream
//! activity extends it per event); on expiry the token is cancelled and
//! in-flight body streaming terminates at its next poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use snooper_core::module::{ModuleId, ProxyCall};

/// Capacity of the deadline update channel. Extensions beyond this burst
/// are dropped; the deadline is already moving forward at that point.
const UPDATE_CHANNEL_CAPACITY: usize = 5;

/// Grace period after deadline cancellation, letting in-flight I/O
/// observe the token before the driver task exits.
const CANCEL_UNWIND_DELAY: Duration = Duration::from_millis(10);

/// Per-call state shared between the proxy path and observation tasks.
pub struct ProxyCallContext {
    id: u64,
    token: CancellationToken,
    cancelled: Arc<AtomicBool>,
    update_tx: mpsc::Sender<Duration>,
    request_logged_tx: watch::Sender<bool>,
    data: DashMap<(ModuleId, String), Value>,
    created_at: Instant,
    upstream_started: OnceLock<Instant>,
}

impl ProxyCallContext {
    /// Create a context with `id` and a sliding deadline of `timeout`,
    /// parented to `parent` (cancelling the parent cancels the call).
    pub fn new(id: u64, parent: &CancellationToken, timeout: Duration) -> Arc<Self> {
        let token = parent.child_token();
        let cancelled = Arc::new(AtomicBool::new(false));
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let (request_logged_tx, _) = watch::channel(false);

        let ctx = Arc::new(Self {
            id,
            token: token.clone(),
            cancelled: cancelled.clone(),
            update_tx,
            request_logged_tx,
            data: DashMap::new(),
            created_at: Instant::now(),
            upstream_started: OnceLock::new(),
        });

        tokio::spawn(drive_deadline(id, token, cancelled, update_rx, timeout));

        ctx
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancellation token observed by body streaming and waiters.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel the call explicitly (request finished or aborted).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the call was cancelled by deadline expiry or parent
    /// cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.token.is_cancelled()
    }

    /// Extend the sliding deadline by `timeout` from now. Non-blocking;
    /// a full update channel drops the extension.
    pub fn extend(&self, timeout: Duration) {
        let _ = self.update_tx.try_send(timeout);
    }

    /// Mark the upstream request as issued; call duration is measured
    /// from this instant to response body EOF.
    pub fn mark_upstream_started(&self) {
        let _ = self.upstream_started.set(Instant::now());
    }

    /// Elapsed time since the upstream request was issued (or since call
    /// creation when forwarding never started).
    pub fn upstream_elapsed(&self) -> Duration {
        self.upstream_started
            .get()
            .copied()
            .unwrap_or(self.created_at)
            .elapsed()
    }

    /// Signal that the request log entry has been emitted; response
    /// observation waits for this so a call's request always logs first.
    pub fn mark_request_logged(&self) {
        let _ = self.request_logged_tx.send(true);
    }

    /// Wait until the request log entry has been emitted or the call is
    /// cancelled.
    pub async fn request_logged(&self) {
        let mut rx = self.request_logged_tx.subscribe();

        tokio::select! {
            _ = rx.wait_for(|logged| *logged) => {}
            _ = self.token.cancelled() => {}
        }
    }
}

impl ProxyCall for ProxyCallContext {
    fn call_id(&self) -> u64 {
        self.id
    }

    fn set_data(&self, module_id: ModuleId, key: &str, value: Value) {
        self.data.insert((module_id, key.to_string()), value);
    }

    fn get_data(&self, module_id: ModuleId, key: &str) -> Option<Value> {
        self.data
            .get(&(module_id, key.to_string()))
            .map(|entry| entry.value().clone())
    }
}

/// Deadline driver: waits for extensions, parent/explicit cancellation or
/// expiry. On expiry the token is cancelled and the task lingers briefly
/// so in-flight I/O can unwind against the cancelled token.
async fn drive_deadline(
    id: u64,
    token: CancellationToken,
    cancelled: Arc<AtomicBool>,
    mut update_rx: mpsc::Receiver<Duration>,
    timeout: Duration,
) {
    let mut deadline = Instant::now() + timeout;

    loop {
        tokio::select! {
            update = update_rx.recv() => match update {
                // The deadline only ever moves forward from "now".
                Some(extension) => deadline = Instant::now() + extension,
                // Context dropped; nothing left to guard.
                None => return,
            },
            _ = token.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {
                debug!(call_id = id, "call deadline expired, cancelling");
                cancelled.store(true, Ordering::Release);
                token.cancel();
                tokio::time::sleep(CANCEL_UNWIND_DELAY).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn deadline_expiry_cancels_token() {
        let parent = CancellationToken::new();
        let ctx = ProxyCallContext::new(1, &parent, Duration::from_millis(30));

        assert!(!ctx.is_cancelled());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(ctx.is_cancelled());
        assert!(ctx.token().is_cancelled());
    }

    #[tokio::test]
    async fn extension_moves_deadline_forward() {
        let parent = CancellationToken::new();
        let ctx = ProxyCallContext::new(2, &parent, Duration::from_millis(50));

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            ctx.extend(Duration::from_millis(50));
        }

        // Without the extensions the 50ms deadline would have fired long ago.
        assert!(!ctx.is_cancelled());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let ctx = ProxyCallContext::new(3, &parent, Duration::from_secs(60));

        parent.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn scratchpad_is_keyed_by_module_and_key() {
        let parent = CancellationToken::new();
        let ctx = ProxyCallContext::new(4, &parent, Duration::from_secs(60));

        ctx.set_data(1, "wants_response", json!(true));
        ctx.set_data(2, "wants_response", json!(false));

        assert_eq!(ctx.get_data(1, "wants_response"), Some(json!(true)));
        assert_eq!(ctx.get_data(2, "wants_response"), Some(json!(false)));
        assert_eq!(ctx.get_data(3, "wants_response"), None);
        assert_eq!(ctx.get_data(1, "other"), None);
    }

    #[tokio::test]
    async fn request_logged_signal_releases_waiter() {
        let parent = CancellationToken::new();
        let ctx = ProxyCallContext::new(5, &parent, Duration::from_secs(60));

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.request_logged().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        ctx.mark_request_logged();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .expect("waiter task");
    }
}
