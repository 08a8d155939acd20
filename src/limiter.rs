//! Token-bucket rate limiter for outbound control-plane calls.
//!
//! Every call that reaches the backend API acquires a token first, making
//! this the single serialization point for control-plane traffic across all
//! pools and runners in the process. Tokens are tracked per action class
//! (mutations are far more expensive than reads on most backends) and
//! refilled by a lazily-armed timer: no refill task runs while the system
//! is idle at full burst.

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

const MUTATION_BURST: u32 = 3;
const MUTATION_REFILL: Duration = Duration::from_secs(1);
const READ_BURST: u32 = 10;
const READ_REFILL: Duration = Duration::from_millis(200);

/// Class of an outbound control-plane call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    /// Creates, terminates, stops, starts, updates, volume deletes.
    Mutation,
    /// Status and other read-only lookups.
    Read,
}

impl ActionClass {
    fn burst(self) -> u32 {
        match self {
            Self::Mutation => MUTATION_BURST,
            Self::Read => READ_BURST,
        }
    }

    fn refill_every(self) -> Duration {
        match self {
            Self::Mutation => MUTATION_REFILL,
            Self::Read => READ_REFILL,
        }
    }
}

impl std::fmt::Display for ActionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mutation => write!(f, "mutation"),
            Self::Read => write!(f, "read"),
        }
    }
}

enum Command {
    Acquire {
        class: ActionClass,
        reply: oneshot::Sender<()>,
    },
    Refill {
        class: ActionClass,
    },
}

/// Handle to the rate limiter actor. Cheap to clone; all clones share the
/// same token buckets.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    tx: mpsc::UnboundedSender<Command>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Starts a fresh limiter actor with full buckets.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = LimiterActor::new(tx.clone());
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// The process-wide shared limiter. Calling this more than once observes
    /// the already-running instance.
    pub fn shared() -> &'static RateLimiter {
        static SHARED: OnceLock<RateLimiter> = OnceLock::new();
        SHARED.get_or_init(RateLimiter::new)
    }

    /// Waits until a token for `class` is available, then consumes it.
    ///
    /// Cannot fail; may wait indefinitely. A caller is granted either by
    /// finding a free token or by being dequeued on a refill tick, never
    /// both.
    pub async fn acquire(&self, class: ActionClass) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Acquire {
                class,
                reply: reply_tx,
            })
            .is_err()
        {
            // Actor only goes away during process shutdown; let the caller
            // through rather than wedging it.
            return;
        }
        let _ = reply_rx.await;
    }
}

struct ClassState {
    tokens: u32,
    waiters: VecDeque<oneshot::Sender<()>>,
    refill_scheduled: bool,
}

impl ClassState {
    fn full(class: ActionClass) -> Self {
        Self {
            tokens: class.burst(),
            waiters: VecDeque::new(),
            refill_scheduled: false,
        }
    }
}

struct LimiterActor {
    tx: mpsc::UnboundedSender<Command>,
    mutation: ClassState,
    read: ClassState,
}

impl LimiterActor {
    fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            tx,
            mutation: ClassState::full(ActionClass::Mutation),
            read: ClassState::full(ActionClass::Read),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Acquire { class, reply } => self.handle_acquire(class, reply),
                Command::Refill { class } => self.handle_refill(class),
            }
        }
    }

    fn state_mut(&mut self, class: ActionClass) -> &mut ClassState {
        match class {
            ActionClass::Mutation => &mut self.mutation,
            ActionClass::Read => &mut self.read,
        }
    }

    fn handle_acquire(&mut self, class: ActionClass, reply: oneshot::Sender<()>) {
        let state = self.state_mut(class);
        if state.tokens > 0 {
            state.tokens -= 1;
            let _ = reply.send(());
        } else {
            trace!(class = %class, waiters = state.waiters.len() + 1, "no token free, queueing caller");
            state.waiters.push_back(reply);
        }
        self.ensure_refill(class);
    }

    /// A refill tick either serves the oldest waiter (the service itself is
    /// the refill, so no token is minted) or banks one token up to burst.
    fn handle_refill(&mut self, class: ActionClass) {
        let state = self.state_mut(class);
        state.refill_scheduled = false;
        if let Some(waiter) = state.waiters.pop_front() {
            let _ = waiter.send(());
        } else if state.tokens < class.burst() {
            state.tokens += 1;
        }
        self.ensure_refill(class);
    }

    /// Arms the refill timer only while it is needed, so an idle limiter
    /// runs no timer at all.
    fn ensure_refill(&mut self, class: ActionClass) {
        let tx = self.tx.clone();
        let state = self.state_mut(class);
        if state.refill_scheduled {
            return;
        }
        if state.tokens >= class.burst() && state.waiters.is_empty() {
            return;
        }
        state.refill_scheduled = true;
        tokio::spawn(async move {
            tokio::time::sleep(class.refill_every()).await;
            let _ = tx.send(Command::Refill { class });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_acquires_immediately() {
        let limiter = RateLimiter::new();
        for _ in 0..MUTATION_BURST {
            tokio::time::timeout(Duration::from_millis(100), limiter.acquire(ActionClass::Mutation))
                .await
                .expect("burst token should be granted without waiting");
        }
    }

    #[tokio::test]
    async fn test_read_burst_is_larger() {
        let limiter = RateLimiter::new();
        for _ in 0..READ_BURST {
            tokio::time::timeout(Duration::from_millis(100), limiter.acquire(ActionClass::Read))
                .await
                .expect("read burst token should be granted without waiting");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_mutation_blocks_until_refill() {
        let limiter = RateLimiter::new();
        for _ in 0..MUTATION_BURST {
            limiter.acquire(ActionClass::Mutation).await;
        }

        let mut fourth = Box::pin(limiter.acquire(ActionClass::Mutation));
        assert!(
            tokio::time::timeout(Duration::from_millis(500), &mut fourth)
                .await
                .is_err(),
            "fourth acquire should block with the bucket drained"
        );

        // The next refill tick dequeues the oldest waiter.
        tokio::time::timeout(Duration::from_secs(2), fourth)
            .await
            .expect("waiter should be granted by the refill tick");
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_fifo_order() {
        let limiter = RateLimiter::new();
        for _ in 0..MUTATION_BURST {
            limiter.acquire(ActionClass::Mutation).await;
        }

        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3u32 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(ActionClass::Mutation).await;
                order.lock().unwrap().push(i);
            }));
            // Let each task enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("waiter should eventually be granted")
                .unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_refill_up_to_burst_only() {
        let limiter = RateLimiter::new();
        for _ in 0..MUTATION_BURST {
            limiter.acquire(ActionClass::Mutation).await;
        }

        // Idle long enough to refill well past burst if the cap were broken.
        tokio::time::sleep(Duration::from_secs(30)).await;

        // Exactly burst tokens should be available again, not more.
        for _ in 0..MUTATION_BURST {
            tokio::time::timeout(Duration::from_millis(100), limiter.acquire(ActionClass::Mutation))
                .await
                .expect("refilled token should be granted without waiting");
        }
        let mut extra = Box::pin(limiter.acquire(ActionClass::Mutation));
        assert!(
            tokio::time::timeout(Duration::from_millis(500), &mut extra)
                .await
                .is_err(),
            "tokens must not accumulate past the burst limit"
        );
    }

    #[tokio::test]
    async fn test_shared_instance_is_idempotent() {
        let a = RateLimiter::shared();
        let b = RateLimiter::shared();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn test_action_class_display() {
        assert_eq!(format!("{}", ActionClass::Mutation), "mutation");
        assert_eq!(format!("{}", ActionClass::Read), "read");
    }
}
