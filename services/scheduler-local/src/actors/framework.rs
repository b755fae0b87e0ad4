//! Mailbox actors on tokio tasks.
//!
//! An actor owns its state and sees one message at a time. It stops when
//! the shared shutdown flag flips, when its handler asks to stop or fails
//! permanently, or when every handle has been dropped. Whatever is still
//! queued at that point is handed back through [`Actor::reject`], so
//! callers waiting on a reply are never left hanging.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Anything an actor can receive.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Message;

    /// Prefix for the actor id in logs.
    fn name(&self) -> &str;

    /// Process one message. `Ok(false)` stops the actor after this message.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Fail a message that arrived too late to be handled.
    fn reject(&mut self, _msg: Self::Message) {}

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Per-actor bookkeeping passed to every handler call.
#[derive(Debug)]
pub struct ActorContext {
    pub actor_id: String,
    pub handled: u64,
}

#[derive(Debug, Error)]
pub enum ActorError {
    /// The actor's state can no longer be trusted; it stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Handles
// =============================================================================

/// Sending side of an actor's mailbox.
#[derive(Debug)]
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Queue a message, waiting while the mailbox is full.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::ActorStopped)
    }
}

/// Owner's view of the actor task.
#[derive(Debug)]
pub struct ActorRef {
    pub actor_id: String,
    task: JoinHandle<()>,
}

impl ActorRef {
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(actor_id = %self.actor_id, error = %e, "Actor task panicked");
        }
    }
}

static NEXT_ACTOR: AtomicU64 = AtomicU64::new(0);

/// Start `actor` with a mailbox of `mailbox_size` messages.
pub fn spawn<A: Actor>(
    actor: A,
    mailbox_size: usize,
    shutdown: watch::Receiver<bool>,
) -> (ActorHandle<A::Message>, ActorRef) {
    let actor_id = format!("{}-{}", actor.name(), NEXT_ACTOR.fetch_add(1, Ordering::Relaxed));
    let (tx, rx) = mpsc::channel(mailbox_size);

    let ctx = ActorContext {
        actor_id: actor_id.clone(),
        handled: 0,
    };
    let task = tokio::spawn(run(actor, ctx, rx, shutdown));
    info!(actor_id = %actor_id, mailbox_size, "Spawned actor");

    (ActorHandle { tx }, ActorRef { actor_id, task })
}

async fn run<A: Actor>(
    mut actor: A,
    mut ctx: ActorContext,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        debug!(actor_id = %ctx.actor_id, "Shutdown already signaled");
    } else {
        loop {
            let msg = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(actor_id = %ctx.actor_id, "Shutdown signaled");
                        break;
                    }
                    continue;
                }
                msg = rx.recv() => msg,
            };

            let Some(msg) = msg else {
                debug!(actor_id = %ctx.actor_id, "All handles dropped");
                break;
            };

            ctx.handled += 1;
            match actor.handle(msg, &mut ctx).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(ActorError::Permanent(reason)) => {
                    error!(actor_id = %ctx.actor_id, reason = %reason, "Actor failed permanently");
                    break;
                }
                Err(e) => warn!(actor_id = %ctx.actor_id, error = %e, "Message failed"),
            }
        }
    }

    rx.close();
    let mut rejected = 0usize;
    while let Ok(msg) = rx.try_recv() {
        actor.reject(msg);
        rejected += 1;
    }
    actor.on_stop(&mut ctx).await;

    info!(
        actor_id = %ctx.actor_id,
        handled = ctx.handled,
        rejected,
        "Actor stopped"
    );
}

// =============================================================================
// Backoff
// =============================================================================

/// Doubling retry delay with symmetric jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay that may be added or removed.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            max: Duration::from_secs(2),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let doubled = self.base.saturating_mul(1u32 << attempt.min(20));
        let capped = doubled.min(self.max).as_secs_f64();
        let spread = capped * self.jitter.clamp(0.0, 1.0) * clock_noise();
        Duration::from_secs_f64((capped + spread).max(0.0))
    }
}

/// Value in [-1, 1] taken from the clock's sub-second nanos.
fn clock_noise() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    f64::from(nanos % 2001) / 1000.0 - 1.0
}
