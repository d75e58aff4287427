//! Payment terminal facade: collect/cancel commands and the payment state
//! machine.
//!
//! # One payment at a time (for beginners)
//!
//! Nothing on the wire says *which* collect an event belongs to.  The facade
//! therefore allows exactly one collect in flight.  While it is pending,
//! every payment event is assumed to be about it; with nothing pending,
//! events are logged and dropped.
//!
//! # Settlement
//!
//! When an attempt ends (result event, bridge-reported cancel or error,
//! timeout, or a local cancel after the grace period) the facade:
//!
//! 1. moves to the terminal state and tells state subscribers,
//! 2. hands the result to result subscribers,
//! 3. resets to `idle` and tells state subscribers again,
//! 4. resolves the waiting `collect`.
//!
//! Subscribers run before the reset, so a `collect` started from inside a
//! callback is rejected.  The awaiting caller always wakes up to an idle
//! terminal and may start the next payment straight away.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use peripheral_core::protocol::destinations;
use peripheral_core::{
    PaymentCommand, PaymentEvent, PaymentRequest, PaymentResult, PaymentState, RequestError,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::infrastructure::bus::MessageBus;
use crate::infrastructure::listeners::{ListenerSet, Subscription};

/// Grace period a `cancel` waits for the bridge before settling locally.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Why a collect or cancel did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("not allowed while the terminal is {state}")]
    InvalidState { state: PaymentState },

    #[error("no payment outcome within {after:?}")]
    Timeout { after: Duration },

    #[error("invalid payment request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("client disconnected while the payment was pending")]
    Closed,
}

type Reply = Result<PaymentResult, PaymentError>;

struct Pending {
    attempt: u64,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Core {
    state: PaymentState,
    pending: Option<Pending>,
    attempts: u64,
}

struct PaymentInner {
    bus: Arc<dyn MessageBus>,
    core: Mutex<Core>,
    state_listeners: ListenerSet<dyn Fn(&PaymentState) + Send + Sync>,
    result_listeners: ListenerSet<dyn Fn(&PaymentResult) + Send + Sync>,
    /// Bumped after every settlement; `cancel` waits on it.
    settled: watch::Sender<u64>,
    cancel_grace: Duration,
    attachment: Mutex<Option<Subscription>>,
}

impl PaymentInner {
    fn send_cancel(&self) {
        self.bus
            .send(destinations::PAYMENT_CANCEL, PaymentCommand::cancel().to_json());
    }

    fn owns(&self, attempt: u64) -> bool {
        self.core
            .lock()
            .pending
            .as_ref()
            .is_some_and(|p| p.attempt == attempt)
    }

    /// Ends the pending attempt.  With `attempt` set, only that attempt is
    /// settled.  Returns `false` when there was nothing to settle.
    fn settle(
        &self,
        attempt: Option<u64>,
        terminal: PaymentState,
        result: Option<PaymentResult>,
        reply: Reply,
    ) -> bool {
        let (pending, already_terminal) = {
            let mut core = self.core.lock();
            let matches = match (&core.pending, attempt) {
                (Some(p), Some(wanted)) => p.attempt == wanted,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !matches {
                return false;
            }
            let already_terminal = core.state == terminal;
            core.state = terminal;
            (core.pending.take(), already_terminal)
        };
        let Some(pending) = pending else {
            return false;
        };

        info!(attempt = pending.attempt, outcome = %terminal, "payment settled");
        if !already_terminal {
            self.state_listeners.emit(&terminal);
        }
        if let Some(result) = &result {
            self.result_listeners.emit(result);
        }

        self.core.lock().state = PaymentState::Idle;
        self.state_listeners.emit(&PaymentState::Idle);
        self.settled.send_modify(|generation| *generation += 1);

        if pending.reply.send(reply).is_err() {
            debug!(attempt = pending.attempt, "collect caller went away before settlement");
        }
        true
    }

    fn settle_with_result(&self, terminal: PaymentState, result: PaymentResult) {
        if !self.settle(None, terminal, Some(result.clone()), Ok(result)) {
            debug!(outcome = %terminal, "no collect pending; dropping payment outcome");
        }
    }

    /// Records a bridge-reported progress state.
    fn advance(&self, next: PaymentState) {
        {
            let mut core = self.core.lock();
            if core.pending.is_none() {
                debug!(state = %next, "no collect pending; dropping state change");
                return;
            }
            if !core.state.can_transition_to(next) {
                debug!(from = %core.state, to = %next, "dropping out-of-order state change");
                return;
            }
            core.state = next;
        }
        debug!(state = %next, "payment state");
        self.state_listeners.emit(&next);
    }

    fn handle(&self, body: &Value) {
        let event = match PaymentEvent::from_json(body) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping malformed payment event: {e}");
                return;
            }
        };

        match event {
            PaymentEvent::StateChange {
                state: PaymentState::Cancelled,
                ..
            } => self.settle_with_result(PaymentState::Cancelled, PaymentResult::cancelled()),
            PaymentEvent::StateChange {
                state: PaymentState::Error,
                data,
            } => {
                let message = PaymentEvent::error_message(data.as_ref());
                self.settle_with_result(PaymentState::Error, PaymentResult::failed(message));
            }
            PaymentEvent::StateChange { state, .. } => self.advance(state),
            PaymentEvent::Result(result) => {
                self.settle_with_result(result.outcome_state(), result);
            }
        }
    }

    /// Cleans up after a collect whose future was dropped mid-flight.
    fn abandon(&self, attempt: u64) {
        if !self.owns(attempt) {
            return;
        }
        warn!(attempt, "collect abandoned by caller; cancelling");
        self.send_cancel();
        self.settle(
            Some(attempt),
            PaymentState::Cancelled,
            None,
            Err(PaymentError::Closed),
        );
    }
}

/// Settles the attempt if the `collect` future is dropped before it ends.
struct AttemptGuard<'a> {
    inner: &'a PaymentInner,
    attempt: u64,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.abandon(self.attempt);
        }
    }
}

/// Card terminal behind the bridge.  Cheap to clone.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use peripheral_client::application::payment::PaymentFacade;
/// use peripheral_client::infrastructure::bus::LoopbackBus;
/// use peripheral_core::PaymentRequest;
///
/// # async fn run() -> anyhow::Result<()> {
/// let payment = PaymentFacade::new(Arc::new(LoopbackBus::new()));
/// payment.attach();
/// let result = payment.collect(PaymentRequest::new(1250, "eur")?).await?;
/// println!("approved: {}", result.approved);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PaymentFacade {
    inner: Arc<PaymentInner>,
}

impl PaymentFacade {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self::with_cancel_grace(bus, DEFAULT_CANCEL_GRACE)
    }

    pub fn with_cancel_grace(bus: Arc<dyn MessageBus>, cancel_grace: Duration) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            inner: Arc::new(PaymentInner {
                bus,
                core: Mutex::new(Core::default()),
                state_listeners: ListenerSet::new(),
                result_listeners: ListenerSet::new(),
                settled,
                cancel_grace,
                attachment: Mutex::new(None),
            }),
        }
    }

    /// Subscribes to the payment events topic.  Idempotent.
    pub fn attach(&self) {
        let mut attachment = self.inner.attachment.lock();
        if attachment.is_some() {
            return;
        }
        let inner: Weak<PaymentInner> = Arc::downgrade(&self.inner);
        let handler = Arc::new(move |body: &Value| {
            if let Some(inner) = inner.upgrade() {
                inner.handle(body);
            }
        });
        *attachment = Some(self.inner.bus.subscribe(destinations::PAYMENT_EVENTS, handler));
    }

    /// Unsubscribes, resolves a pending collect with
    /// [`PaymentError::Closed`], resets to idle, and drops every handler.
    pub fn detach(&self) {
        let attachment = self.inner.attachment.lock().take();
        if let Some(subscription) = attachment {
            subscription.unsubscribe();
        }

        let (pending, was_idle) = {
            let mut core = self.inner.core.lock();
            let was_idle = core.state == PaymentState::Idle;
            core.state = PaymentState::Idle;
            (core.pending.take(), was_idle)
        };
        if !was_idle {
            self.inner.state_listeners.emit(&PaymentState::Idle);
        }
        if let Some(pending) = pending {
            info!(attempt = pending.attempt, "pending collect closed by disconnect");
            self.inner.settled.send_modify(|generation| *generation += 1);
            let _ = pending.reply.send(Err(PaymentError::Closed));
        }

        self.inner.state_listeners.clear();
        self.inner.result_listeners.clear();
    }

    pub fn state(&self) -> PaymentState {
        self.inner.core.lock().state
    }

    /// `true` while a collect is pending.
    pub fn is_busy(&self) -> bool {
        self.inner.core.lock().pending.is_some()
    }

    /// Registers `handler` for every state transition, the reset to idle
    /// included.
    pub fn on_state_change(
        &self,
        handler: impl Fn(&PaymentState) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.state_listeners.add(Arc::new(handler))
    }

    /// Registers `handler` for each final result.
    pub fn on_result(&self, handler: impl Fn(&PaymentResult) + Send + Sync + 'static) -> Subscription {
        self.inner.result_listeners.add(Arc::new(handler))
    }

    /// Starts a payment and waits for its outcome.
    ///
    /// A declined payment, a bridge-reported error and a cancel all resolve
    /// with `Ok`; inspect `approved` and `error` on the result.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::InvalidState`] unless the terminal is idle.
    /// - [`PaymentError::Timeout`] when `request.timeout()` elapses first.  A
    ///   cancel command is sent in that case.
    /// - [`PaymentError::Closed`] when the client disconnects meanwhile.
    pub async fn collect(&self, request: PaymentRequest) -> Result<PaymentResult, PaymentError> {
        let (reply, mut outcome) = oneshot::channel();
        let attempt = {
            let mut core = self.inner.core.lock();
            if core.state != PaymentState::Idle || core.pending.is_some() {
                return Err(PaymentError::InvalidState { state: core.state });
            }
            core.attempts += 1;
            let attempt = core.attempts;
            core.pending = Some(Pending { attempt, reply });
            core.state = PaymentState::CardPresented;
            attempt
        };
        let mut guard = AttemptGuard {
            inner: &self.inner,
            attempt,
            armed: true,
        };

        info!(
            attempt,
            amount = request.amount_minor_units(),
            currency = request.currency(),
            "collecting payment"
        );
        self.inner.state_listeners.emit(&PaymentState::CardPresented);
        self.inner.bus.send(
            destinations::PAYMENT_COLLECT,
            PaymentCommand::collect(&request).to_json(),
        );

        let after = request.timeout();
        let reply = match timeout(after, &mut outcome).await {
            Ok(reply) => reply.unwrap_or(Err(PaymentError::Closed)),
            Err(_) if self.inner.owns(attempt) => {
                warn!(attempt, ?after, "payment timed out; cancelling");
                self.inner.send_cancel();
                if self.inner.settle(
                    Some(attempt),
                    PaymentState::Cancelled,
                    None,
                    Err(PaymentError::Timeout { after }),
                ) {
                    Err(PaymentError::Timeout { after })
                } else {
                    outcome.await.unwrap_or(Err(PaymentError::Closed))
                }
            }
            Err(_) => outcome.await.unwrap_or(Err(PaymentError::Closed)),
        };
        guard.armed = false;
        reply
    }

    /// Shorthand for [`collect`](Self::collect) with a request built from an
    /// amount and currency and the default timeout.
    ///
    /// # Errors
    ///
    /// [`PaymentError::InvalidRequest`] for a bad amount or currency, then
    /// everything `collect` can return.
    pub async fn collect_amount(
        &self,
        amount_minor_units: u64,
        currency: &str,
    ) -> Result<PaymentResult, PaymentError> {
        let request = PaymentRequest::new(amount_minor_units, currency)?;
        self.collect(request).await
    }

    /// Asks the bridge to cancel the current payment.
    ///
    /// With a collect pending, waits up to the grace period for the bridge
    /// to confirm, then settles the attempt locally as cancelled.
    ///
    /// # Errors
    ///
    /// [`PaymentError::InvalidState`] from a terminal state.
    pub async fn cancel(&self) -> Result<(), PaymentError> {
        let waiting = {
            let core = self.inner.core.lock();
            if core.state.is_terminal() {
                return Err(PaymentError::InvalidState { state: core.state });
            }
            core.pending
                .as_ref()
                .map(|p| (p.attempt, self.inner.settled.subscribe()))
        };

        info!("cancelling payment");
        self.inner.send_cancel();

        let Some((attempt, mut settled)) = waiting else {
            return Ok(());
        };
        let grace = self.inner.cancel_grace;
        if timeout(grace, settled.changed()).await.is_err() {
            let settled_locally = self.inner.settle(
                Some(attempt),
                PaymentState::Cancelled,
                Some(PaymentResult::cancelled()),
                Ok(PaymentResult::cancelled()),
            );
            if settled_locally {
                warn!(attempt, ?grace, "bridge did not confirm cancel; settled locally");
            }
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
