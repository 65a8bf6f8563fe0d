//! Cancellation of folder operations.
//!
//! An [`OpContext`] wraps the caller's [`CancellationToken`]. Work checks
//! the *effective* token, which normally follows the caller's, but while
//! delayed cancellation is enabled it only fires a grace period after the
//! caller gave up. The commit path enables it so a revision that is
//! already on its way to the server is not abandoned half-written, and
//! the returned [`DelayedCancellation`] guard switches it off again when
//! the commit is over.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tlf_core::{TlfError, TlfResult};
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Clone, Debug)]
pub struct OpContext {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    caller: CancellationToken,
    effective: CancellationToken,
    delay_ms: Arc<AtomicU64>,
    reset: Arc<Notify>,
    _done: DropGuard,
}

impl OpContext {
    /// Must be called from within a tokio runtime.
    pub fn new(caller: CancellationToken) -> Self {
        let effective = CancellationToken::new();
        let delay_ms = Arc::new(AtomicU64::new(0));
        let reset = Arc::new(Notify::new());
        let done = CancellationToken::new();
        tokio::spawn(watch(
            caller.clone(),
            effective.clone(),
            delay_ms.clone(),
            reset.clone(),
            done.clone(),
        ));
        Self {
            inner: Arc::new(Inner {
                caller,
                effective,
                delay_ms,
                reset,
                _done: done.drop_guard(),
            }),
        }
    }

    /// A context nobody outside the engine can cancel.
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// The token work should watch.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.effective
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.effective.is_cancelled()
    }

    pub fn check(&self) -> TlfResult<()> {
        if self.is_canceled() {
            return Err(TlfError::Canceled.into());
        }
        Ok(())
    }

    /// Until the returned guard is dropped, a cancellation by the caller
    /// only takes effect `grace` later. Fails if the caller has already
    /// canceled.
    pub fn enable_delayed_cancellation(&self, grace: Duration) -> TlfResult<DelayedCancellation<'_>> {
        if self.inner.caller.is_cancelled() || self.is_canceled() {
            return Err(TlfError::Canceled.into());
        }
        let ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self.inner.delay_ms.store(ms, Ordering::Release);
        Ok(DelayedCancellation { ctx: self })
    }

    /// Runs `fut` unless the effective token fires first.
    pub async fn run<F, T>(&self, fut: F) -> TlfResult<T>
    where
        F: Future<Output = TlfResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.inner.effective.cancelled() => Err(TlfError::Canceled.into()),
            res = fut => res,
        }
    }
}

/// Delayed cancellation of an [`OpContext`], on while this lives. A
/// cancellation the caller made in the meantime takes effect on drop.
#[must_use = "delayed cancellation ends when the guard is dropped"]
#[derive(Debug)]
pub struct DelayedCancellation<'a> {
    ctx: &'a OpContext,
}

impl Drop for DelayedCancellation<'_> {
    fn drop(&mut self) {
        self.ctx.inner.delay_ms.store(0, Ordering::Release);
        self.ctx.inner.reset.notify_one();
    }
}

async fn watch(
    caller: CancellationToken,
    effective: CancellationToken,
    delay_ms: Arc<AtomicU64>,
    reset: Arc<Notify>,
    done: CancellationToken,
) {
    tokio::select! {
        _ = caller.cancelled() => {}
        _ = done.cancelled() => return,
    }
    loop {
        let delay = delay_ms.load(Ordering::Acquire);
        if delay == 0 {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay)) => break,
            // Re-read the delay: the guard may have been dropped.
            _ = reset.notified() => {}
            _ = done.cancelled() => return,
        }
    }
    effective.cancel();
}

/// A token that fires once every token in `tokens` has fired. An empty
/// set yields a token that has already fired.
pub fn coalesce(tokens: &[CancellationToken]) -> CancellationToken {
    let out = CancellationToken::new();
    if tokens.is_empty() {
        out.cancel();
        return out;
    }
    let remaining = Arc::new(AtomicUsize::new(tokens.len()));
    for token in tokens {
        let token = token.clone();
        let out = out.clone();
        let remaining = remaining.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        out.cancel();
                    }
                }
                _ = out.cancelled() => {}
            }
        });
    }
    out
}
