//! One-shot stop tokens and a drain counter for supervisor threads.
use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

#[derive(Debug, Default)]
struct TokenState {
    fired: bool,
    children: Vec<Weak<TokenInner>>,
}

#[derive(Debug, Default)]
struct TokenInner {
    state: Mutex<TokenState>,
    cond: Condvar,
}

impl TokenInner {
    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A shared, idempotent, one-shot stop signal.
///
/// Clones observe the same signal. A child token fires when its parent fires
/// but can also be fired on its own without touching the parent.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    inner: Arc<TokenInner>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token and every live child token.
    ///
    /// Returns `true` only for the call that actually fired it.
    pub fn signal(&self) -> bool {
        let children = {
            let mut state = self.inner.lock();
            if state.fired {
                return false;
            }
            state.fired = true;
            std::mem::take(&mut state.children)
        };
        self.inner.cond.notify_all();

        for child in children.iter().filter_map(Weak::upgrade) {
            StopToken { inner: child }.signal();
        }
        true
    }

    /// Non-blocking poll.
    pub fn is_signaled(&self) -> bool {
        self.inner.lock().fired
    }

    /// Blocks until the token fires.
    pub fn wait(&self) {
        let guard = self.inner.lock();
        let _guard = self
            .inner
            .cond
            .wait_while(guard, |state| !state.fired)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Blocks for at most `timeout`, returning `true` as soon as the token fires.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.inner.lock();
        let (guard, _) = self
            .inner
            .cond
            .wait_timeout_while(guard, timeout, |state| !state.fired)
            .unwrap_or_else(PoisonError::into_inner);
        guard.fired
    }

    /// Creates a token that fires together with this one.
    pub fn child_token(&self) -> StopToken {
        let child = StopToken::new();
        let mut state = self.inner.lock();
        if state.fired {
            drop(state);
            child.signal();
        } else {
            state.children.retain(|weak| weak.strong_count() > 0);
            state.children.push(Arc::downgrade(&child.inner));
        }
        child
    }
}

/// Counts in-flight supervisor threads so shutdown can wait for all of them.
#[derive(Debug, Clone, Default)]
pub struct WaitGroup {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn count_guard(&self) -> MutexGuard<'_, usize> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers one more in-flight task; the task is done when the guard drops.
    pub fn enter(&self) -> WaitGuard {
        *self.count_guard() += 1;
        WaitGuard {
            group: self.clone(),
        }
    }

    fn done(&self) {
        let mut count = self.count_guard();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.1.notify_all();
        }
    }

    /// Number of tasks still in flight.
    pub fn count(&self) -> usize {
        *self.count_guard()
    }

    /// Blocks until every entered task has finished.
    pub fn wait(&self) {
        let guard = self.count_guard();
        let _guard = self
            .inner
            .1
            .wait_while(guard, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Marks one [`WaitGroup`] task as finished when dropped, including on unwind.
#[derive(Debug)]
pub struct WaitGuard {
    group: WaitGroup,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.group.done();
    }
}
