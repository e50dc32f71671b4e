//! Cross-task state shared between the harness loops.
//!
//! Everything here is lock-free: single-word atomics, plus a `Notify` so
//! waiters can park instead of polling.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use tokio::sync::Notify;

/// Completed-response counter for one connection.
///
/// The consumer increments; the monitor drains the window with [`take`].
/// A running total is kept alongside and never reset.
///
/// [`take`]: SharedCounter::take
#[derive(Debug, Default)]
pub struct SharedCounter {
    window: AtomicU64,
    total: AtomicU64,
}

impl SharedCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed response.
    pub fn increment(&self) {
        self.window.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset the window in one step.
    pub fn take(&self) -> u64 {
        self.window.swap(0, Ordering::AcqRel)
    }

    /// Responses counted since the last [`take`](SharedCounter::take).
    #[cfg(test)]
    pub fn peek(&self) -> u64 {
        self.window.load(Ordering::Relaxed)
    }

    /// Responses counted since creation.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// One-shot boolean that can be awaited.
///
/// Setting is idempotent. [`Latch::set`] reports whether the call performed
/// the transition, so concurrent failures agree on a single winner.
#[derive(Debug, Default)]
pub struct Latch {
    set: AtomicBool,
    notify: Notify,
}

/// Terminal-failure signal shared by every loop of a harness.
pub type DoneFlag = Latch;

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Set the latch and wake all waiters. Returns `true` only for the call
    /// that flipped it.
    pub fn set(&self) -> bool {
        let won = self
            .set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.notify.notify_waiters();
        }
        won
    }

    /// Park until the latch is set.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking, otherwise a set() in between is lost.
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Harness lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HarnessState {
    Starting = 0,
    Running = 1,
    Draining = 2,
    Idle = 3,
}

impl HarnessState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HarnessState::Starting,
            1 => HarnessState::Running,
            2 => HarnessState::Draining,
            _ => HarnessState::Idle,
        }
    }
}

/// Atomic cell holding a [`HarnessState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(HarnessState::Starting as u8))
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> HarnessState {
        HarnessState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. Fails if the current state is not `from`.
    pub fn advance(&self, from: HarnessState, to: HarnessState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
