//! Cancelable one-shot timers, at most one outstanding per kind.
//!
//! A fired timer is delivered back to the controller as an
//! [`InternalEvent::Timer`] on the loopback channel, tagged with the
//! generation it was armed with. Re-arming or cancelling bumps the
//! generation, so a fire that raced a cancel is recognised as stale and
//! dropped instead of acting on outdated state.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::InternalEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Debounced autosave.
    Autosave,
    /// Client-driven finalize after an affirmative reply.
    FallbackFinalize,
    /// End of the negative-reply lockout window.
    LockoutExpiry,
}

/// Delivered on the loopback channel when a timer elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Debug)]
pub struct TimerSlot {
    kind: TimerKind,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    #[must_use]
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            generation: 0,
            handle: None,
        }
    }

    /// Arm the timer, replacing any outstanding one of this kind.
    pub fn arm(&mut self, delay: Duration, loopback: &mpsc::UnboundedSender<InternalEvent>) {
        self.cancel();
        let fired = TimerFired {
            kind: self.kind,
            generation: self.generation,
        };
        let tx = loopback.clone();
        let deadline = Instant::now() + delay;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // Receiver gone means the controller was dropped.
            let _ = tx.send(InternalEvent::Timer(fired));
        }));
    }

    /// Cancel the outstanding timer. Returns whether one was armed.
    pub fn cancel(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Accept a fire event if it belongs to the currently armed timer.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        if fired.kind != self.kind || fired.generation != self.generation || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        true
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// The controller's three timer slots.
#[derive(Debug)]
pub struct Timers {
    autosave: TimerSlot,
    fallback: TimerSlot,
    lockout: TimerSlot,
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

impl Timers {
    #[must_use]
    pub fn new() -> Self {
        Self {
            autosave: TimerSlot::new(TimerKind::Autosave),
            fallback: TimerSlot::new(TimerKind::FallbackFinalize),
            lockout: TimerSlot::new(TimerKind::LockoutExpiry),
        }
    }

    fn slot_mut(&mut self, kind: TimerKind) -> &mut TimerSlot {
        match kind {
            TimerKind::Autosave => &mut self.autosave,
            TimerKind::FallbackFinalize => &mut self.fallback,
            TimerKind::LockoutExpiry => &mut self.lockout,
        }
    }

    #[must_use]
    pub fn slot(&self, kind: TimerKind) -> &TimerSlot {
        match kind {
            TimerKind::Autosave => &self.autosave,
            TimerKind::FallbackFinalize => &self.fallback,
            TimerKind::LockoutExpiry => &self.lockout,
        }
    }

    pub fn arm(
        &mut self,
        kind: TimerKind,
        delay: Duration,
        loopback: &mpsc::UnboundedSender<InternalEvent>,
    ) {
        self.slot_mut(kind).arm(delay, loopback);
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.slot_mut(kind).cancel()
    }

    pub fn accept(&mut self, fired: TimerFired) -> bool {
        self.slot_mut(fired.kind).accept(fired)
    }

    pub fn cancel_all(&mut self) {
        self.autosave.cancel();
        self.fallback.cancel();
        self.lockout.cancel();
    }
}
