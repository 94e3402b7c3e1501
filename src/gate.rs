//! One-shot readiness signal between the frame pump and `start()`.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

/// Outcome of waiting on a [`ReadinessGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The signal fired.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
    /// The signal was dropped without firing.
    Abandoned,
}

/// Firing side, owned by the frame pump.
#[derive(Debug)]
pub struct ReadySignal {
    tx: Option<SyncSender<()>>,
}

/// Waiting side, consumed by a single wait.
#[derive(Debug)]
pub struct ReadinessGate {
    rx: Receiver<()>,
}

/// Create a connected signal/gate pair.
pub fn readiness_gate() -> (ReadySignal, ReadinessGate) {
    let (tx, rx) = mpsc::sync_channel(1);
    (ReadySignal { tx: Some(tx) }, ReadinessGate { rx })
}

impl ReadySignal {
    /// Fire the signal. Returns `true` only on the first call.
    pub fn fire(&mut self) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // The gate may already be gone after a startup timeout.
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Whether the signal has fired.
    pub const fn is_fired(&self) -> bool {
        self.tx.is_none()
    }
}

impl ReadinessGate {
    /// Block until the signal fires, is abandoned, or `timeout` elapses.
    pub fn wait(self, timeout: Duration) -> WaitOutcome {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => WaitOutcome::Ready,
            Err(RecvTimeoutError::Timeout) => WaitOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => WaitOutcome::Abandoned,
        }
    }
}
