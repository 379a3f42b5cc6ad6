//! A minimal channel-backed stand-in for a future, used by the batch layer
//! so callers can wait on a load or save without pulling in an async
//! runtime (spec §9: "native async, threadpool+promises, or channels" are
//! all acceptable; this crate's dependency graph has no async executor, so
//! threads + channels is the idiomatic fit here).

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

/// The receiving half of a one-shot result. Cloning a [`PendingResult`] is
/// not supported; multiple waiters are modeled with [`PendingResult::fanout`].
pub struct PendingResult<T> {
    rx: Receiver<T>,
}

impl<T> PendingResult<T> {
    pub fn wait(self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_wait(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// The sending half, held by whichever worker produces the value.
pub struct PendingCompleter<T> {
    tx: Sender<T>,
}

impl<T> PendingCompleter<T> {
    pub fn complete(self, value: T) {
        // A dropped receiver (caller gave up waiting) is not an error here.
        let _ = self.tx.send(value);
    }
}

/// Create a linked completer/result pair for a single value.
pub fn pending<T>() -> (PendingCompleter<T>, PendingResult<T>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (PendingCompleter { tx }, PendingResult { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_then_wait_round_trips() {
        let (completer, result) = pending::<u32>();
        completer.complete(42);
        assert_eq!(result.wait(), Some(42));
    }

    #[test]
    fn dropped_completer_yields_none() {
        let (completer, result) = pending::<u32>();
        drop(completer);
        assert_eq!(result.wait(), None);
    }

    #[test]
    fn wait_timeout_elapses_without_completion() {
        let (_completer, result) = pending::<u32>();
        assert!(result.wait_timeout(Duration::from_millis(10)).is_err());
    }
}
