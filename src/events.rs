//! Lifecycle events delivered to the upper layer, and the "delivered once"
//! guards that back them: a terminated dialog fires exactly one
//! `DialogTerminated`, never more, regardless of how many paths reach
//! termination concurrently.

use crate::dialog::DialogId;
use crate::transaction::key::TransactionKey;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone)]
pub enum DialogErrorReason {
    EarlyStateTimeout,
    AckNotSentTimeout,
    AckNotReceivedTimeout,
    ReinviteTimeout,
}

#[derive(Debug, Clone)]
pub enum IoExceptionReason {
    ConnectionError,
    KeepAliveTimeout,
    Other(String),
}

#[derive(Debug, Clone)]
pub enum Event {
    DialogTerminated(DialogId),
    TransactionTerminated(TransactionKey),
    IoException {
        reason: IoExceptionReason,
        local: Option<String>,
        remote: Option<String>,
        transport: String,
    },
    DialogError(DialogId, DialogErrorReason),
}

pub type EventSender = UnboundedSender<Event>;

/// Compare-and-swap guard so cleanup paths and timer paths can race to
/// deliver a terminal event without double-firing it.
#[derive(Debug, Default)]
pub struct DeliverOnce(AtomicBool);

impl DeliverOnce {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns true the first time it is called; false on every subsequent
    /// call, regardless of which thread calls it.
    pub fn fire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn already_fired(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_exactly_once() {
        let guard = DeliverOnce::new();
        assert!(guard.fire());
        assert!(!guard.fire());
        assert!(!guard.fire());
        assert!(guard.already_fired());
    }
}
