use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const ACTIVE: u8 = 0;
const CANCELLED: u8 = 1;
const TIMED_OUT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    // Returns `false` when the token was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let value = match reason {
            CancelReason::Cancelled => CANCELLED,
            CancelReason::TimedOut => TIMED_OUT,
        };
        self.0
            .compare_exchange(ACTIVE, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) != ACTIVE
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.0.load(Ordering::Acquire) {
            CANCELLED => Some(CancelReason::Cancelled),
            TIMED_OUT => Some(CancelReason::TimedOut),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CancelReason, CancelToken};

    #[test]
    fn first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel(CancelReason::TimedOut));
        assert!(!token.cancel(CancelReason::Cancelled));

        let clone = token.clone();
        assert!(clone.is_cancelled());
        assert_eq!(clone.reason(), Some(CancelReason::TimedOut));
    }
}
