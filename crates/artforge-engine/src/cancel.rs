use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use artforge_contracts::GenerationError;

/// Shared stop signal with an optional wall-clock deadline. Clones observe
/// the same signal; a pending [`CancelToken::wait`] wakes up as soon as
/// [`CancelToken::cancel`] is called.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    reason: Mutex<Option<String>>,
    signal: Condvar,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                reason: Mutex::new(None),
                signal: Condvar::new(),
                deadline: Some(deadline),
            }),
        }
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = match self.inner.reason.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none() {
            *guard = Some(reason.into());
        }
        self.inner.signal.notify_all();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation().is_some()
    }

    pub fn check(&self) -> Result<(), GenerationError> {
        match self.cancellation() {
            Some(reason) => Err(GenerationError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Blocks for `duration` unless cancelled first or the deadline falls
    /// inside the wait.
    pub fn wait(&self, duration: Duration) -> Result<(), GenerationError> {
        let wake_at = Instant::now().checked_add(duration);
        let mut guard = match self.inner.reason.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(reason) = guard.as_ref() {
                return Err(GenerationError::Cancelled(reason.clone()));
            }
            let now = Instant::now();
            if self.deadline_passed(now) {
                return Err(GenerationError::Cancelled(deadline_reason()));
            }
            if wake_at.is_some_and(|wake_at| now >= wake_at) {
                return Ok(());
            }
            let limit = match (self.inner.deadline, wake_at) {
                (Some(deadline), Some(wake_at)) => Some(deadline.min(wake_at)),
                (deadline, wake_at) => deadline.or(wake_at),
            };
            guard = match limit {
                Some(limit) => match self.inner.signal.wait_timeout(guard, limit - now) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                },
                None => match self.inner.signal.wait(guard) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                },
            };
        }
    }

    fn cancellation(&self) -> Option<String> {
        let guard = match self.inner.reason.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(reason) = guard.as_ref() {
            return Some(reason.clone());
        }
        if self.deadline_passed(Instant::now()) {
            return Some(deadline_reason());
        }
        None
    }

    fn deadline_passed(&self, now: Instant) -> bool {
        self.inner
            .deadline
            .map(|deadline| now >= deadline)
            .unwrap_or(false)
    }
}

fn deadline_reason() -> String {
    "deadline exceeded".to_string()
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use artforge_contracts::GenerationError;

    use super::CancelToken;

    #[test]
    fn wait_returns_after_duration_when_not_cancelled() {
        let token = CancelToken::new();
        let started = Instant::now();
        token.wait(Duration::from_millis(20)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_interrupts_pending_wait() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.cancel("shutdown");
        });
        let started = Instant::now();
        let err = token.wait(Duration::from_secs(30)).unwrap_err();
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(err, GenerationError::Cancelled("shutdown".to_string()));
    }

    #[test]
    fn deadline_cuts_wait_short() {
        let token = CancelToken::with_timeout(Duration::from_millis(20));
        let err = token.wait(Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, GenerationError::Cancelled(reason) if reason.contains("deadline")));
        assert!(token.check().is_err());
    }

    #[test]
    fn unrepresentable_timeout_means_no_deadline() {
        let token = CancelToken::with_timeout(Duration::from_secs(u64::MAX / 2));
        assert_eq!(token.deadline(), None);
        assert!(token.check().is_ok());
    }

    #[test]
    fn huge_wait_still_wakes_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel("stop");
        });
        let err = token.wait(Duration::MAX).unwrap_err();
        handle.join().unwrap();
        assert_eq!(err, GenerationError::Cancelled("stop".to_string()));
    }

    #[test]
    fn first_cancel_reason_wins() {
        let token = CancelToken::new();
        token.cancel("first");
        token.cancel("second");
        assert_eq!(
            token.check(),
            Err(GenerationError::Cancelled("first".to_string()))
        );
    }
}
