use std::time::Duration;
use tracing::{info, warn};

use crate::error::CameraError;
use crate::Reconnect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Pause before each reconnect.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff: Duration::from_secs(1) }
    }
}

/// Owns a camera handle and replays failed operations with escalating
/// recovery.
///
/// Before attempt 2 the handle is closed and reopened. Before attempt 3 and
/// later the transport is also hard reset between close and reopen.
pub struct RetryingSession<B: Reconnect> {
    backend: B,
    policy: RetryPolicy,
}

impl<B: Reconnect> RetryingSession<B> {
    pub fn new(backend: B, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn execute<T, F>(&mut self, mut op: F) -> Result<T, CameraError>
    where
        F: FnMut(&mut B) -> Result<T, CameraError>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match op(&mut self.backend) {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !err.is_transient() {
                return Err(err);
            }
            warn!("camera attempt {}/{} failed: {}", attempt, max_attempts, err);
            if attempt >= max_attempts {
                return Err(CameraError::Device { attempts: attempt, source: Box::new(err) });
            }
            attempt += 1;
            self.escalate(attempt);
        }
    }

    pub fn close(&mut self) {
        self.backend.close();
    }

    fn escalate(&mut self, next_attempt: u32) {
        if !self.policy.backoff.is_zero() {
            std::thread::sleep(self.policy.backoff);
        }
        self.backend.close();
        if next_attempt >= 3 {
            info!("camera: resetting transport before attempt {}", next_attempt);
            if let Err(e) = self.backend.hard_reset() {
                warn!("camera transport reset failed: {}", e);
            }
        }
        if let Err(e) = self.backend.reopen() {
            warn!("camera reopen failed: {}", e);
        }
    }
}

impl<B: Reconnect> Drop for RetryingSession<B> {
    fn drop(&mut self) {
        self.backend.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Flaky {
        events: Vec<&'static str>,
        faults: u32,
        calls: u32,
        reopen_fails: bool,
    }

    impl Flaky {
        fn op(&mut self) -> Result<u32, CameraError> {
            self.events.push("op");
            self.calls += 1;
            if self.calls <= self.faults {
                return Err(CameraError::Transport(format!("fault on attempt {}", self.calls)));
            }
            Ok(self.calls)
        }
    }

    impl Reconnect for Flaky {
        fn close(&mut self) {
            self.events.push("close");
        }

        fn hard_reset(&mut self) -> Result<(), CameraError> {
            self.events.push("reset");
            Ok(())
        }

        fn reopen(&mut self) -> Result<(), CameraError> {
            self.events.push("reopen");
            if self.reopen_fails {
                return Err(CameraError::Transport("no device".into()));
            }
            Ok(())
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, backoff: Duration::ZERO }
    }

    #[test]
    fn first_try_success_touches_nothing() {
        let mut s = RetryingSession::new(Flaky::default(), policy());
        assert_eq!(s.execute(|b| b.op()).unwrap(), 1);
        assert_eq!(s.backend().events, vec!["op"]);
    }

    #[test]
    fn escalates_and_succeeds_on_third_attempt() {
        let mut s = RetryingSession::new(Flaky { faults: 2, ..Default::default() }, policy());
        assert_eq!(s.execute(|b| b.op()).unwrap(), 3);
        assert_eq!(
            s.backend().events,
            vec!["op", "close", "reopen", "op", "close", "reset", "reopen", "op"]
        );
    }

    #[test]
    fn exhaustion_wraps_last_cause() {
        let mut s = RetryingSession::new(Flaky { faults: u32::MAX, ..Default::default() }, policy());
        let err = s.execute(|b| b.op()).unwrap_err();
        match err {
            CameraError::Device { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "camera transport: fault on attempt 3");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(s.backend().events.iter().filter(|e| **e == "op").count(), 3);
        assert_eq!(s.backend().events.last(), Some(&"op"));
    }

    #[test]
    fn failed_reopen_does_not_stop_the_ladder() {
        let mut s = RetryingSession::new(
            Flaky { faults: 1, reopen_fails: true, ..Default::default() },
            policy(),
        );
        assert_eq!(s.execute(|b| b.op()).unwrap(), 2);
    }

    #[test]
    fn non_transient_errors_skip_the_ladder() {
        let mut s = RetryingSession::new(Flaky::default(), policy());
        let err = s
            .execute(|b| {
                b.events.push("op");
                Err::<(), _>(CameraError::InvalidArgument("step 7".into()))
            })
            .unwrap_err();
        assert!(matches!(err, CameraError::InvalidArgument(_)));
        assert_eq!(s.backend().events, vec!["op"]);
    }
}
