//! Cooperative cancellation between pipeline stages

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::DeployError;
use super::result::DeploymentStage;

/// Shared cancellation flag
///
/// Clones observe the same flag. Cancelling never interrupts a statement in
/// flight; the pipeline stops at its next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can be reused for another run
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Cancellation and deadline checked before each stage
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint {
    token: CancellationToken,
    started: Instant,
    timeout: Duration,
}

impl Checkpoint {
    pub(crate) fn new(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            started: Instant::now(),
            timeout,
        }
    }

    pub(crate) fn check(&self, stage: DeploymentStage) -> Result<(), DeployError> {
        if self.token.is_cancelled() {
            return Err(DeployError::Cancelled { stage });
        }
        let elapsed = self.started.elapsed();
        if elapsed > self.timeout {
            return Err(DeployError::TimedOut {
                stage,
                timeout: self.timeout,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_the_flag() {
        let token = CancellationToken::new();
        let observer = token.clone();
        token.cancel();
        assert!(observer.is_cancelled());
        observer.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_checkpoint_reports_cancellation_before_deadline() {
        let token = CancellationToken::new();
        let checkpoint = Checkpoint::new(token.clone(), Duration::from_secs(60));
        assert!(checkpoint.check(DeploymentStage::Apply).is_ok());

        token.cancel();
        assert!(matches!(
            checkpoint.check(DeploymentStage::Apply),
            Err(DeployError::Cancelled {
                stage: DeploymentStage::Apply
            })
        ));
    }

    #[test]
    fn test_zero_timeout_expires() {
        let checkpoint = Checkpoint::new(CancellationToken::new(), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(
            checkpoint.check(DeploymentStage::Backup),
            Err(DeployError::TimedOut { .. })
        ));
    }
}
