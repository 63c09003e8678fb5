use std::time::Duration;

use crate::config::RetryConfig;
use crate::traits::{FailureKind, RunFailure, WorkItem};
use crate::types::{EscalationType, Severity};

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Put the item back to `ready` after `delay_ms`. `attempt` is 1-based.
    Retry { attempt: i32, delay_ms: u64 },
    Escalate {
        escalation_type: EscalationType,
        severity: Severity,
        reason: String,
    },
    Fail { reason: String },
}

#[derive(Debug, Clone)]
pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn backoff_delay_ms(&self, attempt: i32) -> u64 {
        let exp = attempt.saturating_sub(1).max(0);
        let raw = self.config.base_delay_ms as f64 * self.config.multiplier.powi(exp);
        if !raw.is_finite() || raw >= self.config.max_delay_ms as f64 {
            self.config.max_delay_ms
        } else {
            raw as u64
        }
    }

    pub fn backoff_delay(&self, attempt: i32) -> Duration {
        Duration::from_millis(self.backoff_delay_ms(attempt))
    }

    pub fn decide(&self, item: &WorkItem, failure: &RunFailure) -> RetryDecision {
        let escalate = |escalation_type, severity| RetryDecision::Escalate {
            escalation_type,
            severity,
            reason: failure.message.clone(),
        };
        match failure.kind {
            FailureKind::Transient | FailureKind::Timeout => {
                if item.retry_count < item.max_retries {
                    let attempt = item.retry_count + 1;
                    RetryDecision::Retry {
                        attempt,
                        delay_ms: self.backoff_delay_ms(attempt),
                    }
                } else {
                    RetryDecision::Escalate {
                        escalation_type: EscalationType::Stuck,
                        severity: Severity::High,
                        reason: format!(
                            "retries exhausted after {} attempts: {}",
                            item.retry_count, failure.message
                        ),
                    }
                }
            }
            FailureKind::Credential => escalate(EscalationType::Credential, Severity::High),
            FailureKind::Validation => escalate(EscalationType::ValidationFailed, Severity::Medium),
            FailureKind::Ambiguous => escalate(EscalationType::Ambiguous, Severity::Medium),
            FailureKind::Risk => escalate(EscalationType::Risk, Severity::Critical),
            FailureKind::Permanent => RetryDecision::Fail {
                reason: failure.message.clone(),
            },
        }
    }
}
