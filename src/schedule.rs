//! Schedule definitions and the pure due/coalesce computation used by the
//! dispatch loop.
//!
//! A [`ScheduleSpec`] is the serializable definition stored on a cron job row.
//! [`ScheduleSpec::compile`] validates it once into a [`Schedule`], after which
//! [`compute_schedule_outcome`] is total.

use chrono::DateTime;
use chrono_tz::Tz;
use croner::Cron;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on cron occurrences walked in one call. Anything beyond is
/// picked up by the following tick.
const MAX_COALESCE_WALK: i64 = 100_000;

/// Used as the next run when a cron expression has no future occurrence.
const NO_OCCURRENCE_RETRY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("interval must be positive, got every_ms={0}")]
    NonPositiveInterval(i64),
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
    #[error("unrecognized schedule '{0}'")]
    Unrecognized(String),
}

/// How missed occurrences are handled. Only coalescing is defined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpPolicy {
    #[default]
    Coalesce,
}

fn default_tz() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    Interval {
        every_ms: i64,
        #[serde(default)]
        catch_up: CatchUpPolicy,
    },
    Cron {
        expr: String,
        #[serde(default = "default_tz")]
        tz: String,
        #[serde(default)]
        catch_up: CatchUpPolicy,
    },
}

impl ScheduleSpec {
    pub fn interval(every_ms: i64) -> Result<Self, ScheduleError> {
        let spec = ScheduleSpec::Interval {
            every_ms,
            catch_up: CatchUpPolicy::Coalesce,
        };
        spec.compile()?;
        Ok(spec)
    }

    pub fn cron(expr: &str, tz: &str) -> Result<Self, ScheduleError> {
        let spec = ScheduleSpec::Cron {
            expr: expr.trim().to_string(),
            tz: tz.trim().to_string(),
            catch_up: CatchUpPolicy::Coalesce,
        };
        spec.compile()?;
        Ok(spec)
    }

    /// Validate the definition into a computable schedule.
    pub fn compile(&self) -> Result<Schedule, ScheduleError> {
        match self {
            ScheduleSpec::Interval { every_ms, .. } => {
                if *every_ms <= 0 {
                    return Err(ScheduleError::NonPositiveInterval(*every_ms));
                }
                Ok(Schedule::Interval {
                    every_ms: *every_ms,
                })
            }
            ScheduleSpec::Cron { expr, tz, .. } => {
                let cron = expr
                    .parse::<Cron>()
                    .map_err(|e| ScheduleError::InvalidCron {
                        expr: expr.clone(),
                        reason: e.to_string(),
                    })?;
                let tz = tz
                    .parse::<Tz>()
                    .map_err(|_| ScheduleError::UnknownTimezone(tz.clone()))?;
                Ok(Schedule::Cron {
                    cron: Box::new(cron),
                    tz,
                    expr: expr.clone(),
                })
            }
        }
    }

    pub fn catch_up(&self) -> CatchUpPolicy {
        match self {
            ScheduleSpec::Interval { catch_up, .. } | ScheduleSpec::Cron { catch_up, .. } => {
                *catch_up
            }
        }
    }
}

impl std::fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleSpec::Interval { every_ms, .. } => write!(f, "every {}ms", every_ms),
            ScheduleSpec::Cron { expr, tz, .. } => write!(f, "cron '{}' ({})", expr, tz),
        }
    }
}

/// A validated schedule.
pub enum Schedule {
    Interval { every_ms: i64 },
    Cron { cron: Box<Cron>, tz: Tz, expr: String },
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Interval { every_ms } => {
                f.debug_struct("Interval").field("every_ms", every_ms).finish()
            }
            Schedule::Cron { tz, expr, .. } => f
                .debug_struct("Cron")
                .field("expr", expr)
                .field("tz", &tz.name())
                .finish(),
        }
    }
}

impl Schedule {
    /// First occurrence strictly after `ms`.
    pub fn next_after(&self, ms: i64) -> Option<i64> {
        match self {
            Schedule::Interval { every_ms } => ms.checked_add(*every_ms),
            Schedule::Cron { cron, tz, .. } => {
                let start = DateTime::from_timestamp_millis(ms)?.with_timezone(tz);
                cron.find_next_occurrence(&start, false)
                    .ok()
                    .map(|t| t.timestamp_millis())
            }
        }
    }

    /// Like `next_after`, but a cron without future occurrences re-checks a day later.
    pub fn next_after_or_retry(&self, ms: i64) -> i64 {
        self.next_after(ms)
            .unwrap_or_else(|| ms.saturating_add(NO_OCCURRENCE_RETRY_MS))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleOutcome {
    pub due: bool,
    pub scheduled_for_ms: i64,
    pub next_run_at_ms: i64,
    pub coalesced_count: i64,
}

/// Decide whether a job is due at `now_ms` given the stored next-run time.
///
/// `scheduled_for_ms` is the latest missed occurrence rather than `now_ms`, so
/// repeated attempts for the same tick derive the same run key.
pub fn compute_schedule_outcome(
    schedule: &Schedule,
    now_ms: i64,
    last_next_run_at_ms: Option<i64>,
) -> ScheduleOutcome {
    let Some(last) = last_next_run_at_ms else {
        return ScheduleOutcome {
            due: true,
            scheduled_for_ms: now_ms,
            next_run_at_ms: schedule.next_after_or_retry(now_ms),
            coalesced_count: 0,
        };
    };

    if now_ms < last {
        return ScheduleOutcome {
            due: false,
            scheduled_for_ms: last,
            next_run_at_ms: last,
            coalesced_count: 0,
        };
    }

    match schedule {
        Schedule::Interval { every_ms } => {
            let elapsed = (now_ms - last) / every_ms;
            let scheduled_for_ms = last + elapsed * every_ms;
            ScheduleOutcome {
                due: true,
                scheduled_for_ms,
                next_run_at_ms: scheduled_for_ms + every_ms,
                coalesced_count: elapsed,
            }
        }
        Schedule::Cron { .. } => {
            let mut scheduled_for_ms = last;
            let mut coalesced_count = 0;
            let next_run_at_ms = loop {
                match schedule.next_after(scheduled_for_ms) {
                    Some(t) if t <= now_ms && coalesced_count < MAX_COALESCE_WALK => {
                        scheduled_for_ms = t;
                        coalesced_count += 1;
                    }
                    Some(t) => break t,
                    None => break scheduled_for_ms.saturating_add(NO_OCCURRENCE_RETRY_MS),
                }
            };
            ScheduleOutcome {
                due: true,
                scheduled_for_ms,
                next_run_at_ms,
                coalesced_count,
            }
        }
    }
}
