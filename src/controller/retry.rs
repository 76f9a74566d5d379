//! Per-resource retry bookkeeping
//!
//! A failed resource is retried on later passes after an exponential
//! backoff. After `max_failures` consecutive failures, or a single failure
//! that cannot succeed on retry, it is parked until its desired spec changes
//! or a drift resync rebuilds the registry.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::ingress::{DesiredSpec, ManagedResource, ResourceId};

/// Calculate exponential backoff delay
///
/// # Arguments
/// * `attempt` - Zero-based retry attempt
/// * `base_delay_secs` - Base delay in seconds (default: 15)
/// * `max_delay_secs` - Maximum delay cap in seconds (default: 300 = 5 minutes)
pub fn calculate_backoff(
    attempt: u32,
    base_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
) -> Duration {
    let base = base_delay_secs.unwrap_or(15);
    let max = max_delay_secs.unwrap_or(300);

    // Exponential: base * 2^attempt, capped at max
    let delay_secs = base.saturating_mul(2_u64.saturating_pow(attempt.min(5)));
    Duration::from_secs(delay_secs.min(max))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_failures: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 15,
            max_delay_secs: 300,
            max_failures: 10,
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, failures: u32) -> Duration {
        calculate_backoff(
            failures.saturating_sub(1),
            Some(self.base_delay_secs),
            Some(self.max_delay_secs),
        )
    }
}

#[derive(Clone, Debug)]
struct RetryState {
    failures: u32,
    next_attempt: Instant,
    /// Desired spec the failures were recorded against
    desired: Option<DesiredSpec>,
    last_error: String,
    /// Set by a failure that retrying cannot fix
    permanent: bool,
}

impl RetryState {
    fn is_parked(&self, max_failures: u32) -> bool {
        self.permanent || self.failures >= max_failures
    }
}

/// What the convergence pass should do with one resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Run,
    Backoff { remaining: Duration },
    Parked { failures: u32 },
}

/// Outcome of recording a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { failures: u32, delay: Duration },
    /// The resource reached the failure limit or cannot succeed on retry
    Parked { failures: u32 },
}

#[derive(Debug, Default)]
pub struct RetryBook {
    entries: BTreeMap<ResourceId, RetryState>,
}

impl RetryBook {
    pub fn check(&mut self, resource: &ManagedResource, policy: &RetryPolicy, now: Instant) -> Dispatch {
        let Some(state) = self.entries.get(&resource.id) else {
            return Dispatch::Run;
        };

        // A changed spec deserves a fresh attempt
        if state.desired != resource.desired {
            self.entries.remove(&resource.id);
            return Dispatch::Run;
        }
        if state.is_parked(policy.max_failures) {
            return Dispatch::Parked {
                failures: state.failures,
            };
        }
        if now < state.next_attempt {
            return Dispatch::Backoff {
                remaining: state.next_attempt - now,
            };
        }
        Dispatch::Run
    }

    /// A non-retriable failure parks the resource at once
    pub fn record_failure(
        &mut self,
        resource: &ManagedResource,
        error: String,
        retriable: bool,
        policy: &RetryPolicy,
        now: Instant,
    ) -> FailureOutcome {
        let state = self
            .entries
            .entry(resource.id.clone())
            .or_insert_with(|| RetryState {
                failures: 0,
                next_attempt: now,
                desired: resource.desired.clone(),
                last_error: String::new(),
                permanent: false,
            });
        state.failures += 1;
        state.desired = resource.desired.clone();
        state.last_error = error;
        state.permanent |= !retriable;

        let delay = policy.delay_after(state.failures);
        state.next_attempt = now + delay;

        if state.is_parked(policy.max_failures) {
            FailureOutcome::Parked {
                failures: state.failures,
            }
        } else {
            FailureOutcome::Retrying {
                failures: state.failures,
                delay,
            }
        }
    }

    pub fn record_success(&mut self, id: &ResourceId) {
        self.entries.remove(id);
    }

    pub fn failures(&self, id: &ResourceId) -> u32 {
        self.entries.get(id).map_or(0, |s| s.failures)
    }

    pub fn last_error(&self, id: &ResourceId) -> Option<&str> {
        self.entries.get(id).map(|s| s.last_error.as_str())
    }

    /// Resources that reached the failure limit
    pub fn parked(&self, max_failures: u32) -> usize {
        self.entries
            .values()
            .filter(|s| s.is_parked(max_failures))
            .count()
    }

    /// Drop bookkeeping for resources the controller no longer tracks
    pub fn retain(&mut self, mut keep: impl FnMut(&ResourceId) -> bool) {
        self.entries.retain(|id, _| keep(id));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> ManagedResource {
        ManagedResource::new(ResourceId::new("default", "web"))
    }

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, None, None), Duration::from_secs(15));
        assert_eq!(calculate_backoff(1, None, None), Duration::from_secs(30));
        assert_eq!(calculate_backoff(2, None, None), Duration::from_secs(60));
        assert_eq!(calculate_backoff(3, None, None), Duration::from_secs(120));
        assert_eq!(calculate_backoff(4, None, None), Duration::from_secs(240));
        // capped at 300 s (5 min)
        assert_eq!(calculate_backoff(5, None, None), Duration::from_secs(300));
        assert_eq!(calculate_backoff(50, None, None), Duration::from_secs(300));
    }

    #[test]
    fn test_failure_then_backoff_then_run() {
        let policy = RetryPolicy::default();
        let mut book = RetryBook::default();
        let resource = resource();
        let now = Instant::now();

        assert_eq!(book.check(&resource, &policy, now), Dispatch::Run);
        let outcome = book.record_failure(&resource, "boom".into(), true, &policy, now);
        assert_eq!(
            outcome,
            FailureOutcome::Retrying {
                failures: 1,
                delay: Duration::from_secs(15)
            }
        );
        assert!(matches!(
            book.check(&resource, &policy, now + Duration::from_secs(5)),
            Dispatch::Backoff { .. }
        ));
        assert_eq!(
            book.check(&resource, &policy, now + Duration::from_secs(15)),
            Dispatch::Run
        );
        assert_eq!(book.last_error(&resource.id), Some("boom"));

        book.record_success(&resource.id);
        assert_eq!(book.failures(&resource.id), 0);
    }

    #[test]
    fn test_parks_after_limit_until_spec_changes() {
        let policy = RetryPolicy {
            max_failures: 2,
            ..RetryPolicy::default()
        };
        let mut book = RetryBook::default();
        let resource = resource();
        let now = Instant::now();

        book.record_failure(&resource, "one".into(), true, &policy, now);
        let outcome = book.record_failure(&resource, "two".into(), true, &policy, now);
        assert_eq!(outcome, FailureOutcome::Parked { failures: 2 });

        let much_later = now + Duration::from_secs(3600);
        assert_eq!(
            book.check(&resource, &policy, much_later),
            Dispatch::Parked { failures: 2 }
        );

        let mut changed = resource.clone();
        changed.desired = Some(crate::controller::testing::desired_spec("prod-abc"));
        assert_eq!(book.check(&changed, &policy, now), Dispatch::Run);
        assert_eq!(book.failures(&resource.id), 0);
    }

    #[test]
    fn test_permanent_failure_parks_immediately() {
        let policy = RetryPolicy::default();
        let mut book = RetryBook::default();
        let resource = resource();
        let now = Instant::now();

        let outcome = book.record_failure(&resource, "bad certificate".into(), false, &policy, now);
        assert_eq!(outcome, FailureOutcome::Parked { failures: 1 });
        assert_eq!(book.parked(policy.max_failures), 1);
        assert_eq!(
            book.check(&resource, &policy, now + Duration::from_secs(3600)),
            Dispatch::Parked { failures: 1 }
        );
    }
}
