//! Exponential backoff for transient provisioning and boot failures.
//!
//! Each VM that fails transiently gets a [`RetryContext`] counting its
//! attempts. Contexts live only in memory: they are dropped when the VM
//! comes up, when attempts are exhausted, or after `context_ttl` without
//! activity.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use vmfleet_core::{ErrorCode, RetryConfig, VmStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub context_ttl: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.multiplier,
            context_ttl: config.context_ttl,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// `min(initial × multiplier^(attempt−1), max)`, attempts counted from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (initial_ms * self.multiplier.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Whether a failure qualifies for an automatic re-drive.
///
/// Only retryable codes raised while the VM was still coming up are
/// retried. A VM that was already serving sessions stays in `ERROR`.
pub fn is_retry_eligible(code: &ErrorCode, prior: VmStatus) -> bool {
    code.is_retryable() && prior.is_starting()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryContext {
    pub vm_id: String,
    /// Failures recorded so far, starting at 1.
    pub attempt: u32,
    pub last_error_code: ErrorCode,
    pub last_error_message: String,
    pub updated_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-drive after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// `attempts` re-drives already failed; the context has been dropped.
    Exhausted { attempts: u32 },
}

/// Keyed store of retry contexts with TTL eviction.
pub struct RetryPipeline {
    policy: RetryPolicy,
    contexts: Mutex<HashMap<String, RetryContext>>,
}

impl RetryPipeline {
    /// Create a pipeline with no contexts.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Count a transient failure against `vm_id` and decide what happens next.
    pub async fn record_failure(&self, vm_id: &str, code: &ErrorCode, message: &str) -> RetryDecision {
        let now = Instant::now();
        let mut contexts = self.contexts.lock().await;
        // The failing VM's own context is live by definition, however long
        // its last backoff and bring-up step took.
        if let Some(ctx) = contexts.get_mut(vm_id) {
            ctx.updated_at = now;
        }
        self.evict_locked(&mut contexts, now);

        let ctx = contexts.entry(vm_id.to_string()).or_insert_with(|| RetryContext {
            vm_id: vm_id.to_string(),
            attempt: 0,
            last_error_code: code.clone(),
            last_error_message: String::new(),
            updated_at: now,
        });
        ctx.attempt += 1;
        ctx.last_error_code = code.clone();
        ctx.last_error_message = message.to_string();
        ctx.updated_at = now;
        let attempt = ctx.attempt;

        if attempt > self.policy.max_retries {
            contexts.remove(vm_id);
            debug!(%vm_id, attempt, "retries exhausted");
            return RetryDecision::Exhausted {
                attempts: self.policy.max_retries,
            };
        }

        let delay = self.policy.delay_for(attempt);
        debug!(%vm_id, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
        RetryDecision::Retry { attempt, delay }
    }

    /// Drop the context for `vm_id`, e.g. once it reached `READY`.
    pub async fn clear(&self, vm_id: &str) -> bool {
        self.contexts.lock().await.remove(vm_id).is_some()
    }

    /// Live context for `vm_id`, after evicting expired ones.
    pub async fn context(&self, vm_id: &str) -> Option<RetryContext> {
        let mut contexts = self.contexts.lock().await;
        self.evict_locked(&mut contexts, Instant::now());
        contexts.get(vm_id).cloned()
    }

    /// Remove contexts idle for longer than the TTL. Returns how many went.
    pub async fn evict_expired(&self) -> usize {
        let mut contexts = self.contexts.lock().await;
        self.evict_locked(&mut contexts, Instant::now())
    }

    pub async fn len(&self) -> usize {
        self.contexts.lock().await.len()
    }

    fn evict_locked(&self, contexts: &mut HashMap<String, RetryContext>, now: Instant) -> usize {
        let before = contexts.len();
        let ttl = self.policy.context_ttl;
        contexts.retain(|_, ctx| now.duration_since(ctx.updated_at) < ttl);
        before - contexts.len()
    }
}
