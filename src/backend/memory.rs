//! In-process firewall engine
//!
//! Keeps an ordered rule chain in memory with the same placement semantics
//! as the real engines (Drop rules inserted at the top, Accept rules
//! appended). Used for dry-run deployments and as the test double for the
//! reconciler: clones share state, every effective change is journaled, and
//! faults can be injected per call.

use super::{BackendError, FirewallBackend};
use crate::core::rule::{RuleDescriptor, Strategy};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Journal entry for an effective backend change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Applied(RuleDescriptor),
    Removed(RuleDescriptor),
    Persisted,
}

type Matcher = Box<dyn Fn(&RuleDescriptor) -> bool + Send + Sync>;

struct Fault {
    matcher: Matcher,
    error: BackendError,
}

#[derive(Default)]
struct MemoryState {
    chain: Vec<RuleDescriptor>,
    events: Vec<BackendEvent>,
    apply_faults: Vec<Fault>,
    remove_faults: Vec<Fault>,
    busy_remaining: usize,
    unavailable: bool,
    delay: Option<Duration>,
    calls: usize,
}

/// Firewall backend held entirely in memory
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves the chain consistent
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Enforced rules in chain order
    pub fn active(&self) -> Vec<RuleDescriptor> {
        self.lock().chain.clone()
    }

    /// Journal of effective changes, oldest first
    pub fn events(&self) -> Vec<BackendEvent> {
        self.lock().events.clone()
    }

    /// Number of backend calls received, including failed ones
    pub fn call_count(&self) -> usize {
        self.lock().calls
    }

    /// Makes `apply_rule` fail with `error` for rules matching `matcher`.
    pub fn fail_apply_where(
        &self,
        matcher: impl Fn(&RuleDescriptor) -> bool + Send + Sync + 'static,
        error: BackendError,
    ) {
        self.lock().apply_faults.push(Fault {
            matcher: Box::new(matcher),
            error,
        });
    }

    /// Makes `remove_rule` fail with `error` for rules matching `matcher`.
    pub fn fail_remove_where(
        &self,
        matcher: impl Fn(&RuleDescriptor) -> bool + Send + Sync + 'static,
        error: BackendError,
    ) {
        self.lock().remove_faults.push(Fault {
            matcher: Box::new(matcher),
            error,
        });
    }

    /// Fails the next `calls` calls with [`BackendError::Busy`].
    pub fn busy_for(&self, calls: usize) {
        self.lock().busy_remaining = calls;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Delays every call, to exercise timeouts.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.apply_faults.clear();
        state.remove_faults.clear();
        state.busy_remaining = 0;
        state.unavailable = false;
        state.delay = None;
    }

    /// Removes a rule behind the reconciler's back, to simulate drift.
    pub fn drop_silently(&self, id: uuid::Uuid) {
        self.lock().chain.retain(|r| r.id != id);
    }

    /// Inserts a rule behind the reconciler's back, to simulate drift.
    pub fn inject(&self, rule: RuleDescriptor) {
        self.lock().chain.push(rule);
    }

    /// Counts the call and applies delay and global faults.
    async fn enter(&self) -> Result<(), BackendError> {
        let delay = {
            let mut state = self.lock();
            state.calls += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.unavailable {
            return Err(BackendError::Unavailable(
                "memory backend marked unavailable".to_string(),
            ));
        }
        if state.busy_remaining > 0 {
            state.busy_remaining -= 1;
            return Err(BackendError::Busy("resource busy".to_string()));
        }
        Ok(())
    }
}

fn injected(faults: &[Fault], rule: &RuleDescriptor) -> Option<BackendError> {
    faults
        .iter()
        .find(|f| (f.matcher)(rule))
        .map(|f| f.error.clone())
}

#[async_trait]
impl FirewallBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn apply_rule(&self, rule: &RuleDescriptor) -> Result<(), BackendError> {
        self.enter().await?;
        let mut state = self.lock();
        if let Some(err) = injected(&state.apply_faults, rule) {
            return Err(err);
        }

        if let Some(existing) = state.chain.iter().position(|r| r.id == rule.id) {
            if state.chain[existing] == *rule {
                return Ok(());
            }
            // Same id with a different tuple is stale; replace it
            state.chain.remove(existing);
        }

        match rule.strategy {
            Strategy::Drop => state.chain.insert(0, rule.clone()),
            Strategy::Accept => state.chain.push(rule.clone()),
        }
        state.events.push(BackendEvent::Applied(rule.clone()));
        debug!("memory: applied {rule}");
        Ok(())
    }

    async fn remove_rule(&self, rule: &RuleDescriptor) -> Result<(), BackendError> {
        self.enter().await?;
        let mut state = self.lock();
        if let Some(err) = injected(&state.remove_faults, rule) {
            return Err(err);
        }

        let before = state.chain.len();
        state.chain.retain(|r| r.id != rule.id);
        if state.chain.len() != before {
            state.events.push(BackendEvent::Removed(rule.clone()));
            debug!("memory: removed {rule}");
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<RuleDescriptor>, BackendError> {
        self.enter().await?;
        Ok(self.lock().chain.clone())
    }

    async fn persist(&self) -> Result<(), BackendError> {
        self.enter().await?;
        self.lock().events.push(BackendEvent::Persisted);
        Ok(())
    }
}
