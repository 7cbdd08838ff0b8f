//! All-or-nothing execution of operation batches
//!
//! A batch holds the host lock for its whole run, so no other mutation can
//! interleave. Operations are applied one by one through the reconciler;
//! each success records its [`Applied`] outcome, whose inverse is the
//! compensation used on rollback. When an operation fails, or the batch is
//! cancelled between operations, every recorded outcome is compensated in
//! reverse order. Backend state is persisted once at the end.

use crate::core::error::{Error, Result};
use crate::core::reconciler::{Applied, Compensation, HostGuard, Operation, Reconciler};
use crate::core::rule::Strategy;
use crate::core::validate::{RuleDraft, validate};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Cooperative cancellation flag, checked between batch operations
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A successfully applied batch member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItem {
    /// Position in the submitted batch
    pub index: usize,
    pub applied: Applied,
}

/// Result of compensating one applied operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompensationOutcome {
    pub index: usize,
    pub description: String,
    pub rule_ids: Vec<Uuid>,
    /// `None` when the compensation succeeded
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct BatchFailure {
    /// Position of the failing operation in the submitted batch
    pub index: usize,
    pub error: Error,
    pub compensations: Vec<CompensationOutcome>,
}

#[derive(Debug)]
pub struct BatchReport {
    /// Applied operations in execution order; empty after a rollback
    pub applied: Vec<BatchItem>,
    pub failure: Option<BatchFailure>,
    /// Whether the backend state was saved after the run
    pub persisted: bool,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Collapses the report into the batch outcome.
    ///
    /// A rollback that left any rule uncertain yields
    /// [`Error::PartialFailure`]; a clean rollback yields the error of the
    /// failing operation.
    pub fn into_result(self) -> Result<Vec<BatchItem>> {
        let Some(failure) = self.failure else {
            return Ok(self.applied);
        };

        let mut uncertain: Vec<Uuid> = failure.error.uncertain_rules().to_vec();
        let failed: Vec<&CompensationOutcome> = failure
            .compensations
            .iter()
            .filter(|c| c.error.is_some())
            .collect();
        if failed.is_empty() && uncertain.is_empty() {
            return Err(failure.error);
        }
        for outcome in &failed {
            for id in &outcome.rule_ids {
                if !uncertain.contains(id) {
                    uncertain.push(*id);
                }
            }
        }
        Err(Error::PartialFailure {
            message: format!(
                "operation {} failed ({}); {} compensation(s) failed",
                failure.index,
                failure.error,
                failed.len()
            ),
            uncertain,
        })
    }
}

/// Runs operation batches against a [`Reconciler`]
pub struct BatchExecutor<'a> {
    reconciler: &'a Reconciler,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(reconciler: &'a Reconciler) -> Self {
        Self { reconciler }
    }

    /// Executes `operations` atomically.
    ///
    /// An empty batch succeeds without touching the backend.
    pub async fn execute(&self, operations: Vec<Operation>, cancel: &CancelToken) -> BatchReport {
        if operations.is_empty() {
            return BatchReport {
                applied: Vec::new(),
                failure: None,
                persisted: false,
            };
        }

        let order = execution_order(&operations);
        let guard = match self.reconciler.lock().await {
            Ok(guard) => guard,
            Err(error) => {
                warn!("Could not take the host lock for the batch: {error}");
                return BatchReport {
                    applied: Vec::new(),
                    failure: Some(BatchFailure {
                        index: order[0],
                        error,
                        compensations: Vec::new(),
                    }),
                    persisted: false,
                };
            }
        };
        info!("Executing batch of {} operation(s)", operations.len());

        let mut applied: Vec<BatchItem> = Vec::with_capacity(operations.len());
        let mut failure = None;
        for index in order {
            if cancel.is_cancelled() {
                warn!("Batch cancelled before operation {index}");
                failure = Some((index, Error::Cancelled));
                break;
            }
            match self
                .reconciler
                .apply_locked(&guard, operations[index].clone())
                .await
            {
                Ok(outcome) => applied.push(BatchItem {
                    index,
                    applied: outcome,
                }),
                Err(err) => {
                    warn!("Batch operation {index} failed: {err}");
                    failure = Some((index, err));
                    break;
                }
            }
        }

        let failure = match failure {
            Some((index, error)) => {
                let compensations = self.roll_back(&guard, std::mem::take(&mut applied)).await;
                Some(BatchFailure {
                    index,
                    error,
                    compensations,
                })
            }
            None => None,
        };

        let persisted = self.reconciler.persist_locked(&guard).await;
        BatchReport {
            applied,
            failure,
            persisted,
        }
    }

    /// Compensates `applied` in reverse order.
    ///
    /// A compensation that fails leaves its records flagged divergent so
    /// drift recovery can revisit them.
    async fn roll_back(
        &self,
        guard: &HostGuard<'_>,
        applied: Vec<BatchItem>,
    ) -> Vec<CompensationOutcome> {
        let mut outcomes = Vec::with_capacity(applied.len());
        for item in applied.into_iter().rev() {
            let compensation = item.applied.inverse();
            let result = self.reconciler.compensate_locked(guard, &compensation).await;
            let error = match result {
                Ok(()) => None,
                Err(err) => {
                    error!("Compensation '{}' failed: {err}", compensation.describe());
                    if let Err(mark_err) = self.mark_divergent(&compensation, &err).await {
                        error!("Could not flag divergent rules: {mark_err}");
                    }
                    Some(err.to_string())
                }
            };
            outcomes.push(CompensationOutcome {
                index: item.index,
                description: compensation.describe(),
                rule_ids: compensation.rule_ids(),
                error,
            });
        }
        outcomes
    }

    async fn mark_divergent(&self, compensation: &Compensation, err: &Error) -> Result<()> {
        let catalogue = self.reconciler.catalogue();
        match compensation {
            Compensation::Remove(_) | Compensation::Revert { .. } => {
                // An incomplete undo means nothing is known to be enforced
                let disable = matches!(err, Error::PartialFailure { .. });
                catalogue
                    .mark_divergent(&compensation.rule_ids(), disable)
                    .await
            }
            Compensation::Reinstate(rules) => {
                // The records are gone from the catalogue; bring them back
                // disabled so the enforced state can be recovered later
                let records = rules
                    .iter()
                    .cloned()
                    .map(|mut rule| {
                        rule.enabled = false;
                        rule.divergent = true;
                        rule
                    })
                    .collect();
                catalogue.reinstate(records).await
            }
        }
    }
}

/// Order in which a batch is executed.
///
/// Within each contiguous run of creates, Drop address rules move ahead of
/// the other creates. The sort is stable, so everything else keeps its
/// submitted order and no create crosses an update or delete.
fn execution_order(operations: &[Operation]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..operations.len()).collect();
    let mut start = 0;
    while start < order.len() {
        if !operations[start].is_create() {
            start += 1;
            continue;
        }
        let end = (start..operations.len())
            .find(|&i| !operations[i].is_create())
            .unwrap_or(operations.len());
        order[start..end].sort_by_key(|&i| !is_drop_address_create(&operations[i]));
        start = end;
    }
    order
}

fn is_drop_address_create(operation: &Operation) -> bool {
    let Operation::CreateAddress(draft) = operation else {
        return false;
    };
    // Invalid drafts sort with the other creates and fail when reached
    validate(&RuleDraft::Address(draft.clone())).is_ok_and(|rule| rule.strategy == Strategy::Drop)
}
