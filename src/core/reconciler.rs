//! Reconciliation of requested rule changes against catalogue and backend
//!
//! Every mutation follows the same path:
//!
//! 1. Validate the draft (no external calls)
//! 2. Check conflicts and existence against the catalogue (no external calls)
//! 3. Compute the ordered backend delta and apply it
//! 4. Commit the catalogue only once the whole delta succeeded
//!
//! A failure in step 3 undoes the already applied steps in reverse order. If
//! the undo itself fails the error is [`Error::PartialFailure`], listing the
//! rules whose backend state is uncertain. A failed catalogue commit in step
//! 4 undoes the backend delta too, so a reported failure never leaves an
//! unrecorded rule enforced and a reported success never leaves the
//! catalogue pointing at unenforced rules.
//!
//! All mutations hold the [`HostLock`] end to end. Functions that require it
//! take a [`HostGuard`] to prove it is held. For a file-backed catalogue the
//! lock spans processes, and the catalogue is reloaded once it is taken.

use crate::backend::{BackendError, FirewallBackend, Resilient, RetryPolicy};
use crate::core::catalogue::Catalogue;
use crate::core::error::{CatalogueError, Error, Result};
use crate::core::rule::{MAX_RULES, NormalizedRule, Rule, RuleDescriptor, Strategy};
use crate::core::search::{self, Page, RuleFilter};
use crate::core::validate::{AddressDraft, PortDraft, RuleDraft, validate};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-host mutation lock
///
/// Inside a process, waiters queue on a fair `tokio::sync::Mutex` and are
/// served in FIFO order. With a lock file, the holder then also takes an
/// exclusive `flock` on it, waiting for other processes to release it.
#[derive(Debug, Default)]
pub struct HostLock {
    local: tokio::sync::Mutex<()>,
    file: Option<PathBuf>,
}

/// Proof that the [`HostLock`] is held
pub struct HostGuard<'a> {
    _file: Option<Flock<File>>,
    _local: tokio::sync::MutexGuard<'a, ()>,
}

impl HostLock {
    pub fn new(file: Option<PathBuf>) -> Self {
        Self {
            local: tokio::sync::Mutex::new(()),
            file,
        }
    }

    pub async fn acquire(&self) -> Result<HostGuard<'_>> {
        let local = self.local.lock().await;
        let file = match &self.file {
            Some(path) => Some(lock_file(path.clone()).await?),
            None => None,
        };
        Ok(HostGuard {
            _file: file,
            _local: local,
        })
    }
}

/// Blocks on an exclusive `flock` of `path`, off the async workers.
async fn lock_file(path: PathBuf) -> Result<Flock<File>> {
    tokio::task::spawn_blocking(move || -> Result<Flock<File>> {
        // Open without truncating so the lock file is never replaced under a holder
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)?;
        debug!("Waiting for host lock {}", path.display());
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Error::Io(std::io::Error::from(errno)))
    })
    .await
    .map_err(|e| Error::Internal(format!("host lock task failed: {e}")))?
}

/// A requested rule mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreatePort(PortDraft),
    CreateAddress(AddressDraft),
    UpdatePort { id: Uuid, rule: PortDraft },
    UpdateAddress { id: Uuid, rule: AddressDraft },
    DeleteSet { ids: BTreeSet<Uuid> },
}

impl Operation {
    pub fn describe(&self) -> String {
        match self {
            Operation::CreatePort(d) => format!("create port rule {}/{}", d.protocol, d.port_spec),
            Operation::CreateAddress(d) => format!("create address rule {}", d.address),
            Operation::UpdatePort { id, .. } | Operation::UpdateAddress { id, .. } => {
                format!("update rule {id}")
            }
            Operation::DeleteSet { ids } => format!("delete {} rule(s)", ids.len()),
        }
    }

    pub const fn is_create(&self) -> bool {
        matches!(self, Operation::CreatePort(_) | Operation::CreateAddress(_))
    }
}

/// Outcome of a successful mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Applied {
    Created { rule: Rule },
    Updated { before: Rule, after: Rule },
    Deleted { rules: Vec<Rule> },
}

impl Applied {
    /// Operation that restores the state before this one
    pub fn inverse(&self) -> Compensation {
        match self {
            Applied::Created { rule } => Compensation::Remove(rule.clone()),
            Applied::Updated { before, after } => Compensation::Revert {
                current: after.clone(),
                previous: before.clone(),
            },
            Applied::Deleted { rules } => Compensation::Reinstate(rules.clone()),
        }
    }

    pub fn rule_ids(&self) -> Vec<Uuid> {
        match self {
            Applied::Created { rule } => vec![rule.id],
            Applied::Updated { after, .. } => vec![after.id],
            Applied::Deleted { rules } => rules.iter().map(|r| r.id).collect(),
        }
    }
}

/// Inverse of an [`Applied`] mutation, used by batch rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Undo a create
    Remove(Rule),
    /// Undo an update
    Revert { current: Rule, previous: Rule },
    /// Undo a delete
    Reinstate(Vec<Rule>),
}

impl Compensation {
    pub fn describe(&self) -> String {
        match self {
            Compensation::Remove(rule) => format!("remove created rule {}", rule.id),
            Compensation::Revert { previous, .. } => format!("revert rule {}", previous.id),
            Compensation::Reinstate(rules) => format!("reinstate {} deleted rule(s)", rules.len()),
        }
    }

    pub fn rule_ids(&self) -> Vec<Uuid> {
        match self {
            Compensation::Remove(rule) => vec![rule.id],
            Compensation::Revert { previous, .. } => vec![previous.id],
            Compensation::Reinstate(rules) => rules.iter().map(|r| r.id).collect(),
        }
    }
}

/// One backend mutation in a delta
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Apply(RuleDescriptor),
    Remove(RuleDescriptor),
}

impl Step {
    fn inverse(&self) -> Step {
        match self {
            Step::Apply(rule) => Step::Remove(rule.clone()),
            Step::Remove(rule) => Step::Apply(rule.clone()),
        }
    }

    fn rule_id(&self) -> Uuid {
        match self {
            Step::Apply(rule) | Step::Remove(rule) => rule.id,
        }
    }
}

/// Apply steps for `rules`, Drop rules first
fn apply_steps<'a>(rules: impl IntoIterator<Item = &'a Rule>) -> Vec<Step> {
    let mut enabled: Vec<&Rule> = rules.into_iter().filter(|r| r.enabled).collect();
    enabled.sort_by_key(|r| r.strategy != Strategy::Drop);
    enabled
        .into_iter()
        .map(|r| Step::Apply(r.descriptor()))
        .collect()
}

/// Remove steps for `rules`, Accept rules first
fn remove_steps<'a>(rules: impl IntoIterator<Item = &'a Rule>) -> Vec<Step> {
    let mut enabled: Vec<&Rule> = rules.into_iter().filter(|r| r.enabled).collect();
    enabled.sort_by_key(|r| r.strategy != Strategy::Accept);
    enabled
        .into_iter()
        .map(|r| Step::Remove(r.descriptor()))
        .collect()
}

/// Result of a drift recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    /// Enabled rules that were missing from the backend and re-applied
    pub reapplied: Vec<Uuid>,
    /// Enabled rules whose live form differed and was replaced
    pub replaced: Vec<Uuid>,
    /// Disabled rules that were still enforced and got removed
    pub removed: Vec<Uuid>,
    /// Tagged live rules unknown to the catalogue, left in place
    pub unexpected: Vec<RuleDescriptor>,
    /// Rules that could not be brought in sync, with the error
    pub failed: Vec<(Uuid, String)>,
    /// Records still flagged divergent after the pass
    pub divergent: Vec<Uuid>,
    pub persisted: bool,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.reapplied.is_empty()
            && self.replaced.is_empty()
            && self.removed.is_empty()
            && self.unexpected.is_empty()
            && self.failed.is_empty()
            && self.divergent.is_empty()
    }
}

/// Keeps the catalogue and the live firewall in step
pub struct Reconciler {
    catalogue: Arc<Catalogue>,
    backend: Resilient,
    lock: HostLock,
}

impl Reconciler {
    pub fn new(
        catalogue: Arc<Catalogue>,
        backend: Box<dyn FirewallBackend>,
        policy: RetryPolicy,
    ) -> Self {
        let lock = HostLock::new(catalogue.lock_path());
        Self {
            catalogue,
            backend: Resilient::new(backend, policy),
            lock,
        }
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Waits for the host mutation lock and reloads the catalogue under it.
    pub async fn lock(&self) -> Result<HostGuard<'_>> {
        let guard = self.lock.acquire().await?;
        // Another process may have committed while this one waited
        self.catalogue.reload().await?;
        Ok(guard)
    }

    /// Paginated search; never waits on the mutation lock.
    pub fn search(&self, filter: &RuleFilter, page: usize, page_size: usize) -> Page {
        search::search(&self.catalogue, filter, page, page_size)
    }

    /// Applies one operation and persists the backend state.
    pub async fn reconcile(&self, operation: Operation) -> Result<Applied> {
        let guard = self.lock().await?;
        let applied = self.apply_locked(&guard, operation).await?;
        self.persist_locked(&guard).await;
        Ok(applied)
    }

    /// Applies one operation without persisting. Caller holds the lock.
    pub async fn apply_locked(&self, _guard: &HostGuard<'_>, operation: Operation) -> Result<Applied> {
        debug!("Reconciling: {}", operation.describe());
        match operation {
            Operation::CreatePort(draft) => self.create(&RuleDraft::Port(draft)).await,
            Operation::CreateAddress(draft) => self.create(&RuleDraft::Address(draft)).await,
            Operation::UpdatePort { id, rule } => self.update(id, &RuleDraft::Port(rule)).await,
            Operation::UpdateAddress { id, rule } => {
                self.update(id, &RuleDraft::Address(rule)).await
            }
            Operation::DeleteSet { ids } => self.delete(&ids).await,
        }
    }

    fn check_conflict(&self, normalized: &NormalizedRule, exclude: Option<Uuid>) -> Result<()> {
        if !normalized.enabled {
            return Ok(());
        }
        let tuple = normalized.tuple();
        match self.catalogue.find_conflict(&tuple, exclude) {
            Some(existing) => Err(Error::Conflict {
                existing,
                tuple: tuple.to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn create(&self, draft: &RuleDraft) -> Result<Applied> {
        let normalized = validate(draft)?;
        self.check_conflict(&normalized, None)?;
        if self.catalogue.len() >= MAX_RULES {
            return Err(CatalogueError::TooManyRules {
                count: self.catalogue.len() + 1,
                max: MAX_RULES,
            }
            .into());
        }

        let rule = Rule::create(normalized);
        let steps = apply_steps([&rule]);
        self.run_steps(&steps).await?;
        if let Err(err) = self.catalogue.insert(rule.clone()).await {
            return Err(self.undo(&steps, err).await);
        }

        info!("Created rule {} ({})", rule.id, rule.tuple());
        Ok(Applied::Created { rule })
    }

    async fn update(&self, id: Uuid, draft: &RuleDraft) -> Result<Applied> {
        let existing = self.catalogue.get(id).ok_or(Error::NotFound(id))?;
        let normalized = validate(draft)?;
        if normalized.target.kind() != existing.kind() {
            return Err(Error::validation(
                "rule",
                format!("Rule {id} is a {} rule", existing.kind()),
            ));
        }
        self.check_conflict(&normalized, Some(id))?;

        let updated = existing.replaced_with(normalized);
        let old = existing.descriptor();
        let new = updated.descriptor();
        let unchanged = existing.enabled
            && updated.enabled
            && old == new
            && old.comment == new.comment;

        let mut steps = Vec::with_capacity(2);
        if !unchanged {
            steps.extend(remove_steps([&existing]));
            steps.extend(apply_steps([&updated]));
        }
        self.run_steps(&steps).await?;
        if let Err(err) = self.catalogue.replace(updated.clone()).await {
            return Err(self.undo(&steps, err).await);
        }

        info!("Updated rule {id} ({})", updated.tuple());
        Ok(Applied::Updated {
            before: existing,
            after: updated,
        })
    }

    async fn delete(&self, ids: &BTreeSet<Uuid>) -> Result<Applied> {
        if ids.is_empty() {
            return Err(Error::validation("ids", "At least one rule id is required"));
        }
        let rules = ids
            .iter()
            .map(|id| self.catalogue.get(*id).ok_or(Error::NotFound(*id)))
            .collect::<Result<Vec<_>>>()?;

        let steps = remove_steps(&rules);
        self.run_steps(&steps).await?;
        let ids: Vec<Uuid> = ids.iter().copied().collect();
        let removed = match self.catalogue.remove(&ids).await {
            Ok(removed) => removed,
            Err(err) => return Err(self.undo(&steps, err).await),
        };

        info!("Deleted {} rule(s)", removed.len());
        Ok(Applied::Deleted { rules: removed })
    }

    /// Reverses an applied mutation. Caller holds the lock.
    pub async fn compensate_locked(
        &self,
        _guard: &HostGuard<'_>,
        compensation: &Compensation,
    ) -> Result<()> {
        debug!("Compensating: {}", compensation.describe());
        match compensation {
            Compensation::Remove(created) => {
                let current = self.catalogue.get(created.id).unwrap_or_else(|| created.clone());
                let steps = remove_steps([&current]);
                self.run_steps(&steps).await?;
                if let Err(err) = self.catalogue.remove(&[created.id]).await {
                    return Err(self.undo(&steps, err).await);
                }
            }
            Compensation::Revert { current, previous } => {
                let mut steps = remove_steps([current]);
                steps.extend(apply_steps([previous]));
                self.run_steps(&steps).await?;
                if let Err(err) = self.catalogue.replace(previous.clone()).await {
                    return Err(self.undo(&steps, err).await);
                }
            }
            Compensation::Reinstate(rules) => {
                let steps = apply_steps(rules);
                self.run_steps(&steps).await?;
                if let Err(err) = self.catalogue.reinstate(rules.clone()).await {
                    return Err(self.undo(&steps, err).await);
                }
            }
        }
        Ok(())
    }

    /// Saves backend state; a failure is logged, not returned.
    pub async fn persist_locked(&self, _guard: &HostGuard<'_>) -> bool {
        match self.backend.persist().await {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to persist {} ruleset: {err}", self.backend.name());
                false
            }
        }
    }

    async fn execute(&self, step: &Step) -> std::result::Result<(), BackendError> {
        match step {
            Step::Apply(rule) => self.backend.apply_rule(rule).await,
            Step::Remove(rule) => self.backend.remove_rule(rule).await,
        }
    }

    /// Runs a delta in order, undoing it on the first failure.
    async fn run_steps(&self, steps: &[Step]) -> Result<()> {
        for (i, step) in steps.iter().enumerate() {
            if let Err(err) = self.execute(step).await {
                // A timed-out step may or may not have taken effect
                let attempted = if matches!(err, BackendError::Timeout(_)) {
                    i + 1
                } else {
                    i
                };
                return Err(self.undo(&steps[..attempted], err.into()).await);
            }
        }
        Ok(())
    }

    /// Best-effort reversal of `done` in reverse order.
    ///
    /// Returns `original` when everything was undone, otherwise a
    /// [`Error::PartialFailure`] naming the rules left uncertain. Uncertain
    /// records still in the catalogue are flagged divergent.
    async fn undo(&self, done: &[Step], original: Error) -> Error {
        if done.is_empty() {
            return original;
        }
        warn!("Rolling back {} backend step(s) after: {original}", done.len());

        let mut uncertain = Vec::new();
        for step in done.iter().rev() {
            if let Err(err) = self.execute(&step.inverse()).await {
                error!("Rollback of {:?} failed: {err}", step.inverse());
                if !uncertain.contains(&step.rule_id()) {
                    uncertain.push(step.rule_id());
                }
            }
        }

        if uncertain.is_empty() {
            original
        } else {
            if let Err(err) = self.catalogue.mark_divergent(&uncertain, false).await {
                error!("Could not flag divergent rules: {err}");
            }
            Error::PartialFailure {
                message: format!("{original}; rollback incomplete"),
                uncertain,
            }
        }
    }

    /// Compares catalogue and backend and resolves drift.
    ///
    /// Enabled rules missing from the backend are re-applied and stale live
    /// forms replaced. Disabled rules still enforced are removed. Tagged live
    /// rules the catalogue does not know are reported and left in place.
    pub async fn recover(&self) -> Result<DriftReport> {
        let guard = self.lock().await?;
        let mut report = DriftReport::default();

        let mut active: BTreeMap<Uuid, RuleDescriptor> = self
            .backend
            .list_active()
            .await?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();
        let records = self.catalogue.list();
        let mut verified = Vec::new();

        for rule in &records {
            let live = active.remove(&rule.id);
            let desired = rule.descriptor();
            let outcome = match (rule.enabled, live) {
                (true, Some(live)) if live == desired => {
                    verified.push(rule.id);
                    continue;
                }
                (true, Some(live)) => {
                    warn!("Rule {} differs on the backend, replacing", rule.id);
                    self.run_steps(&[Step::Remove(live), Step::Apply(desired)])
                        .await
                        .map(|()| report.replaced.push(rule.id))
                }
                (true, None) => {
                    warn!("Rule {} missing from the backend, re-applying", rule.id);
                    self.run_steps(&[Step::Apply(desired)])
                        .await
                        .map(|()| report.reapplied.push(rule.id))
                }
                (false, Some(live)) => {
                    warn!("Disabled rule {} still enforced, removing", rule.id);
                    self.run_steps(&[Step::Remove(live)])
                        .await
                        .map(|()| report.removed.push(rule.id))
                }
                (false, None) => {
                    if !rule.divergent {
                        continue;
                    }
                    // Disabled divergent records cannot be verified further
                    Ok(())
                }
            };
            match outcome {
                Ok(()) if rule.enabled => verified.push(rule.id),
                Ok(()) => {}
                Err(err) => {
                    error!("Could not reconcile rule {}: {err}", rule.id);
                    report.failed.push((rule.id, err.to_string()));
                }
            }
        }

        for (id, live) in active {
            warn!("Unexpected tagged rule on the backend: {live} ({id})");
            report.unexpected.push(live);
        }

        let divergent_verified: Vec<Uuid> = records
            .iter()
            .filter(|r| r.divergent && verified.contains(&r.id))
            .map(|r| r.id)
            .collect();
        self.catalogue.clear_divergent(&divergent_verified).await?;
        report.divergent = records
            .iter()
            .filter(|r| r.divergent && !divergent_verified.contains(&r.id))
            .map(|r| r.id)
            .collect();

        report.persisted = self.persist_locked(&guard).await;
        info!(
            "Recovery: {} re-applied, {} replaced, {} removed, {} unexpected, {} failed",
            report.reapplied.len(),
            report.replaced.len(),
            report.removed.len(),
            report.unexpected.len(),
            report.failed.len()
        );
        Ok(report)
    }
}
