//! Integration tests for hostfw
//!
//! These tests drive the public API end to end against the in-memory
//! backend, injecting backend faults (rejections, busy locks, timeouts) to
//! verify rollback, batch atomicity and drift recovery.
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use hostfw::backend::memory::BackendEvent;
use hostfw::backend::{BackendError, MemoryBackend, RetryPolicy};
use hostfw::core::batch::BatchExecutor;
use hostfw::core::rule::RuleDescriptor;
use hostfw::{
    AddressDraft, Applied, CancelToken, Catalogue, Error, Operation, PortDraft, Reconciler, Rule,
    RuleFilter, Strategy,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn setup() -> (Reconciler, MemoryBackend) {
    let backend = MemoryBackend::new();
    let policy = RetryPolicy {
        attempts: 3,
        base_delay: Duration::from_millis(1),
        timeout: Duration::from_millis(200),
    };
    let reconciler = Reconciler::new(
        Arc::new(Catalogue::in_memory()),
        Box::new(backend.clone()),
        policy,
    );
    (reconciler, backend)
}

fn port(protocol: &str, spec: &str, strategy: &str) -> Operation {
    Operation::CreatePort(PortDraft::new(protocol, spec, strategy))
}

fn address(addr: &str, strategy: &str) -> Operation {
    Operation::CreateAddress(AddressDraft::new(addr, strategy))
}

async fn create(reconciler: &Reconciler, op: Operation) -> Rule {
    match reconciler.reconcile(op).await {
        Ok(Applied::Created { rule }) => rule,
        other => panic!("expected a create, got {:?}", other),
    }
}

fn ports_are(spec: &'static str) -> impl Fn(&RuleDescriptor) -> bool + Send + Sync + 'static {
    move |d: &RuleDescriptor| d.target.ports().is_some_and(|p| p.to_string() == spec)
}

fn applied_order(backend: &MemoryBackend) -> Vec<Strategy> {
    backend
        .events()
        .into_iter()
        .filter_map(|e| match e {
            BackendEvent::Applied(d) => Some(d.strategy),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_create_port_rule_is_enforced_and_searchable() {
    let (reconciler, backend) = setup();
    let mut draft = PortDraft::new("tcp", "8080", "accept");
    draft.description = "Dev server".to_string();
    let Applied::Created { rule } = reconciler
        .reconcile(Operation::CreatePort(draft))
        .await
        .unwrap()
    else {
        panic!("expected a create");
    };

    let active = backend.active();
    assert_eq!(active, vec![rule.descriptor()]);
    assert_eq!(active[0].tag(), format!("hostfw:port:{}", rule.id));
    assert_eq!(active[0].comment, "Dev server");

    let filter = RuleFilter {
        query: Some("8080".to_string()),
        ..RuleFilter::default()
    };
    let page = reconciler.search(&filter, 1, 10);
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, rule.id);
}

#[tokio::test]
async fn test_duplicate_create_conflicts_without_side_effects() {
    let (reconciler, backend) = setup();
    let first = create(&reconciler, port("tcp", "22", "accept")).await;
    let calls = backend.call_count();

    let err = reconciler
        .reconcile(port("TCP", " 22 ", "Accept"))
        .await
        .unwrap_err();
    match err {
        Error::Conflict { existing, .. } => assert_eq!(existing, first.id),
        other => panic!("expected conflict, got {other}"),
    }
    assert_eq!(backend.call_count(), calls);
    assert_eq!(reconciler.catalogue().len(), 1);
}

#[tokio::test]
async fn test_create_update_delete_round_trip() {
    let (reconciler, backend) = setup();
    let rule = create(&reconciler, port("tcp", "80", "accept")).await;

    let updated = reconciler
        .reconcile(Operation::UpdatePort {
            id: rule.id,
            rule: PortDraft::new("tcp", "80,443", "accept"),
        })
        .await
        .unwrap();
    let Applied::Updated { before, after } = updated else {
        panic!("expected an update");
    };
    assert_eq!(before, rule);
    assert_eq!(after.id, rule.id);
    assert_eq!(after.created_at, rule.created_at);
    assert_eq!(backend.active(), vec![after.descriptor()]);

    reconciler
        .reconcile(Operation::DeleteSet {
            ids: BTreeSet::from([rule.id]),
        })
        .await
        .unwrap();
    assert!(backend.active().is_empty());
    assert!(reconciler.catalogue().is_empty());

    let err = reconciler
        .reconcile(Operation::DeleteSet {
            ids: BTreeSet::from([rule.id]),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(id) if id == rule.id));
}

#[tokio::test]
async fn test_failed_update_restores_previous_rule() {
    let (reconciler, backend) = setup();
    let rule = create(&reconciler, port("tcp", "22", "accept")).await;
    backend.fail_apply_where(
        ports_are("2222"),
        BackendError::Rejected("Error: Could not process rule".to_string()),
    );

    let err = reconciler
        .reconcile(Operation::UpdatePort {
            id: rule.id,
            rule: PortDraft::new("tcp", "2222", "accept"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend(BackendError::Rejected(_))));

    assert_eq!(backend.active(), vec![rule.descriptor()]);
    assert_eq!(reconciler.catalogue().get(rule.id), Some(rule));
}

#[tokio::test]
async fn test_failed_rollback_reports_uncertain_rule() {
    let (reconciler, backend) = setup();
    let rule = create(&reconciler, port("tcp", "22", "accept")).await;
    backend.fail_apply_where(|_| true, BackendError::Rejected("refused".to_string()));

    let err = reconciler
        .reconcile(Operation::UpdatePort {
            id: rule.id,
            rule: PortDraft::new("tcp", "2222", "accept"),
        })
        .await
        .unwrap_err();
    assert_eq!(err.uncertain_rules(), &[rule.id]);
    assert!(backend.active().is_empty());
    // Catalogue keeps the last committed definition, flagged for recovery
    let stored = reconciler.catalogue().get(rule.id).unwrap();
    assert!(stored.divergent);
    assert!(stored.enabled);
    assert_eq!(stored.descriptor(), rule.descriptor());

    backend.clear_faults();
    let report = reconciler.recover().await.unwrap();
    assert_eq!(report.reapplied, vec![rule.id]);
    assert_eq!(backend.active(), vec![rule.descriptor()]);
    assert_eq!(reconciler.catalogue().get(rule.id), Some(rule));
}

#[tokio::test]
async fn test_batch_failure_rolls_back_everything() {
    let (reconciler, backend) = setup();
    let existing = create(&reconciler, port("udp", "53", "accept")).await;

    let ops = vec![
        port("tcp", "80", "accept"),
        address("10.0.0.0/8", "drop"),
        Operation::DeleteSet {
            ids: BTreeSet::from([existing.id]),
        },
        port("tcp", "70000", "accept"),
    ];
    let report = BatchExecutor::new(&reconciler)
        .execute(ops, &CancelToken::new())
        .await;

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.index, 3);
    assert_eq!(failure.compensations.len(), 3);
    assert!(failure.compensations.iter().all(|c| c.error.is_none()));
    assert!(report.applied.is_empty());
    assert!(matches!(report.into_result(), Err(Error::Validation { .. })));

    assert_eq!(backend.active(), vec![existing.descriptor()]);
    let remaining = reconciler.catalogue().list();
    assert_eq!(remaining, vec![existing]);
}

#[tokio::test]
async fn test_batch_success_persists_once() {
    let (reconciler, backend) = setup();
    let ops = vec![port("tcp", "80", "accept"), port("tcp", "443", "accept")];
    let report = BatchExecutor::new(&reconciler)
        .execute(ops, &CancelToken::new())
        .await;

    assert!(report.is_success());
    assert!(report.persisted);
    let items = report.into_result().unwrap();
    assert_eq!(items.len(), 2);
    let persists = backend
        .events()
        .iter()
        .filter(|e| **e == BackendEvent::Persisted)
        .count();
    assert_eq!(persists, 1);
    assert_eq!(reconciler.catalogue().len(), 2);
}

#[tokio::test]
async fn test_batch_applies_drop_before_accept() {
    let (reconciler, backend) = setup();
    let ops = vec![address("10.0.0.1", "accept"), address("10.0.0.0/8", "drop")];
    let items = BatchExecutor::new(&reconciler)
        .execute(ops, &CancelToken::new())
        .await
        .into_result()
        .unwrap();

    assert_eq!(items.iter().map(|i| i.index).collect::<Vec<_>>(), vec![1, 0]);
    assert_eq!(applied_order(&backend), vec![Strategy::Drop, Strategy::Accept]);
    let chain: Vec<Strategy> = backend.active().iter().map(|d| d.strategy).collect();
    assert_eq!(chain, vec![Strategy::Drop, Strategy::Accept]);
}

#[tokio::test]
async fn test_batch_cancelled_between_operations() {
    let (reconciler, backend) = setup();
    let cancel = CancelToken::new();

    // Cancel as a side effect of the first backend apply
    let trigger = cancel.clone();
    backend.fail_apply_where(
        move |_| {
            trigger.cancel();
            false
        },
        BackendError::Rejected("unused".to_string()),
    );

    let ops = vec![port("tcp", "80", "accept"), port("tcp", "443", "accept")];
    let report = BatchExecutor::new(&reconciler).execute(ops, &cancel).await;

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.index, 1);
    assert_eq!(failure.compensations.len(), 1);
    assert!(matches!(report.into_result(), Err(Error::Cancelled)));
    assert!(backend.active().is_empty());
    assert!(reconciler.catalogue().is_empty());
}

#[tokio::test]
async fn test_failed_compensation_marks_rule_divergent() {
    let (reconciler, backend) = setup();
    backend.fail_remove_where(
        ports_are("80"),
        BackendError::Rejected("refused".to_string()),
    );

    let ops = vec![port("tcp", "80", "accept"), port("tcp", "0", "accept")];
    let report = BatchExecutor::new(&reconciler)
        .execute(ops, &CancelToken::new())
        .await;
    let err = report.into_result().unwrap_err();
    assert!(matches!(err, Error::PartialFailure { .. }));

    let stuck = err.uncertain_rules()[0];
    let record = reconciler.catalogue().get(stuck).unwrap();
    assert!(record.divergent);
    assert!(record.enabled);

    backend.clear_faults();
    let report = reconciler.recover().await.unwrap();
    assert!(report.is_clean());
    assert!(!reconciler.catalogue().get(stuck).unwrap().divergent);
}

#[tokio::test]
async fn test_recover_reapplies_and_reports_drift() {
    let (reconciler, backend) = setup();
    let kept = create(&reconciler, port("tcp", "22", "accept")).await;
    let lost = create(&reconciler, address("192.0.2.0/24", "drop")).await;

    backend.drop_silently(lost.id);
    let stranger = RuleDescriptor {
        id: Uuid::new_v4(),
        ..kept.descriptor()
    };
    backend.inject(stranger.clone());

    let report = reconciler.recover().await.unwrap();
    assert_eq!(report.reapplied, vec![lost.id]);
    assert!(report.replaced.is_empty());
    assert_eq!(report.unexpected, vec![stranger.clone()]);
    assert!(report.persisted);

    // Unknown tagged rules are left in place
    assert!(backend.active().contains(&stranger));
    assert!(backend.active().contains(&lost.descriptor()));

    let again = reconciler.recover().await.unwrap();
    assert!(again.reapplied.is_empty());
    assert_eq!(again.unexpected.len(), 1);
}

#[tokio::test]
async fn test_busy_backend_is_retried() {
    let (reconciler, backend) = setup();
    backend.busy_for(2);
    let rule = create(&reconciler, port("tcp", "22", "accept")).await;
    assert_eq!(backend.active(), vec![rule.descriptor()]);

    backend.busy_for(3);
    let err = reconciler
        .reconcile(port("tcp", "23", "accept"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend(BackendError::Busy(_))));
    assert_eq!(reconciler.catalogue().len(), 1);
}

#[tokio::test]
async fn test_timeout_leaves_catalogue_untouched() {
    let (reconciler, backend) = setup();
    backend.set_delay(Duration::from_millis(500));

    let err = reconciler
        .reconcile(port("tcp", "22", "accept"))
        .await
        .unwrap_err();
    // The undo of the timed-out apply times out as well
    assert!(matches!(err, Error::PartialFailure { .. }));
    assert_eq!(err.uncertain_rules().len(), 1);
    assert!(reconciler.catalogue().is_empty());
    assert!(backend.active().is_empty());
}

#[tokio::test]
async fn test_catalogue_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalogue.json");
    let backend = MemoryBackend::new();
    let reconciler = Reconciler::new(
        Arc::new(Catalogue::open(&path).await.unwrap()),
        Box::new(backend.clone()),
        RetryPolicy::default(),
    );
    let rule = create(&reconciler, address("2001:db8::1/64", "drop")).await;
    assert_eq!(
        rule.target.network().map(ToString::to_string),
        Some("2001:db8::/64".to_string())
    );

    let reopened = Catalogue::open(&path).await.unwrap();
    assert_eq!(reopened.list(), vec![rule]);
    assert!(dir.path().join("catalogue.json.sha256").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_processes_sharing_a_catalogue_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalogue.json");
    let backend = MemoryBackend::new();

    // Two independent reconcilers stand in for two CLI invocations
    let open = |backend: &MemoryBackend| {
        let path = path.clone();
        let backend = backend.clone();
        async move {
            Reconciler::new(
                Arc::new(Catalogue::open(&path).await.unwrap()),
                Box::new(backend),
                RetryPolicy::default(),
            )
        }
    };
    let first = open(&backend).await;
    let second = open(&backend).await;
    backend.set_delay(Duration::from_millis(20));

    let (a, b) = tokio::join!(
        first.reconcile(port("tcp", "8080", "accept")),
        second.reconcile(port("tcp", "8080", "accept")),
    );
    let (created, conflict) = match (a, b) {
        (Ok(Applied::Created { rule }), Err(err)) | (Err(err), Ok(Applied::Created { rule })) => {
            (rule, err)
        }
        other => panic!("expected one create and one conflict, got {:?}", other),
    };
    assert!(matches!(conflict, Error::Conflict { existing, .. } if existing == created.id));
    assert_eq!(backend.active(), vec![created.descriptor()]);

    let on_disk = Catalogue::open(&path).await.unwrap();
    assert_eq!(on_disk.list(), vec![created]);
}
