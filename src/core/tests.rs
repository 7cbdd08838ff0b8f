#[cfg(test)]
mod tests_impl {
    use crate::backend::MemoryBackend;
    use crate::core::catalogue::Catalogue;
    use crate::core::error::Error;
    use crate::core::reconciler::{Applied, Operation, Reconciler};
    use crate::core::rule::{RuleKind, Strategy};
    use crate::core::search::RuleFilter;
    use crate::core::test_helpers::{address_op, fast_policy, memory_reconciler, port_op};
    use crate::core::validate::PortDraft;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_catalogue_survives_reopen_after_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalogue.json");
        let backend = MemoryBackend::new();

        let reconciler = Reconciler::new(
            Arc::new(Catalogue::open(&path).await.unwrap()),
            Box::new(backend.clone()),
            fast_policy(),
        );
        let mut draft = PortDraft::new("tcp", "8080,80-90", "accept");
        draft.description = "web".to_string();
        let Applied::Created { rule } = reconciler
            .reconcile(Operation::CreatePort(draft))
            .await
            .unwrap()
        else {
            panic!("expected a create");
        };
        drop(reconciler);

        let reopened = Catalogue::open(&path).await.unwrap();
        assert_eq!(reopened.get(rule.id), Some(rule.clone()));
        assert_eq!(rule.target.ports().unwrap().to_string(), "80-90,8080");
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_creates_conflict_once() {
        let (reconciler, backend) = memory_reconciler();
        let reconciler = Arc::new(reconciler);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reconciler = Arc::clone(&reconciler);
                tokio::spawn(async move { reconciler.reconcile(port_op("tcp", "443", "accept")).await })
            })
            .collect();

        let mut created = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(Error::Conflict { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((created, conflicts), (1, 3));
        assert_eq!(backend.active().len(), 1);
        assert_eq!(reconciler.catalogue().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_duplicate_is_not_a_conflict() {
        let (reconciler, backend) = memory_reconciler();
        reconciler
            .reconcile(port_op("tcp", "22", "accept"))
            .await
            .unwrap();

        let mut draft = PortDraft::new("tcp", "22", "accept");
        draft.enabled = false;
        reconciler
            .reconcile(Operation::CreatePort(draft))
            .await
            .unwrap();

        assert_eq!(reconciler.catalogue().len(), 2);
        assert_eq!(backend.active().len(), 1);
    }

    #[tokio::test]
    async fn test_search_reflects_reconciled_state() {
        let (reconciler, _) = memory_reconciler();
        for op in [
            port_op("tcp", "22", "accept"),
            address_op("10.0.0.0/8", "drop"),
            address_op("2001:db8::/32", "drop"),
        ] {
            reconciler.reconcile(op).await.unwrap();
        }

        let filter = RuleFilter {
            kind: Some(RuleKind::Address),
            strategy: Some(Strategy::Drop),
            ..RuleFilter::default()
        };
        let page = reconciler.search(&filter, 1, 10);
        assert_eq!(page.total, 2);
        assert!(page.items.iter().all(|r| r.kind() == RuleKind::Address));
    }
}

#[cfg(test)]
mod property_tests {
    use crate::core::rule::{PortRange, format_network};
    use crate::core::validate::{parse_address, parse_port_spec};
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;

    prop_compose! {
        fn arb_port()(port in 1u16..=65535) -> u16 {
            port
        }
    }

    prop_compose! {
        fn arb_port_range()(start in arb_port(), end in arb_port()) -> PortRange {
            PortRange {
                start: start.min(end),
                end: start.max(end),
            }
        }
    }

    fn spec_text(ranges: &[PortRange]) -> String {
        ranges
            .iter()
            .map(|r| format!("{}-{}", r.start, r.end))
            .collect::<Vec<_>>()
            .join(",")
    }

    proptest! {
        #[test]
        fn test_port_spec_normalized_form(ranges in proptest::collection::vec(arb_port_range(), 1..=15)) {
            let spec = parse_port_spec(&spec_text(&ranges)).unwrap();

            // Sorted, disjoint and non-adjacent
            for pair in spec.ranges().windows(2) {
                prop_assert!(u32::from(pair[0].end) + 1 < u32::from(pair[1].start));
            }
            for range in spec.ranges() {
                prop_assert!(range.start <= range.end);
            }
        }

        #[test]
        fn test_port_spec_covers_exactly_input(ranges in proptest::collection::vec(arb_port_range(), 1..=15)) {
            let spec = parse_port_spec(&spec_text(&ranges)).unwrap();
            let covered = |port: u16, set: &[PortRange]| {
                set.iter().any(|r| r.start <= port && port <= r.end)
            };

            // Every boundary (and its neighbours) agrees between input and output
            let samples: BTreeSet<u16> = ranges
                .iter()
                .flat_map(|r| {
                    [r.start.saturating_sub(1), r.start, r.end, r.end.saturating_add(1)]
                })
                .collect();
            for port in samples {
                prop_assert_eq!(covered(port, &ranges), covered(port, spec.ranges()));
            }
        }

        #[test]
        fn test_port_spec_normalization_idempotent(ranges in proptest::collection::vec(arb_port_range(), 1..=15)) {
            let spec = parse_port_spec(&spec_text(&ranges)).unwrap();
            let again = parse_port_spec(&spec.to_string()).unwrap();
            prop_assert_eq!(spec, again);
        }

        #[test]
        fn test_address_canonicalization_clears_host_bits(raw in any::<u32>(), prefix in 0u8..=32) {
            let text = format!("{}/{prefix}", Ipv4Addr::from(raw));
            let network = parse_address(&text, None).unwrap();

            prop_assert_eq!(network.prefix(), prefix);
            prop_assert_eq!(network.ip(), network.network());
            prop_assert_eq!(parse_address(&format_network(&network), None).unwrap(), network);
        }

        #[test]
        fn test_port_spec_never_panics(text in "[0-9,:\\- ]{0,40}") {
            let _ = parse_port_spec(&text);
        }
    }
}
