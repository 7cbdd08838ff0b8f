//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::backend::{MemoryBackend, RetryPolicy};
use crate::core::catalogue::Catalogue;
use crate::core::reconciler::Operation;
use crate::core::reconciler::Reconciler;
use crate::core::rule::{Protocol, Rule, Strategy};
use crate::core::validate::{AddressDraft, PortDraft, RuleDraft, validate};
use crate::elevation::Tool;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;

/// One-time initialization flag for the mock backend tools
static MOCK_TOOLS_INIT: Once = Once::new();

/// Points every firewall tool at the mock scripts under `tests/`.
///
/// Sets the `HOSTFW_*_COMMAND` overrides, disables elevation and gives the
/// scripts a per-process state directory, which is returned. Safe to call
/// from every test; initialization happens once and no guard is held, so
/// async tests can `.await` freely.
///
/// The mocks keep one set of files per nft table or iptables chain, so each
/// test should use its own table or chain name.
///
/// ```ignore
/// let state = setup_mock_backends();
/// let backend = NftablesBackend::new("t_apply", state.join("t_apply.nft"));
/// ```
pub fn setup_mock_backends() -> PathBuf {
    let state = std::env::temp_dir().join(format!("hostfw-mock-{}", std::process::id()));
    MOCK_TOOLS_INIT.call_once(|| {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests");
        let scripts = [
            (Tool::Nft, "mock_nft.sh"),
            (Tool::Iptables, "mock_iptables.sh"),
            (Tool::IptablesSave, "mock_iptables.sh"),
            (Tool::Ip6tables, "mock_ip6tables.sh"),
            (Tool::Ip6tablesSave, "mock_ip6tables.sh"),
        ];
        // A reused pid must not inherit another run's fixtures
        let _ = std::fs::remove_dir_all(&state);
        std::fs::create_dir_all(&state).unwrap();
        for (tool, script) in scripts {
            let path = dir.join(script);
            // Checkouts do not always keep the executable bit
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755));
            // SAFETY: This is only called once due to Once, and only in test code.
            // No other test changes these variables.
            unsafe {
                std::env::set_var(tool.override_var(), &path);
            }
        }
        // SAFETY: As above
        unsafe {
            std::env::set_var("HOSTFW_TEST_NO_ELEVATION", "1");
            std::env::set_var("HOSTFW_MOCK_STATE", &state);
        }
    });
    state
}

/// Backend calls the mocks logged for one nft table or iptables chain
pub fn mock_log(state: &std::path::Path, name: &str) -> String {
    std::fs::read_to_string(state.join(format!("{name}.log"))).unwrap_or_default()
}

/// Retry policy with short delays so failure tests stay fast
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        base_delay: Duration::from_millis(1),
        timeout: Duration::from_millis(200),
    }
}

/// Reconciler over an in-memory catalogue and backend.
///
/// The returned backend shares state with the one inside the reconciler.
pub fn memory_reconciler() -> (Reconciler, MemoryBackend) {
    let backend = MemoryBackend::new();
    let reconciler = Reconciler::new(
        Arc::new(Catalogue::in_memory()),
        Box::new(backend.clone()),
        fast_policy(),
    );
    (reconciler, backend)
}

pub fn port_op(protocol: &str, port_spec: &str, strategy: &str) -> Operation {
    Operation::CreatePort(PortDraft::new(protocol, port_spec, strategy))
}

pub fn address_op(address: &str, strategy: &str) -> Operation {
    Operation::CreateAddress(AddressDraft::new(address, strategy))
}

/// Validated port rule record, not stored anywhere
pub fn port_rule(protocol: Protocol, port_spec: &str, strategy: Strategy) -> Rule {
    let draft = PortDraft::new(protocol.as_str(), port_spec, strategy.to_string());
    Rule::create(validate(&RuleDraft::Port(draft)).unwrap())
}

/// Validated address rule record, not stored anywhere
pub fn address_rule(address: &str, strategy: Strategy) -> Rule {
    let draft = AddressDraft::new(address, strategy.to_string());
    Rule::create(validate(&RuleDraft::Address(draft)).unwrap())
}
