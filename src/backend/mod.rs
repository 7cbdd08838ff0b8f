//! Live firewall backends
//!
//! A [`FirewallBackend`] applies and removes individual rules on the host's
//! packet filter. Every mutation is idempotent: applying a rule that is
//! already present, or removing one that is already gone, succeeds without
//! touching the ruleset. Each live rule carries its [`RuleDescriptor::tag`]
//! as a comment so [`FirewallBackend::list_active`] can map it back to a
//! catalogue id.
//!
//! - [`nftables`]: `nft --json` in a dedicated `inet` table
//! - [`iptables`]: `iptables`/`ip6tables` in a dedicated chain
//! - [`memory`]: in-process ruleset for dry runs and tests
//! - [`resilient`]: timeout and retry wrapper used by the reconciler
//!
//! Drop rules are always placed ahead of Accept rules so a wide Accept can
//! never shadow a narrower Drop under first-match evaluation.

pub mod iptables;
pub mod memory;
pub mod nftables;
pub mod resilient;

use crate::config::{AppConfig, BackendKind};
use crate::core::error::ErrorTranslation;
use crate::core::rule::RuleDescriptor;
use crate::elevation::{Tool, create_elevated_command};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

pub use iptables::IptablesBackend;
pub use memory::MemoryBackend;
pub use nftables::NftablesBackend;
pub use resilient::{Resilient, RetryPolicy};

/// Failure reported by a backend call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Control mechanism missing or permission denied
    #[error("Firewall backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the change
    #[error("Firewall backend rejected the change: {0}")]
    Rejected(String),

    /// Transient lock contention
    #[error("Firewall backend busy: {0}")]
    Busy(String),

    /// The call did not finish within the bounded timeout
    #[error("Firewall backend call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl BackendError {
    /// Whether the call may succeed if retried
    pub const fn is_transient(&self) -> bool {
        matches!(self, BackendError::Busy(_))
    }

    /// Classifies backend stderr into an error kind.
    pub fn classify(stderr: &str) -> Self {
        let message = stderr.trim().to_string();
        let lower = message.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("cache initialization failed")
            || lower.contains("no such file")
            || lower.contains("command not found")
            || lower.contains("you must be root")
        {
            return BackendError::Unavailable(message);
        }

        if lower.contains("resource busy")
            || lower.contains("xtables lock")
            || lower.contains("another app is currently holding")
            || lower.contains("try again")
        {
            return BackendError::Busy(message);
        }

        BackendError::Rejected(message)
    }

    /// Operator-facing explanation with remediation hints.
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            BackendError::Unavailable(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("no such file") || lower.contains("command not found") {
                    ErrorTranslation::new("Firewall tooling is not installed or not found in PATH")
                        .with_suggestion("Install nftables: sudo apt install nftables  (Debian/Ubuntu)")
                        .with_suggestion("Or select another backend in the configuration")
                } else {
                    ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                        .with_suggestion("Run as root, or configure sudo/run0/pkexec")
                        .with_suggestion("Set HOSTFW_ELEVATION_METHOD to force an elevation method")
                        .with_suggestion("Check that CAP_NET_ADMIN is available")
                }
            }
            BackendError::Rejected(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("syntax error") || lower.contains("could not process rule") {
                    ErrorTranslation::new("The firewall rejected the generated rule syntax")
                        .with_suggestion("Verify port numbers are between 1 and 65535")
                        .with_suggestion("Ensure IP addresses and network masks are valid")
                } else if lower.contains("does not exist") || lower.contains("not found") {
                    ErrorTranslation::new("Firewall table or chain not found")
                        .with_suggestion("Run `hostfw recover` to recreate managed rules")
                } else if lower.contains("netlink") {
                    ErrorTranslation::new("Communication error with kernel netlink interface")
                        .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                } else {
                    ErrorTranslation::new(format!("Firewall error: {msg}"))
                        .with_suggestion("Verify the backend is working: sudo nft list ruleset")
                }
            }
            BackendError::Busy(_) => ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying the firewall")
                .with_suggestion("Check for conflicting managers: systemctl status firewalld ufw"),
            BackendError::Timeout(after) => ErrorTranslation::new(format!(
                "Firewall call timed out after {}ms",
                after.as_millis()
            ))
            .with_suggestion("Check system load: uptime")
            .with_suggestion("Raise call_timeout_secs in the configuration"),
        }
    }
}

/// Capability over a live firewall engine
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &'static str;

    /// Enforces a rule. Already present is success.
    async fn apply_rule(&self, rule: &RuleDescriptor) -> Result<(), BackendError>;

    /// Stops enforcing a rule. Already absent is success.
    async fn remove_rule(&self, rule: &RuleDescriptor) -> Result<(), BackendError>;

    /// Rules currently enforced and tagged as ours
    async fn list_active(&self) -> Result<Vec<RuleDescriptor>, BackendError>;

    /// Saves the live ruleset so it survives a restart
    async fn persist(&self) -> Result<(), BackendError>;
}

/// Probes for an available engine, preferring nftables.
pub fn detect_backend() -> Result<BackendKind, BackendError> {
    if Tool::Nft.is_available() {
        return Ok(BackendKind::Nftables);
    }
    if Tool::Iptables.is_available() {
        return Ok(BackendKind::Iptables);
    }
    Err(BackendError::Unavailable(
        "no firewall backend available (nft or iptables required)".to_string(),
    ))
}

/// Creates the backend selected by configuration.
pub fn create_backend(config: &AppConfig) -> Result<Box<dyn FirewallBackend>, BackendError> {
    let kind = match config.backend {
        BackendKind::Auto => detect_backend()?,
        other => other,
    };
    debug!("Selected firewall backend: {kind}");

    match kind {
        BackendKind::Nftables => Ok(Box::new(NftablesBackend::new(
            &config.nft_table,
            config.nft_persist_path.clone(),
        ))),
        BackendKind::Iptables => Ok(Box::new(IptablesBackend::new(
            &config.iptables_chain,
            config.iptables_persist_v4.clone(),
            config.iptables_persist_v6.clone(),
        ))),
        BackendKind::Memory => Ok(Box::new(MemoryBackend::new())),
        BackendKind::Auto => Err(BackendError::Unavailable(
            "backend detection returned auto".to_string(),
        )),
    }
}

/// Runs an approved tool, optionally feeding `stdin`, and returns stdout.
///
/// Spawn failures and elevation failures are [`BackendError::Unavailable`];
/// a non-zero exit is classified from stderr.
pub(crate) async fn run_tool(
    tool: Tool,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<String, BackendError> {
    use std::process::Stdio;

    let mut cmd = create_elevated_command(tool, args)
        .map_err(|e| BackendError::Unavailable(format!("privilege escalation unavailable: {e}")))?;
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| BackendError::Unavailable(format!("failed to spawn {tool}: {e}")))?;

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        use tokio::io::AsyncWriteExt;
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|e| BackendError::Rejected(format!("failed to write to {tool} stdin: {e}")))?;
        // Closing stdin lets the tool start processing
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BackendError::Rejected(format!("failed to wait for {tool}: {e}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let err = BackendError::classify(&stderr);
        warn!("{tool} {} failed ({:?}): {}", args.join(" "), output.status.code(), stderr.trim());
        Err(err)
    }
}

/// Writes `contents` to a temporary file and installs it at `dest` with
/// elevated privileges.
pub(crate) async fn install_file(contents: &str, dest: &std::path::Path) -> Result<(), BackendError> {
    use std::io::Write;

    let mut temp = tempfile::NamedTempFile::new()
        .map_err(|e| BackendError::Rejected(format!("failed to create temp file: {e}")))?;
    temp.write_all(contents.as_bytes())
        .and_then(|()| temp.flush())
        .map_err(|e| BackendError::Rejected(format!("failed to write temp file: {e}")))?;

    let source = temp
        .path()
        .to_str()
        .ok_or_else(|| BackendError::Rejected("invalid temp path".to_string()))?
        .to_string();
    let dest = dest
        .to_str()
        .ok_or_else(|| BackendError::Rejected(format!("invalid persist path {}", dest.display())))?;

    // Keep the temp file alive until install has copied it
    run_tool(Tool::Install, &["-D", "-m", "0644", &source, dest], None).await?;
    drop(temp);
    Ok(())
}

/// Rule comment: identity tag, then the sanitized description if any.
pub(crate) fn rule_comment(rule: &RuleDescriptor) -> String {
    if rule.comment.is_empty() {
        rule.tag()
    } else {
        format!("{} {}", rule.tag(), rule.comment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_permission_errors() {
        assert!(matches!(
            BackendError::classify("Error: Operation not permitted"),
            BackendError::Unavailable(_)
        ));
        assert!(matches!(
            BackendError::classify("netlink: Error: cache initialization failed"),
            BackendError::Unavailable(_)
        ));
    }

    #[test]
    fn test_classify_lock_contention_is_transient() {
        let err = BackendError::classify(
            "Another app is currently holding the xtables lock. Perhaps you want to use the -w option?",
        );
        assert!(matches!(err, BackendError::Busy(_)));
        assert!(err.is_transient());
        assert!(BackendError::classify("Error: Could not process rule: Device or resource busy").is_transient());
    }

    #[test]
    fn test_classify_fallback_is_rejected() {
        let err = BackendError::classify("Error: syntax error, unexpected newline\n");
        assert_eq!(
            err,
            BackendError::Rejected("Error: syntax error, unexpected newline".to_string())
        );
        assert!(!err.is_transient());
        assert!(!BackendError::Timeout(Duration::from_secs(5)).is_transient());
    }

    #[test]
    fn test_translate_suggests_remediation() {
        let t = BackendError::Unavailable("command not found: nft".into()).translate();
        assert!(t.user_message.contains("not installed"));

        let t = BackendError::Rejected("Error: syntax error".into()).translate();
        assert!(t.suggestions.iter().any(|s| s.contains("65535")));

        let t = BackendError::Timeout(Duration::from_secs(5)).translate();
        assert!(t.user_message.contains("5000ms"));
    }

    #[test]
    fn test_memory_backend_from_config() {
        let config = AppConfig {
            backend: BackendKind::Memory,
            ..AppConfig::default()
        };
        let backend = create_backend(&config).unwrap();
        assert_eq!(backend.name(), "memory");
    }
}
