//! Privilege elevation for firewall tooling
//!
//! hostfw can run unprivileged and elevate only for calls into the host
//! firewall. Only the binaries listed in [`Tool`] can be elevated.
//!
//! # Elevation Strategy
//!
//! - **Root**: commands run directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `HOSTFW_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful for service accounts with sudoers NOPASSWD rules.
//! - `HOSTFW_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//! - `HOSTFW_NFT_COMMAND`, `HOSTFW_IPTABLES_COMMAND`, …: Override the binary
//!   path of a tool (e.g. a mock script).
//!
//! # Security
//!
//! - Commands are constructed without shell interpolation
//! - Elevation binaries are checked for availability
//! - Spawned processes are killed if the caller abandons them (timeouts)

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `HOSTFW_ELEVATION_METHOD`
    #[error("Invalid HOSTFW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Binaries hostfw is allowed to run with elevated privileges
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum Tool {
    #[strum(serialize = "nft")]
    Nft,
    #[strum(serialize = "iptables")]
    Iptables,
    #[strum(serialize = "ip6tables")]
    Ip6tables,
    #[strum(serialize = "iptables-save")]
    IptablesSave,
    #[strum(serialize = "ip6tables-save")]
    Ip6tablesSave,
    #[strum(serialize = "install")]
    Install,
}

impl Tool {
    /// Environment variable that overrides this tool's binary path
    pub const fn override_var(self) -> &'static str {
        match self {
            Tool::Nft => "HOSTFW_NFT_COMMAND",
            Tool::Iptables => "HOSTFW_IPTABLES_COMMAND",
            Tool::Ip6tables => "HOSTFW_IP6TABLES_COMMAND",
            Tool::IptablesSave => "HOSTFW_IPTABLES_SAVE_COMMAND",
            Tool::Ip6tablesSave => "HOSTFW_IP6TABLES_SAVE_COMMAND",
            Tool::Install => "HOSTFW_INSTALL_COMMAND",
        }
    }

    /// Program to execute, honoring the override variable
    pub fn program(self) -> String {
        std::env::var(self.override_var())
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.to_string())
    }

    /// Whether the tool can be found at all
    pub fn is_available(self) -> bool {
        let program = self.program();
        if program.contains('/') {
            std::path::Path::new(&program).is_file()
        } else {
            binary_exists(&program)
        }
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

fn via(method: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(method);
    cmd.arg(program).args(args);
    cmd
}

/// Command for a method named in `HOSTFW_ELEVATION_METHOD`
fn explicit_method(method: &str, program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    match method {
        "sudo" | "run0" | "pkexec" => {
            if binary_exists(method) {
                Ok(via(method, program, args))
            } else {
                Err(ElevationError::MethodNotAvailable(method.to_string()))
            }
        }
        _ => Err(ElevationError::InvalidMethod(method.to_string())),
    }
}

fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("HOSTFW_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(program, args));
    }

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("HOSTFW_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return explicit_method(&method, program, args);
        }
    }

    // 4. Automatic detection
    if binary_exists("run0") {
        return Ok(via("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(via("sudo", program, args))
    } else if binary_exists("pkexec") {
        Ok(via("pkexec", program, args))
    } else {
        Err(ElevationError::PkexecNotFound)
    }
}

/// Creates an elevated command for one of the approved firewall tools.
///
/// Arguments are passed directly without shell interpretation. The returned
/// command has `kill_on_drop` set so a timed-out call does not leave the
/// process running.
///
/// # Example
///
/// ```no_run
/// use hostfw::elevation::{create_elevated_command, Tool};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut cmd = create_elevated_command(Tool::Nft, &["--json", "list", "ruleset"])?;
/// let output = cmd.output().await?;
/// # Ok(())
/// # }
/// ```
pub fn create_elevated_command(tool: Tool, args: &[&str]) -> Result<Command, ElevationError> {
    let program = tool.program();
    let mut cmd = build_elevated_command(&program, args)?;
    cmd.kill_on_drop(true);
    Ok(cmd)
}
