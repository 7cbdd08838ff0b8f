//! hostfw - host firewall rule reconciliation
//!
//! Command-line front end over the reconciler. Every mutating command goes
//! through validation, conflict checks and the backend before the catalogue
//! is touched; failures are reported with operator hints.
//!
//! # Usage
//!
//! ```bash
//! hostfw add-port tcp 22 --description ssh
//! hostfw add-address 203.0.113.0/24 --strategy drop
//! hostfw search --query 8080
//! hostfw update-port <ID> tcp 2222
//! hostfw delete <ID> <ID>
//! hostfw batch changes.json          # Ctrl-C cancels and rolls back
//! hostfw recover                     # Re-apply drifted rules
//! hostfw status
//! hostfw config --backend iptables --write
//! ```

use clap::{Args, Parser, Subcommand};
use hostfw::backend::create_backend;
use hostfw::config::{
    AppConfig, BackendKind, ConfigError, default_config_path, load_config, save_config,
};
use hostfw::core::error::translate;
use hostfw::utils::{ensure_dirs, get_state_dir, truncate_string};
use hostfw::{
    AddressDraft, Applied, BatchExecutor, CancelToken, Catalogue, Error, Operation, PortDraft,
    Reconciler, Result, Rule, RuleFilter, RuleKind, SortOrder, Strategy,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Level, warn};
use uuid::Uuid;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "hostfw")]
#[command(about = "Declarative host firewall rules for nftables and iptables", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Configuration file (default: config.json in the data directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Override the configured backend (auto, nftables, iptables, memory)
    #[arg(long, global = true)]
    backend: Option<BackendKind>,
    /// Override the configured catalogue file
    #[arg(long, global = true, value_name = "PATH")]
    catalogue: Option<PathBuf>,
}

#[derive(Args)]
struct PortArgs {
    /// tcp or udp
    protocol: String,
    /// Port, range or comma-set, e.g. 22, 8000-9000, 22,80,443
    ports: String,
    #[arg(short, long, default_value = "accept")]
    strategy: String,
    /// Restrict to a source address or CIDR
    #[arg(long)]
    source: Option<String>,
    #[arg(short, long, default_value = "")]
    description: String,
    /// Record the rule without enforcing it
    #[arg(long)]
    disabled: bool,
}

impl PortArgs {
    fn into_draft(self) -> PortDraft {
        PortDraft {
            protocol: self.protocol,
            port_spec: self.ports,
            strategy: self.strategy,
            source: self.source,
            description: self.description,
            enabled: !self.disabled,
        }
    }
}

#[derive(Args)]
struct AddressArgs {
    /// IP address or CIDR
    address: String,
    #[arg(short, long, default_value = "drop")]
    strategy: String,
    /// Require the address to be ipv4 or ipv6
    #[arg(long)]
    family: Option<String>,
    /// Scope to tcp or udp
    #[arg(long)]
    protocol: Option<String>,
    /// Scope to a port spec (requires --protocol)
    #[arg(long)]
    port: Option<String>,
    #[arg(short, long, default_value = "")]
    description: String,
    /// Record the rule without enforcing it
    #[arg(long)]
    disabled: bool,
}

impl AddressArgs {
    fn into_draft(self) -> AddressDraft {
        AddressDraft {
            address: self.address,
            strategy: self.strategy,
            family: self.family,
            protocol: self.protocol,
            port: self.port,
            description: self.description,
            enabled: !self.disabled,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List rules matching a filter
    Search {
        #[arg(long)]
        kind: Option<RuleKind>,
        #[arg(long)]
        strategy: Option<Strategy>,
        /// Only enabled (true) or disabled (false) rules
        #[arg(long)]
        enabled: Option<bool>,
        /// Substring of description, address or port spec
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long, default_value = "newest_first")]
        order: SortOrder,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 50)]
        page_size: usize,
        /// Print the page as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a port rule
    AddPort(PortArgs),
    /// Create an address rule
    AddAddress(AddressArgs),
    /// Replace a port rule
    UpdatePort {
        id: Uuid,
        #[command(flatten)]
        rule: PortArgs,
    },
    /// Replace an address rule
    UpdateAddress {
        id: Uuid,
        #[command(flatten)]
        rule: AddressArgs,
    },
    /// Delete one or more rules, all or nothing
    Delete {
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },
    /// Apply a JSON array of operations atomically
    Batch { file: PathBuf },
    /// Re-apply catalogue rules missing from the live firewall
    Recover,
    /// Show build, backend and catalogue status
    Status,
    /// Show the effective configuration
    Config {
        /// Save it, global overrides included, to the configuration file
        #[arg(long)]
        write: bool,
    },
}

impl Commands {
    const fn mutates(&self) -> bool {
        matches!(
            self,
            Commands::AddPort(_)
                | Commands::AddAddress(_)
                | Commands::UpdatePort { .. }
                | Commands::UpdateAddress { .. }
                | Commands::Delete { .. }
                | Commands::Batch { .. }
        )
    }
}

fn main() -> ExitCode {
    let _ = ensure_dirs();
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli.global, cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let translation = translate(&e);
            eprintln!("Error: {}", translation.user_message);
            if translation.user_message != e.to_string() {
                eprintln!("  ({e})");
            }
            for suggestion in translation.suggestions {
                eprintln!("  hint: {suggestion}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    // Log to file when the state directory is writable, else stderr
    if let Some(mut log_path) = get_state_dir() {
        log_path.push("hostfw.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads the configuration file and applies the global overrides.
async fn effective_config(global: &GlobalArgs) -> Result<(PathBuf, AppConfig)> {
    let config_path = global
        .config
        .clone()
        .or_else(default_config_path)
        .ok_or(ConfigError::NoDataDir)?;
    let mut config = load_config(&config_path).await?;
    if let Some(backend) = global.backend {
        config.backend = backend;
    }
    if let Some(path) = &global.catalogue {
        config.catalogue_path = Some(path.clone());
    }
    Ok((config_path, config))
}

async fn build_reconciler(config: &AppConfig) -> Result<Reconciler> {
    let catalogue = Catalogue::open(config.catalogue_path()?).await?;
    let backend = create_backend(config)?;
    Ok(Reconciler::new(
        Arc::new(catalogue),
        backend,
        config.retry_policy(),
    ))
}

async fn handle_cli(global: GlobalArgs, command: Commands) -> Result<()> {
    let (config_path, config) = effective_config(&global).await?;
    if let Commands::Config { write } = command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        if write {
            save_config(&config, &config_path).await?;
            println!("✓ Saved {}", config_path.display());
        }
        return Ok(());
    }
    let reconciler = build_reconciler(&config).await?;

    // Resolve drift left by an earlier crash before accepting new mutations
    if command.mutates() {
        let report = reconciler.recover().await?;
        if !report.is_clean() {
            warn!(
                "Startup drift: {} re-applied, {} replaced, {} removed, {} unexpected, {} failed",
                report.reapplied.len(),
                report.replaced.len(),
                report.removed.len(),
                report.unexpected.len(),
                report.failed.len()
            );
        }
    }

    match command {
        Commands::Search {
            kind,
            strategy,
            enabled,
            query,
            order,
            page,
            page_size,
            json,
        } => {
            let filter = RuleFilter {
                kind,
                strategy,
                enabled,
                query,
                order,
            };
            let page = reconciler.search(&filter, page, page_size);
            if json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                let pages = page.total.div_ceil(page.page_size).max(1);
                println!("{} rule(s), page {}/{pages}", page.total, page.page);
                for rule in &page.items {
                    print_rule(rule);
                }
            }
        }
        Commands::AddPort(args) => {
            let applied = reconciler
                .reconcile(Operation::CreatePort(args.into_draft()))
                .await?;
            print_applied(&applied);
        }
        Commands::AddAddress(args) => {
            let applied = reconciler
                .reconcile(Operation::CreateAddress(args.into_draft()))
                .await?;
            print_applied(&applied);
        }
        Commands::UpdatePort { id, rule } => {
            let applied = reconciler
                .reconcile(Operation::UpdatePort {
                    id,
                    rule: rule.into_draft(),
                })
                .await?;
            print_applied(&applied);
        }
        Commands::UpdateAddress { id, rule } => {
            let applied = reconciler
                .reconcile(Operation::UpdateAddress {
                    id,
                    rule: rule.into_draft(),
                })
                .await?;
            print_applied(&applied);
        }
        Commands::Delete { ids } => {
            let ids: BTreeSet<Uuid> = ids.into_iter().collect();
            let applied = reconciler.reconcile(Operation::DeleteSet { ids }).await?;
            print_applied(&applied);
        }
        Commands::Batch { file } => run_batch(&reconciler, &file).await?,
        Commands::Recover => {
            let report = reconciler.recover().await?;
            if report.is_clean() {
                println!("✓ Catalogue and firewall are in sync.");
            } else {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            if !report.failed.is_empty() {
                return Err(Error::Internal(format!(
                    "{} rule(s) could not be reconciled",
                    report.failed.len()
                )));
            }
        }
        Commands::Status => print_status(&reconciler),
        Commands::Config { .. } => {}
    }
    Ok(())
}

async fn run_batch(reconciler: &Reconciler, file: &std::path::Path) -> Result<()> {
    let json = tokio::fs::read_to_string(file).await?;
    let operations: Vec<Operation> = serde_json::from_str(&json)?;

    let cancel = CancelToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling batch");
                cancel.cancel();
            }
        })
    };
    let report = BatchExecutor::new(reconciler)
        .execute(operations, &cancel)
        .await;
    watcher.abort();

    if !report.persisted {
        println!("Note: backend state was not persisted; changes may not survive a reboot.");
    }
    if let Some(failure) = &report.failure {
        for outcome in &failure.compensations {
            match &outcome.error {
                None => println!("  ↺ {} (operation {})", outcome.description, outcome.index),
                Some(e) => println!("  ✗ {} (operation {}): {e}", outcome.description, outcome.index),
            }
        }
    }
    for item in report.into_result()? {
        print!("[{}] ", item.index);
        print_applied(&item.applied);
    }
    Ok(())
}

fn print_rule(rule: &Rule) {
    let flags = match (rule.enabled, rule.divergent) {
        (true, false) => "",
        (false, false) => " [disabled]",
        (true, true) => " [divergent]",
        (false, true) => " [disabled, divergent]",
    };
    println!(
        "  {}  {:<6} {:<7} {}{flags}  {}",
        rule.id,
        rule.strategy,
        rule.kind(),
        rule.target,
        truncate_string(&rule.description, 40)
    );
}

fn print_applied(applied: &Applied) {
    match applied {
        Applied::Created { rule } => {
            println!("✓ Created rule {}", rule.id);
            print_rule(rule);
        }
        Applied::Updated { after, .. } => {
            println!("✓ Updated rule {}", after.id);
            print_rule(after);
        }
        Applied::Deleted { rules } => {
            println!("✓ Deleted {} rule(s)", rules.len());
            for rule in rules {
                print_rule(rule);
            }
        }
    }
}

fn print_status(reconciler: &Reconciler) {
    println!("hostfw {} ({})", build::PKG_VERSION, build::SHORT_COMMIT);
    println!("Built: {}", build::BUILD_TIME);
    println!("Backend: {}", reconciler.backend_name());
    if let Some(path) = reconciler.catalogue().path() {
        println!("Catalogue: {}", path.display());
    }
    if !nix::unistd::getuid().is_root() {
        println!("Note: Not running as root. Backend tools run through sudo/pkexec/run0.");
    }

    let rules = reconciler.catalogue().list();
    let enabled = rules.iter().filter(|r| r.enabled).count();
    let divergent: Vec<&Rule> = rules.iter().filter(|r| r.divergent).collect();
    println!(
        "Rules: {} ({enabled} enabled, {} disabled)",
        rules.len(),
        rules.len() - enabled
    );
    if !divergent.is_empty() {
        println!("Divergent rules (run `hostfw recover`):");
        for rule in divergent {
            print_rule(rule);
        }
    }
}
