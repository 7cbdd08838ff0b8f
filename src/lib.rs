//! hostfw - host firewall rule reconciliation
//!
//! Keeps a durable catalogue of port and address rules and the live
//! firewall (nftables or iptables) in step.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, validation, catalogue, reconciler and batches
//! - [`backend`] - Firewall engines behind one trait, with timeout and retry
//! - [`elevation`] - Privilege escalation for backend tools
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, atomic writes)
//!
//! # Guarantees
//!
//! - A rule is recorded only once the backend enforces it
//! - Failed changes are undone in reverse order, or reported as partial
//! - Batches are all-or-nothing and cancellable between operations
//! - Catalogue commits are atomic with a SHA-256 checksum sidecar

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod backend;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use backend::{BackendError, FirewallBackend, MemoryBackend};
pub use core::batch::{BatchExecutor, BatchReport, CancelToken};
pub use core::catalogue::Catalogue;
pub use core::error::{Error, Result};
pub use core::reconciler::{Applied, DriftReport, Operation, Reconciler};
pub use core::rule::{Protocol, Rule, RuleKind, Strategy};
pub use core::search::{Page, RuleFilter, SortOrder};
pub use core::validate::{AddressDraft, PortDraft};
