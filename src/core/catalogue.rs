//! Durable rule catalogue
//!
//! The catalogue is the record of every rule definition, enabled or not. It
//! is an in-memory table keyed by rule id, optionally backed by a JSON file:
//!
//! ```json
//! { "version": 1, "rules": [ { "id": "…", "kind": "port", … } ] }
//! ```
//!
//! with a sibling `<file>.sha256` checksum. A checksum mismatch only warns,
//! so a hand-edited catalogue still loads.
//!
//! Every mutation is a commit: the next table is built from a copy, written
//! to disk atomically, and only then swapped in. Readers never observe a
//! state that is not on disk, and a failed write leaves the table untouched.
//! Once the catalogue file has landed the commit stands; the checksum
//! sidecar is written after it and a failure there only warns.
//!
//! Several processes may share one catalogue file. The reconciler holds an
//! exclusive lock on [`Catalogue::lock_path`] while mutating and calls
//! [`Catalogue::reload`] after taking it.

use crate::core::error::{CatalogueError, Error, Result};
use crate::core::rule::{MAX_RULES, Rule, RuleTuple};
use crate::utils::write_atomic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Current catalogue file format version
pub const CATALOGUE_VERSION: u32 = 1;

type Table = BTreeMap<Uuid, Rule>;

#[derive(Serialize, Deserialize)]
struct CatalogueFile {
    version: u32,
    rules: Vec<Rule>,
}

pub struct Catalogue {
    rules: RwLock<Table>,
    path: Option<PathBuf>,
    /// Serializes commits so concurrent writers cannot lose updates
    commit_lock: tokio::sync::Mutex<()>,
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn checksum_path(path: &Path) -> PathBuf {
    sidecar_path(path, ".sha256")
}

fn checksum(json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl Catalogue {
    /// Catalogue without persistence (dry runs and tests)
    pub fn in_memory() -> Self {
        Self {
            rules: RwLock::new(Table::new()),
            path: None,
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Opens a file-backed catalogue; a missing file is an empty catalogue.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rules = Self::load(&path).await?;
        Ok(Self {
            rules: RwLock::new(rules),
            path: Some(path),
            commit_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Re-reads the backing file, picking up commits made by other processes.
    pub async fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _commit = self.commit_lock.lock().await;
        let rules = Self::load(path).await?;
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = rules;
        Ok(())
    }

    async fn load(path: &Path) -> Result<Table> {
        let rules = match tokio::fs::read_to_string(path).await {
            Ok(json) => Self::parse(path, &json).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No catalogue at {}, starting empty", path.display());
                Table::new()
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} rules from {}", rules.len(), path.display());
        Ok(rules)
    }

    async fn parse(path: &Path, json: &str) -> Result<Table> {
        // Verify checksum if present (warns but doesn't fail for manually edited catalogues)
        if let Ok(expected) = tokio::fs::read_to_string(checksum_path(path)).await {
            let actual = checksum(json);
            if expected.trim() != actual {
                warn!(
                    "Catalogue {} checksum mismatch (expected: {}, got: {})",
                    path.display(),
                    expected.trim(),
                    actual
                );
            }
        }

        let file: CatalogueFile = serde_json::from_str(json)
            .map_err(|e| CatalogueError::Corrupted(format!("{}: {e}", path.display())))?;
        if file.version != CATALOGUE_VERSION {
            return Err(CatalogueError::VersionMismatch {
                found: file.version,
                expected: CATALOGUE_VERSION,
            }
            .into());
        }
        // Validate rule count to prevent memory exhaustion
        if file.rules.len() > MAX_RULES {
            return Err(CatalogueError::TooManyRules {
                count: file.rules.len(),
                max: MAX_RULES,
            }
            .into());
        }

        let mut table = Table::new();
        for rule in file.rules {
            let id = rule.id;
            if table.insert(id, rule).is_some() {
                return Err(CatalogueError::DuplicateId(id).into());
            }
        }
        Ok(table)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Lock file guarding mutations of a file-backed catalogue
    pub fn lock_path(&self) -> Option<PathBuf> {
        self.path.as_deref().map(|path| sidecar_path(path, ".lock"))
    }

    /// Runs `f` against the last committed table under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&BTreeMap<Uuid, Rule>) -> R) -> R {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        f(&rules)
    }

    pub fn get(&self, id: Uuid) -> Option<Rule> {
        self.read(|rules| rules.get(&id).cloned())
    }

    pub fn list(&self) -> Vec<Rule> {
        self.read(|rules| rules.values().cloned().collect())
    }

    pub fn enabled(&self) -> Vec<Rule> {
        self.read(|rules| rules.values().filter(|r| r.enabled).cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.read(BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of an enabled rule enforcing `tuple`, other than `exclude`
    pub fn find_conflict(&self, tuple: &RuleTuple, exclude: Option<Uuid>) -> Option<Uuid> {
        self.read(|rules| {
            rules
                .values()
                .filter(|r| r.enabled && Some(r.id) != exclude)
                .find(|r| r.strategy == tuple.strategy && r.target == tuple.target)
                .map(|r| r.id)
        })
    }

    /// Adds a new rule.
    pub async fn insert(&self, rule: Rule) -> Result<()> {
        self.commit(|table| {
            if table.contains_key(&rule.id) {
                return Err(CatalogueError::DuplicateId(rule.id).into());
            }
            if table.len() >= MAX_RULES {
                return Err(CatalogueError::TooManyRules {
                    count: table.len() + 1,
                    max: MAX_RULES,
                }
                .into());
            }
            table.insert(rule.id, rule);
            Ok(())
        })
        .await
    }

    /// Replaces an existing rule and returns the previous record.
    pub async fn replace(&self, rule: Rule) -> Result<Rule> {
        self.commit(|table| match table.get_mut(&rule.id) {
            Some(slot) => Ok(std::mem::replace(slot, rule)),
            None => Err(Error::NotFound(rule.id)),
        })
        .await
    }

    /// Removes every rule in `ids`, all or nothing, and returns the records.
    pub async fn remove(&self, ids: &[Uuid]) -> Result<Vec<Rule>> {
        self.commit(|table| {
            if let Some(missing) = ids.iter().find(|id| !table.contains_key(id)) {
                return Err(Error::NotFound(*missing));
            }
            Ok(ids.iter().filter_map(|id| table.remove(id)).collect())
        })
        .await
    }

    /// Puts previously removed records back under their original ids.
    pub async fn reinstate(&self, rules: Vec<Rule>) -> Result<()> {
        self.commit(|table| {
            for rule in rules {
                table.insert(rule.id, rule);
            }
            Ok(())
        })
        .await
    }

    /// Flags records whose backend state could not be confirmed.
    ///
    /// With `disable`, the records are also disabled so the catalogue stops
    /// claiming they are enforced.
    pub async fn mark_divergent(&self, ids: &[Uuid], disable: bool) -> Result<()> {
        self.commit(|table| {
            for id in ids {
                if let Some(rule) = table.get_mut(id) {
                    rule.divergent = true;
                    if disable {
                        rule.enabled = false;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Clears the divergence flag on records verified to be in sync.
    pub async fn clear_divergent(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.commit(|table| {
            for id in ids {
                if let Some(rule) = table.get_mut(id) {
                    rule.divergent = false;
                }
            }
            Ok(())
        })
        .await
    }

    async fn commit<R>(&self, change: impl FnOnce(&mut Table) -> Result<R>) -> Result<R> {
        let _commit = self.commit_lock.lock().await;

        let mut next = self.read(Table::clone);
        let result = change(&mut next)?;

        if let Some(path) = &self.path {
            let file = CatalogueFile {
                version: CATALOGUE_VERSION,
                rules: next.values().cloned().collect(),
            };
            let json = serde_json::to_string_pretty(&file)?;
            write_atomic(path, json.as_bytes()).await?;
            // The catalogue itself has landed; the checksum is advisory
            let sidecar = checksum_path(path);
            if let Err(e) = write_atomic(&sidecar, checksum(&json).as_bytes()).await {
                warn!("Failed to write checksum {}: {e}", sidecar.display());
            }
        }

        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(result)
    }
}
