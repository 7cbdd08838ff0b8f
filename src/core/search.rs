//! Filtered, paginated search over the catalogue
//!
//! Search runs against the catalogue's last committed state under its read
//! lock only, so it never waits on the host mutation lock.

use crate::core::catalogue::Catalogue;
use crate::core::rule::{Rule, RuleKind, Strategy};
use serde::{Deserialize, Serialize};

/// Largest page a single search returns
pub const MAX_PAGE_SIZE: usize = 500;

/// Ordering on `created_at`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::EnumString, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleFilter {
    pub kind: Option<RuleKind>,
    pub strategy: Option<Strategy>,
    pub enabled: Option<bool>,
    /// Case-insensitive substring of description, address or port spec
    pub query: Option<String>,
    pub order: SortOrder,
}

impl RuleFilter {
    pub fn matches(&self, rule: &Rule) -> bool {
        if self.kind.is_some_and(|kind| rule.kind() != kind)
            || self.strategy.is_some_and(|s| rule.strategy != s)
            || self.enabled.is_some_and(|e| rule.enabled != e)
        {
            return false;
        }
        match self.query.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(query) => rule.search_text().contains(&query.to_lowercase()),
        }
    }
}

/// One page of search results
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    /// Number of rules matching the filter, across all pages
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub items: Vec<Rule>,
}

/// Returns page `page` (1-based) of rules matching `filter`.
///
/// `page_size` is clamped to `1..=MAX_PAGE_SIZE`; page 0 is treated as page 1.
pub fn search(catalogue: &Catalogue, filter: &RuleFilter, page: usize, page_size: usize) -> Page {
    let page = page.max(1);
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

    catalogue.read(|rules| {
        let mut hits: Vec<&Rule> = rules.values().filter(|r| filter.matches(r)).collect();
        // Ties on created_at fall back to id so paging is deterministic
        hits.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if filter.order == SortOrder::NewestFirst {
            hits.reverse();
        }

        let total = hits.len();
        let items = hits
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .cloned()
            .collect();
        Page {
            total,
            page,
            page_size,
            items,
        }
    })
}
