//! Core rule management functionality
//!
//! - [`rule`]: Rule records, targets and the backend descriptor
//! - [`validate`]: Draft validation and normalization
//! - [`catalogue`]: Durable rule catalogue
//! - [`search`]: Filtered, paginated queries
//! - [`reconciler`]: Applying mutations to backend and catalogue in step
//! - [`batch`]: All-or-nothing operation batches
//! - [`error`]: Error types and user-facing translations

pub mod batch;
pub mod catalogue;
pub mod error;
pub mod reconciler;
pub mod rule;
pub mod search;
pub mod validate;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
