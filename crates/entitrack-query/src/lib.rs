//! Query construction for entitrack.
//!
//! `entitrack-query` builds the small SQL subset the session needs: a SELECT
//! over one table with a conjunction of simple predicates, ordering, limit and
//! offset, and the matching `COUNT(*)`. Backends execute the result through
//! [`Storage::query`](entitrack_core::Storage::query) and
//! [`Storage::execute_scalar`](entitrack_core::Storage::execute_scalar).

pub mod clause;
pub mod select;

pub use clause::{Comparison, Condition, Limit, Offset, OrderBy, OrderDirection, Where};
pub use select::{Select, select};
