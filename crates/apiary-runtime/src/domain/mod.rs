//! Domain politeness: registrable-domain derivation and per-domain
//! leasing.
//!
//! The scheduler derives a registrable domain from each task's source
//! URL via [`PublicSuffixIndex`] at submission, then leases concurrency
//! credit from the [`DomainLimiter`] at dispatch. Leases ride with the
//! command through the lifecycle tracker and are released exactly once
//! on completion, failure or drone disconnect.

mod limiter;
mod suffix;

pub use limiter::{DenyReason, DomainLease, DomainLimiter};
pub use suffix::{PublicSuffixIndex, PUBLIC_SUFFIX_LIST_PATH_VAR};
