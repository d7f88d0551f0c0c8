//! Unified error interface for Apiary crates.
//!
//! Every error enum in the workspace implements [`ErrorCode`] so that the
//! scheduler's taxonomy (soft/requeue vs. terminal/dead-letter) can be
//! driven by machine-readable codes instead of string matching on
//! `Display` output.
//!
//! # Code Format
//!
//! - UPPER_SNAKE_CASE, stable once published (wire contract with drones
//!   and operator tooling)
//! - prefixed by layer: `TASK_`, `BUS_`, `TRACK_`, `LIMIT_`, `SCHED_`,
//!   `INTERVENTION_`, `CONFIG_`
//!
//! # Recoverability
//!
//! `is_recoverable` answers "may a retry or requeue make progress?".
//! Denied domain leases and missing personas are recoverable; a duplicate
//! command id or a whitelist rejection is not.

/// Machine-readable error code interface.
///
/// # Example
///
/// ```
/// use apiary_types::ErrorCode;
///
/// #[derive(Debug)]
/// enum DispatchError {
///     DroneGone,
///     DuplicateCommand,
/// }
///
/// impl ErrorCode for DispatchError {
///     fn code(&self) -> &'static str {
///         match self {
///             Self::DroneGone => "SCHED_DRONE_GONE",
///             Self::DuplicateCommand => "SCHED_DUPLICATE_COMMAND",
///         }
///     }
///
///     fn is_recoverable(&self) -> bool {
///         matches!(self, Self::DroneGone)
///     }
/// }
///
/// assert_eq!(DispatchError::DroneGone.code(), "SCHED_DRONE_GONE");
/// assert!(DispatchError::DroneGone.is_recoverable());
/// ```
pub trait ErrorCode {
    /// Returns the stable, UPPER_SNAKE_CASE code for this error.
    fn code(&self) -> &'static str;

    /// Returns whether a retry or requeue may make progress.
    fn is_recoverable(&self) -> bool;
}

/// Asserts that an error code follows workspace conventions.
///
/// # Panics
///
/// Panics when the code is empty, not UPPER_SNAKE_CASE, or missing the
/// expected layer prefix. Intended for use in each error module's tests.
pub fn assert_error_code<E: ErrorCode>(err: &E, expected_prefix: &str) {
    let code = err.code();

    assert!(!code.is_empty(), "error code must not be empty");
    assert!(
        code.starts_with(expected_prefix),
        "error code '{}' must start with prefix '{}'",
        code,
        expected_prefix
    );
    assert!(
        is_upper_snake_case(code),
        "error code '{}' must be UPPER_SNAKE_CASE",
        code
    );
}

/// Asserts conventions over every variant of an error enum at once.
pub fn assert_error_codes<E: ErrorCode>(errors: &[E], expected_prefix: &str) {
    for err in errors {
        assert_error_code(err, expected_prefix);
    }
}

fn is_upper_snake_case(s: &str) -> bool {
    if s.is_empty() || s.starts_with('_') || s.ends_with('_') || s.contains("__") {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
