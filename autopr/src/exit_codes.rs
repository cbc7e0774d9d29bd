//! Stable exit codes for the autopr CLI.

/// Every batch ran; cycles ended merged, approved, exhausted, committed or with no changes.
pub const OK: i32 = 0;
/// Bad arguments, configuration, or environment (missing tools, not a repository).
pub const ENVIRONMENT: i32 = 1;
/// A one-shot run where at least one cycle failed.
pub const CYCLE_FAILED: i32 = 3;
/// Second Ctrl-C.
pub const INTERRUPTED: i32 = 130;
