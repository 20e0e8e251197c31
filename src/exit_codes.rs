//! Stable exit codes for orchard CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// One or more specs failed, or an operational error occurred.
pub const FAILED: i32 = 1;
/// The run is suspended on a merge conflict awaiting `merge --continue`.
pub const SUSPENDED: i32 = 2;
/// Invalid arguments or an invalid definition document.
pub const INVALID: i32 = 3;
