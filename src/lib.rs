pub mod config;
pub mod conflict;
pub mod dag;
pub mod definition;
pub mod errors;
pub mod exec;
pub mod exit_codes;
pub mod git;
pub mod logging;
pub mod staging;
pub mod state;
pub mod worktree;
