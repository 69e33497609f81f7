//! Version-control tracking for commit evidence.

pub mod git;

pub use git::GitTracker;
