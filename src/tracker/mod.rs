//! Version-control emission for finalized issues.

pub mod git;

pub use git::GitCommitter;
