//! Commits: from "write these modifications into branch X" to one
//! feature-writer call along the branch's table chain.

mod manager;

pub use manager::{CommitManager, TableChain};
