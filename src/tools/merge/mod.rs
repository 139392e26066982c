//! Merging of sorted ALLC files.
//!
//! [`MergeEngine`] performs one k-way merge over a set of indexed sources.
//! [`merge_minibatch`] retries a merge that ran out of file descriptors as a
//! chain of smaller folds, and [`merge_allc_files`] spreads the work over
//! chromosomes.

mod batch;
mod engine;

pub use batch::{
    merge_allc_files,
    MergeConfig,
    MergeReport,
};
pub use engine::{
    fold_minibatch,
    merge_minibatch,
    union_chroms,
    EngineConfig,
    MergeEngine,
    MergeResult,
    MergeStats,
    MergeTarget,
};
