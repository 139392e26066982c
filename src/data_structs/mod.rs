//! Core data structures shared by the calling, indexing and merging code.
//!
//! - [`AllcRecord`]: one line of an ALLC file, with optional SNP arrays
//!   ([`SnpCounts`]).
//! - [`ContextPattern`]: IUPAC context filters such as `CGN` or `CHH`.
//! - [`ContextSummary`]: per-context `mc`/`cov` totals collected while
//!   calling.
//! - [`Strand`] and the [`typedef`] aliases for positions and counts.

mod context_pattern;
mod enums;
mod record;
mod summary;
pub mod typedef;

pub use context_pattern::{
    expand_patterns,
    iupac_bases,
    ContextPattern,
};
pub use enums::Strand;
pub use record::{
    AllcRecord,
    ParseRecordError,
    SnpCounts,
    ALLC_COLUMNS,
};
pub use summary::{
    ContextCounts,
    ContextSummary,
};
