use std::path::{
    Path,
    PathBuf,
};

use thiserror::Error;

use crate::data_structs::typedef::PosType;

/// Failures that callers are expected to recognise and react to.
///
/// These travel inside [`anyhow::Error`] and can be recovered with
/// `downcast_ref::<AllcError>()`.
#[derive(Debug, Error)]
pub enum AllcError {
    #[error("corrupt record in {path}: {line:?}")]
    CorruptLine { path: PathBuf, line: String },

    #[error("positions are not strictly increasing in {path} at {chrom}:{pos}")]
    Unsorted {
        path:  PathBuf,
        chrom: String,
        pos:   PosType,
    },

    #[error("chromosome {chrom} occurs in more than one block of {path}")]
    NonContiguousChrom { path: PathBuf, chrom: String },

    #[error(
        "reference {fasta} is not indexed ({fai} not found). Run `samtools \
         faidx` on it first"
    )]
    MissingFastaIndex { fasta: PathBuf, fai: PathBuf },

    #[error(
        "alignment {bam} is not indexed ({bai} not found). Run `samtools \
         index` on it first"
    )]
    MissingAlignmentIndex { bam: PathBuf, bai: PathBuf },

    #[error("pileup is not grouped by chromosome: {chrom} seen twice")]
    PileupNotGrouped { chrom: String },

    #[error("invalid nucleotide code {code:?} in context pattern {pattern:?}")]
    InvalidPattern { pattern: String, code: char },

    #[error("{path} has no SNP columns to apply mismatch filters to ({chrom}:{pos})")]
    MissingSnpColumns {
        path:  PathBuf,
        chrom: String,
        pos:   PosType,
    },
}

impl AllcError {
    /// Whether the error describes a damaged input file rather than an
    /// environment problem.
    pub fn is_corrupt_input(&self) -> bool {
        matches!(
            self,
            AllcError::CorruptLine { .. }
                | AllcError::Unsorted { .. }
                | AllcError::NonContiguousChrom { .. }
        )
    }

    /// The damaged file, for errors that describe one.
    pub fn corrupt_path(&self) -> Option<&Path> {
        match self {
            AllcError::CorruptLine { path, .. }
            | AllcError::Unsorted { path, .. }
            | AllcError::NonContiguousChrom { path, .. } => Some(path),
            _ => None,
        }
    }
}
