//! # allctools
//!
//! `allctools` calls, indexes, filters and merges ALLC files: sorted,
//! tab-separated per-cytosine methylation tables produced from bisulfite
//! sequencing alignments.
//!
//! ## Key Features
//!
//! * **Calling**: [`PileupCaller`] turns `samtools mpileup` output into ALLC
//!   records, using a [`ReferenceWindow`] over an indexed FASTA to build the
//!   sequence context of every cytosine.
//! * **Indexing**: [`ChromIndex`] maps each chromosome to the byte offset of
//!   its first line and is cached in a `.idx` sidecar next to the data file.
//! * **Merging**: [`MergeEngine`] sums any number of sorted ALLC files
//!   position by position. When the files cannot be open at once the merge
//!   is folded over mini-batches, and [`merge_allc_files`] spreads the work
//!   over chromosomes.
//! * **Compression**: gzip, bgzip, zstd, xz and bzip2 inputs and outputs,
//!   chosen by file extension.
//!
//! Number of threads to be used can be configured with setting
//! `ALLC_NUM_THREADS` environment variable.
//!
//! ## Structure
//!
//! * [`data_structs`]: ALLC records, context patterns and per-context
//!   summaries.
//! * [`io`]: ALLC readers and writers, the chromosome index, FASTA access and
//!   pileup parsing.
//! * [`tools`]: calling, filtering and merging.
//! * [`utils`]: the global thread pool and small helpers.
//!
//! ## Usage
//!
//! ### Merging ALLC files
//!
//! ```no_run
//! use allctools::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = MergeConfig::default().with_n_workers(4);
//!     let report = merge_allc_files(
//!         &["allc_a.tsv.gz", "allc_b.tsv.gz"],
//!         "allc_merged.tsv",
//!         &config,
//!     )?;
//!     println!("Wrote {} positions to {}", report.records, report.output.display());
//!     Ok(())
//! }
//! ```
//!
//! ### Calling methylation from a BAM file
//!
//! ```no_run
//! use allctools::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let summary = call_bam(
//!         "sample.bam",
//!         "genome.fa",
//!         "allc_sample.tsv.gz",
//!         CallConfig::default(),
//!     )?;
//!     for (context, counts) in summary.sorted() {
//!         println!("{}\t{:.4}", context, counts.mc_rate().unwrap_or(0.0));
//!     }
//!     Ok(())
//! }
//! ```

pub mod data_structs;
pub mod error;
pub mod io;
pub mod prelude;
pub mod tools;
pub mod utils;

#[allow(unused_imports)]
use prelude::*;
