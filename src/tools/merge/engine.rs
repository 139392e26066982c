//! Position-aligned k-way merge of sorted ALLC files.

use std::io;
use std::path::{
    Path,
    PathBuf,
};

use anyhow::{
    bail,
    Context,
};
use itertools::Itertools;
use log::{
    debug,
    info,
    warn,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::data_structs::typedef::CountType;
use crate::data_structs::AllcRecord;
use crate::io::allc::{
    AllcSource,
    AllcWriter,
};
use crate::io::compression::Compression;
use crate::io::index::ChromIndex;
use crate::utils::{
    is_descriptor_exhaustion,
    parent_dir,
    read_json_config,
};
use crate::with_field_fn;

/// What part of the sources a merge covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MergeTarget {
    /// Every chromosome of every source, sorted by name.
    WholeFile,
    /// A single chromosome.
    Chrom(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Carry and sum the `matches`/`mismatches` columns.
    pub snp:              bool,
    pub buffer_lines:     usize,
    /// Sources merged per fold when all-at-once fails.
    pub mini_batch:       usize,
    /// Largest number of sources opened at once. `None` means unlimited,
    /// so only the operating system's descriptor limit applies.
    pub max_open_sources: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snp:              false,
            buffer_lines:     100_000,
            mini_batch:       100,
            max_open_sources: None,
        }
    }
}

impl EngineConfig {
    with_field_fn!(snp, bool);
    with_field_fn!(buffer_lines, usize);
    with_field_fn!(mini_batch, usize);
    with_field_fn!(max_open_sources, Option<usize>);

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        read_json_config(path)
    }

    /// Sources per fold. At least two, and never above the open budget.
    pub fn fold_width(&self) -> usize {
        let width = match self.max_open_sources {
            Some(max) => self.mini_batch.min(max),
            None => self.mini_batch,
        };
        width.max(2)
    }
}

/// Result of one merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStats {
    pub records: u64,
    pub sources: usize,
    /// Whether the output carries SNP columns to the end.
    pub snp:     bool,
    /// Whether the output was produced by folding in batches.
    pub folded:  bool,
    /// Index of the blocks in the output.
    pub index:   ChromIndex,
}

#[derive(Debug)]
pub enum MergeResult {
    Success(MergeStats),
    /// The sources could not all be open at once. Nothing was written.
    ResourceExhausted { reason: String },
}

/// Tracks whether SNP arrays can still be summed. The first record without
/// arrays, or with a length different from the first one seen, turns
/// aggregation off for the rest of the merge.
struct SnpState {
    enabled: bool,
    width:   Option<usize>,
}

impl SnpState {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            width: None,
        }
    }

    fn admit(
        &mut self,
        record: &mut AllcRecord,
    ) -> bool {
        if !self.enabled {
            record.snp = None;
            return false;
        }
        let consistent = match (&record.snp, self.width) {
            (None, _) => false,
            (Some(snp), None) => {
                self.width = Some(snp.len());
                true
            },
            (Some(snp), Some(width)) => snp.len() == width,
        };
        if !consistent {
            warn!(
                "SNP columns missing or of different length at {}:{}, merging without \
                 them",
                record.chrom, record.pos
            );
            self.enabled = false;
            record.snp = None;
        }
        consistent
    }
}

/// Chromosomes present in any of `indexes`, sorted by name so the merged
/// output does not depend on the order of the sources.
pub fn union_chroms<'a, I>(indexes: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a ChromIndex>, {
    indexes
        .into_iter()
        .flat_map(ChromIndex::chroms)
        .map(String::from)
        .sorted_unstable()
        .dedup()
        .collect()
}

/// Merges a set of sorted sources into one file.
pub struct MergeEngine {
    sources: Vec<(PathBuf, ChromIndex)>,
    config:  EngineConfig,
}

impl MergeEngine {
    pub fn new(
        sources: Vec<(PathBuf, ChromIndex)>,
        config: EngineConfig,
    ) -> Self {
        Self { sources, config }
    }

    /// Loads or builds the index of every source.
    pub fn from_paths<P: AsRef<Path>>(
        paths: &[P],
        config: EngineConfig,
    ) -> anyhow::Result<Self> {
        let sources = paths
            .iter()
            .map(|p| {
                let path = p.as_ref().to_path_buf();
                ChromIndex::load_or_build(&path, false).map(|index| (path, index))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(sources, config))
    }

    pub fn sources(&self) -> &[(PathBuf, ChromIndex)] {
        &self.sources
    }

    /// Chromosomes of all sources, see [`union_chroms`].
    pub fn chroms(&self) -> Vec<String> {
        union_chroms(self.sources.iter().map(|(_, index)| index))
    }

    /// Merges `target` of every source into `output`.
    ///
    /// At each step the smallest current position across sources is
    /// emitted once, with `mc` and `cov` summed over all sources holding it
    /// and `count` set to the number of those sources.
    ///
    /// The output is written to a temporary sibling and moved over `output`
    /// only on success. Failing to open the sources for lack of file
    /// descriptors is reported as [`MergeResult::ResourceExhausted`].
    pub fn run<P: AsRef<Path>>(
        &self,
        output: P,
        target: &MergeTarget,
    ) -> anyhow::Result<MergeResult> {
        let output = output.as_ref();
        if self.sources.is_empty() {
            bail!("No sources to merge into {}", output.display());
        }
        if let Some(max) = self.config.max_open_sources {
            if self.sources.len() > max {
                return Ok(MergeResult::ResourceExhausted {
                    reason: format!(
                        "{} sources exceed the limit of {} open files",
                        self.sources.len(),
                        max
                    ),
                });
            }
        }

        let mut opened = Vec::with_capacity(self.sources.len());
        for (path, index) in self.sources.iter() {
            match AllcSource::open(path, index.clone()) {
                Ok(source) => opened.push(source),
                Err(e) if is_exhaustion(&e) => {
                    return Ok(MergeResult::ResourceExhausted {
                        reason: format!("{:#}", e),
                    });
                },
                Err(e) => return Err(e),
            }
        }

        let tmp = match tempfile::NamedTempFile::new_in(parent_dir(output)) {
            Ok(tmp) => tmp,
            Err(e) if is_descriptor_exhaustion(&e) => {
                return Ok(MergeResult::ResourceExhausted {
                    reason: e.to_string(),
                });
            },
            Err(e) => return Err(e.into()),
        };
        let mut writer = AllcWriter::new(
            tmp.as_file().try_clone()?,
            Compression::from_path(output),
            self.config.buffer_lines,
        )?;

        let chroms: Vec<String> = match target {
            MergeTarget::WholeFile => self.chroms(),
            MergeTarget::Chrom(chrom) => vec![chrom.clone()],
        };
        let mut snp = SnpState::new(self.config.snp);
        let mut records = 0u64;

        for chrom in chroms.iter() {
            let n = merge_chrom(chrom, &mut opened, &mut writer, &mut snp)?;
            debug!("Merged {} positions of {}", n, chrom);
            records += n;
        }
        drop(opened);

        let index = writer.finish()?;
        tmp.persist(output)
            .with_context(|| format!("Failed to write {}", output.display()))?;

        Ok(MergeResult::Success(MergeStats {
            records,
            sources: self.sources.len(),
            snp: snp.enabled,
            folded: false,
            index,
        }))
    }
}

fn is_exhaustion(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<io::Error>())
        .any(is_descriptor_exhaustion)
}

fn merge_chrom(
    chrom: &str,
    sources: &mut [AllcSource],
    writer: &mut AllcWriter,
    snp: &mut SnpState,
) -> anyhow::Result<u64> {
    for source in sources.iter_mut() {
        source.seek_chrom(chrom)?;
    }

    let mut written = 0u64;
    while let Some(min_pos) = sources
        .iter()
        .filter_map(|s| s.peek().map(|r| r.pos))
        .min()
    {
        let mut merged: Option<AllcRecord> = None;
        let mut fan_in: CountType = 0;

        for source in sources.iter_mut() {
            if source.peek().map(|r| r.pos) != Some(min_pos) {
                continue;
            }
            let Some(mut record) = source.pop()?
            else {
                continue;
            };
            fan_in += 1;
            let keep_snp = snp.admit(&mut record);

            match merged.as_mut() {
                None => merged = Some(record),
                Some(acc) => {
                    debug_assert_eq!(acc.strand, record.strand);
                    debug_assert_eq!(acc.context, record.context);
                    acc.mc = acc.mc.saturating_add(record.mc);
                    acc.cov = acc.cov.saturating_add(record.cov);
                    let summed = match (keep_snp, acc.snp.as_mut(), record.snp.as_ref()) {
                        (true, Some(acc_snp), Some(rec_snp)) => {
                            acc_snp.add_assign(rec_snp);
                            true
                        },
                        _ => false,
                    };
                    if !summed {
                        acc.snp = None;
                    }
                },
            }
        }

        if let Some(mut record) = merged {
            if !snp.enabled {
                record.snp = None;
            }
            record.count = fan_in;
            writer.write_record(&record)?;
            written += 1;
        }
    }
    Ok(written)
}

/// Merges `sources` into `output`, all at once if possible. When the
/// sources cannot all be open together, falls back to
/// [`fold_minibatch`].
pub fn merge_minibatch<P: AsRef<Path>, Q: AsRef<Path>>(
    sources: &[P],
    output: Q,
    target: &MergeTarget,
    config: &EngineConfig,
) -> anyhow::Result<MergeStats> {
    let output = output.as_ref();
    let engine = MergeEngine::from_paths(sources, config.clone())?;
    match engine.run(output, target)? {
        MergeResult::Success(stats) => Ok(stats),
        MergeResult::ResourceExhausted { reason } => {
            warn!(
                "Cannot merge {} files at once ({}), merging in batches of {}",
                sources.len(),
                reason,
                config.fold_width()
            );
            fold_minibatch(sources, output, target, config)
        },
    }
}

/// Merges the first `K` sources into `output`, then repeatedly merges
/// `output` with the next `K - 1` sources until none remain. At most `K`
/// sources are open at any time. Each fold replaces `output` atomically
/// and reindexes it.
///
/// In the folded output, `count` of a position is the number of inputs of
/// the last fold that touched it, where the previous output counts as one.
pub fn fold_minibatch<P: AsRef<Path>, Q: AsRef<Path>>(
    sources: &[P],
    output: Q,
    target: &MergeTarget,
    config: &EngineConfig,
) -> anyhow::Result<MergeStats> {
    let output = output.as_ref();
    let width = config.fold_width();
    let paths: Vec<PathBuf> = sources.iter().map(|p| p.as_ref().to_path_buf()).collect();
    if paths.is_empty() {
        bail!("No sources to merge into {}", output.display());
    }
    if paths.iter().any(|p| p == output) {
        bail!("{} is both a source and the output", output.display());
    }

    let (first, rest) = paths.split_at(width.min(paths.len()));
    let mut stats = run_fold(first.to_vec(), output, target, config)?;
    let mut folds = 1;

    for chunk in rest.chunks(width - 1) {
        let mut batch = Vec::with_capacity(chunk.len() + 1);
        batch.push(output.to_path_buf());
        batch.extend_from_slice(chunk);
        stats = run_fold(batch, output, target, config)?;
        folds += 1;
    }

    info!(
        "Merged {} files into {} in {} folds",
        paths.len(),
        output.display(),
        folds
    );
    stats.sources = paths.len();
    stats.folded = true;
    Ok(stats)
}

fn run_fold(
    batch: Vec<PathBuf>,
    output: &Path,
    target: &MergeTarget,
    config: &EngineConfig,
) -> anyhow::Result<MergeStats> {
    let sources = batch
        .into_iter()
        .map(|path| {
            // The previous fold's output changed in place, so its index is
            // always rebuilt.
            let force = path == output;
            ChromIndex::load_or_build(&path, force).map(|index| (path, index))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let n_sources = sources.len();

    match MergeEngine::new(sources, config.clone()).run(output, target)? {
        MergeResult::Success(stats) => {
            ChromIndex::load_or_build(output, true)?;
            Ok(stats)
        },
        MergeResult::ResourceExhausted { reason } => {
            bail!(
                "Cannot open {} files even in batches ({}); lower the batch size",
                n_sources,
                reason
            )
        },
    }
}
