//! Merging many ALLC files, one chromosome per worker.

use std::fs::File;
use std::path::{
    Path,
    PathBuf,
};

use anyhow::{
    bail,
    Context,
};
use log::{
    debug,
    error,
    info,
    warn,
};
use rayon::prelude::*;
use serde::{
    Deserialize,
    Serialize,
};

use super::engine::{
    fold_minibatch,
    merge_minibatch,
    union_chroms,
    EngineConfig,
    MergeStats,
    MergeTarget,
};
use crate::error::AllcError;
use crate::io::allc::AllcWriter;
use crate::io::compression::Compression;
use crate::io::index::ChromIndex;
use crate::utils::{
    append_suffix,
    n_threads,
    parent_dir,
    read_json_config,
    THREAD_POOL,
};
use crate::with_field_fn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Parallel per-chromosome merges. One merges the whole file in a
    /// single pass.
    pub n_workers:        usize,
    /// Sources per fold of the fallback merge.
    pub mini_batch:       usize,
    /// Sum the SNP columns.
    pub snp:              bool,
    /// Compress the output, adding a `.gz` suffix to an uncompressed name.
    pub compress:         bool,
    /// Write the `.idx` sidecar of the output.
    pub index:            bool,
    pub buffer_lines:     usize,
    pub max_open_sources: Option<usize>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            n_workers:        1,
            mini_batch:       100,
            snp:              false,
            compress:         true,
            index:            true,
            buffer_lines:     100_000,
            max_open_sources: None,
        }
    }
}

impl MergeConfig {
    with_field_fn!(n_workers, usize);
    with_field_fn!(mini_batch, usize);
    with_field_fn!(snp, bool);
    with_field_fn!(compress, bool);
    with_field_fn!(index, bool);
    with_field_fn!(buffer_lines, usize);
    with_field_fn!(max_open_sources, Option<usize>);

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        read_json_config(path)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            snp:              self.snp,
            buffer_lines:     self.buffer_lines,
            mini_batch:       self.mini_batch,
            max_open_sources: self.max_open_sources,
        }
    }

    /// The path actually written for `output`.
    pub fn output_path<P: AsRef<Path>>(
        &self,
        output: P,
    ) -> PathBuf {
        let output = output.as_ref();
        if self.compress && !Compression::from_path(output).is_compressed() {
            append_suffix(output, ".gz")
        }
        else {
            output.to_path_buf()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub output:   PathBuf,
    /// Chromosomes of the usable sources, sorted by name as in the output.
    pub chroms:   Vec<String>,
    pub records:  u64,
    /// Sources left out because they are damaged, found either while
    /// indexing or during the merge.
    pub skipped:  Vec<PathBuf>,
    /// Whether the output came from the batched fallback, either because
    /// the files could not be open at once or because a per-chromosome
    /// merge failed.
    pub fallback: bool,
}

/// Uncompressed per-chromosome partial output.
fn partial_path(
    output: &Path,
    chrom: &str,
) -> PathBuf {
    append_suffix(output, &format!("_{}.tsv", chrom))
}

fn remove_partials(partials: &[PathBuf]) {
    for partial in partials {
        if partial.exists() {
            if let Err(e) = std::fs::remove_file(partial) {
                warn!("Failed to remove {}: {}", partial.display(), e);
            }
        }
        if let Err(e) = ChromIndex::remove(partial) {
            warn!("{:#}", e);
        }
    }
}

/// Indexes every source on the global pool. Damaged sources are logged and
/// left out; any other failure aborts.
fn index_sources(
    sources: Vec<PathBuf>
) -> anyhow::Result<(Vec<(PathBuf, ChromIndex)>, Vec<PathBuf>)> {
    debug!("Indexing {} sources on {} threads", sources.len(), n_threads());
    let results: Vec<(PathBuf, anyhow::Result<ChromIndex>)> = THREAD_POOL.install(|| {
        sources
            .into_par_iter()
            .map(|path| {
                let index = ChromIndex::load_or_build(&path, false);
                (path, index)
            })
            .collect()
    });

    let mut usable = Vec::with_capacity(results.len());
    let mut skipped = Vec::new();
    for (path, result) in results {
        match result {
            Ok(index) => usable.push((path, index)),
            Err(e)
                if e.downcast_ref::<AllcError>()
                    .map(AllcError::is_corrupt_input)
                    .unwrap_or(false) =>
            {
                error!("Skipping {}: {}", path.display(), e);
                skipped.push(path);
            },
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to index {}", path.display()))
            },
        }
    }
    Ok((usable, skipped))
}

/// Merges `sources` into one sorted ALLC file.
///
/// With a single worker the files are merged in one pass. Otherwise every
/// chromosome is merged into its own partial file on a pool of `n_workers`
/// threads, and the partials are concatenated in chromosome order. If any
/// chromosome fails, the partials are discarded and the output is produced
/// by a folded whole-file merge instead.
///
/// A source found damaged during the merge is dropped and the merge starts
/// over without it.
pub fn merge_allc_files<P: AsRef<Path>, Q: AsRef<Path>>(
    sources: &[P],
    output: Q,
    config: &MergeConfig,
) -> anyhow::Result<MergeReport> {
    let output = config.output_path(output);

    let (mut usable, mut skipped) =
        index_sources(sources.iter().map(|p| p.as_ref().to_path_buf()).collect())?;

    let (chroms, stats, fallback) = loop {
        if usable.is_empty() {
            bail!("None of the {} sources can be merged", sources.len());
        }
        let chroms = union_chroms(usable.iter().map(|(_, index)| index));
        let paths: Vec<PathBuf> = usable.iter().map(|(path, _)| path.clone()).collect();
        info!(
            "Merging {} files ({} skipped) into {}, {} chromosomes",
            paths.len(),
            skipped.len(),
            output.display(),
            chroms.len()
        );

        match merge_paths(&paths, &chroms, &output, config) {
            Ok((stats, fallback)) => break (chroms, stats, fallback),
            Err(e) => {
                let Some(damaged) = damaged_source(&e, &paths)
                else {
                    return Err(e);
                };
                error!("Skipping {}: {:#}", damaged.display(), e);
                // Force a rescan next time instead of trusting the sidecar.
                if let Err(e) = ChromIndex::remove(&damaged) {
                    warn!("{:#}", e);
                }
                usable.retain(|(path, _)| *path != damaged);
                skipped.push(damaged);
            },
        }
    };

    if config.index {
        ChromIndex::load_or_build(&output, true)?;
    }
    else {
        ChromIndex::remove(&output)?;
    }
    info!("Wrote {} positions to {}", stats.records, output.display());

    Ok(MergeReport {
        output,
        chroms,
        records: stats.records,
        skipped,
        fallback: fallback || stats.folded,
    })
}

/// The source `err` blames, if it is a damaged-input error about one of
/// `paths`.
fn damaged_source(
    err: &anyhow::Error,
    paths: &[PathBuf],
) -> Option<PathBuf> {
    let path = err
        .downcast_ref::<AllcError>()
        .filter(|e| e.is_corrupt_input())?
        .corrupt_path()?;
    paths.iter().find(|p| p.as_path() == path).cloned()
}

/// One merge attempt over `paths`. Returns the stats and whether the
/// per-chromosome merge had to fall back.
fn merge_paths(
    paths: &[PathBuf],
    chroms: &[String],
    output: &Path,
    config: &MergeConfig,
) -> anyhow::Result<(MergeStats, bool)> {
    let engine_config = config.engine_config();
    if config.n_workers <= 1 {
        let stats = merge_minibatch(paths, output, &MergeTarget::WholeFile, &engine_config)?;
        return Ok((stats, false));
    }

    match merge_by_chrom(paths, chroms, output, config) {
        Ok(stats) => Ok((stats, false)),
        Err(e) if damaged_source(&e, paths).is_some() => Err(e),
        Err(e) => {
            warn!(
                "Per-chromosome merge failed ({:#}), merging the whole files in batches",
                e
            );
            let stats = fold_minibatch(paths, output, &MergeTarget::WholeFile, &engine_config)?;
            Ok((stats, true))
        },
    }
}

fn merge_by_chrom(
    paths: &[PathBuf],
    chroms: &[String],
    output: &Path,
    config: &MergeConfig,
) -> anyhow::Result<MergeStats> {
    let engine_config = config.engine_config();
    let partials: Vec<PathBuf> = chroms.iter().map(|c| partial_path(output, c)).collect();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.n_workers)
        .build()?;

    let tasks: Vec<(&String, &PathBuf)> = chroms.iter().zip(partials.iter()).collect();
    let results: Vec<anyhow::Result<MergeStats>> = pool.install(|| {
        tasks
            .into_par_iter()
            .map(|(chrom, partial)| {
                info!("Merging {}", chrom);
                merge_minibatch(
                    paths,
                    partial,
                    &MergeTarget::Chrom(chrom.clone()),
                    &engine_config,
                )
                .with_context(|| format!("Failed to merge {}", chrom))
            })
            .collect()
    });

    let stats = match results.into_iter().collect::<anyhow::Result<Vec<_>>>() {
        Ok(stats) => stats,
        Err(e) => {
            remove_partials(&partials);
            return Err(e);
        },
    };

    let concatenated = concatenate(&partials, output, config.buffer_lines);
    remove_partials(&partials);
    let index = concatenated?;

    Ok(MergeStats {
        records: stats.iter().map(|s| s.records).sum(),
        sources: paths.len(),
        snp: stats.iter().all(|s| s.snp),
        folded: stats.iter().any(|s| s.folded),
        index,
    })
}

/// Joins the partials in order into `output`, compressing according to its
/// extension. Returns the index of the result.
fn concatenate(
    partials: &[PathBuf],
    output: &Path,
    buffer_lines: usize,
) -> anyhow::Result<ChromIndex> {
    info!("Concatenating {} partial files into {}", partials.len(), output.display());
    let tmp = tempfile::NamedTempFile::new_in(parent_dir(output))?;
    let mut writer = AllcWriter::new(
        tmp.as_file().try_clone()?,
        Compression::from_path(output),
        buffer_lines,
    )?;
    let mut index = ChromIndex::new();

    for partial in partials {
        let partial_index = ChromIndex::load_or_build(partial, false)?;
        let base = writer.bytes_written();
        for (chrom, offset) in partial_index.iter() {
            index.insert(chrom, base + offset);
        }
        let mut handle = File::open(partial)
            .with_context(|| format!("Failed to open {}", partial.display()))?;
        writer.append_from(&mut handle)?;
    }

    writer.finish()?;
    tmp.persist(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("out.tsv", true, "out.tsv.gz")]
    #[case("out.tsv.gz", true, "out.tsv.gz")]
    #[case("out.tsv", false, "out.tsv")]
    fn test_output_path(
        #[case] output: &str,
        #[case] compress: bool,
        #[case] expected: &str,
    ) {
        let config = MergeConfig::default().with_compress(compress);
        assert_eq!(config.output_path(output), PathBuf::from(expected));
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("dir/out.tsv.gz"), "chr1"),
            PathBuf::from("dir/out.tsv.gz_chr1.tsv")
        );
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merge.json");
        std::fs::write(&path, r#"{"n_workers": 4, "snp": true}"#).unwrap();
        let config = MergeConfig::from_json_file(&path).unwrap();
        assert_eq!(config, MergeConfig::default().with_n_workers(4).with_snp(true));
        assert_eq!(config.engine_config().mini_batch, 100);
    }
}
