//! Filtering of ALLC files by chromosome, context, coverage and SNP
//! evidence.

use std::path::{
    Path,
    PathBuf,
};

use anyhow::Context;
use hashbrown::HashSet;
use log::info;
use rayon::prelude::*;
use serde::{
    Deserialize,
    Serialize,
};

use crate::data_structs::typedef::{
    CountType,
    DensityType,
};
use crate::data_structs::{
    AllcRecord,
    ContextPattern,
};
use crate::error::AllcError;
use crate::io::allc::{
    AllcReader,
    AllcWriter,
};
use crate::io::compression::Compression;
use crate::io::index::ChromIndex;
use crate::utils::{
    append_suffix,
    parent_dir,
    read_json_config,
    THREAD_POOL,
};
use crate::with_field_fn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Context patterns to keep. Empty keeps every context.
    pub patterns:          Vec<ContextPattern>,
    pub chroms:            Option<Vec<String>>,
    pub min_cov:           CountType,
    pub max_cov:           Option<CountType>,
    /// Largest mismatch count allowed at each context offset.
    pub max_mismatch:      Option<Vec<CountType>>,
    /// Largest mismatch fraction allowed at each context offset.
    pub max_mismatch_frac: Option<Vec<DensityType>>,
    pub compress:          bool,
    pub index:             bool,
    pub buffer_lines:      usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            patterns:          Vec::new(),
            chroms:            None,
            min_cov:           0,
            max_cov:           None,
            max_mismatch:      None,
            max_mismatch_frac: None,
            compress:          true,
            index:             true,
            buffer_lines:      100_000,
        }
    }
}

impl FilterConfig {
    with_field_fn!(patterns, Vec<ContextPattern>);
    with_field_fn!(chroms, Option<Vec<String>>);
    with_field_fn!(min_cov, CountType);
    with_field_fn!(max_cov, Option<CountType>);
    with_field_fn!(max_mismatch, Option<Vec<CountType>>);
    with_field_fn!(max_mismatch_frac, Option<Vec<DensityType>>);
    with_field_fn!(compress, bool);
    with_field_fn!(index, bool);
    with_field_fn!(buffer_lines, usize);

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        read_json_config(path)
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

    fn uses_snp(&self) -> bool {
        self.max_mismatch.is_some() || self.max_mismatch_frac.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterReport {
    pub input:  PathBuf,
    pub output: PathBuf,
    pub kept:   u64,
    pub total:  u64,
}

struct RecordFilter<'a> {
    config: &'a FilterConfig,
    chroms: Option<HashSet<&'a str>>,
}

impl<'a> RecordFilter<'a> {
    fn new(config: &'a FilterConfig) -> Self {
        let chroms = config
            .chroms
            .as_ref()
            .map(|chroms| chroms.iter().map(String::as_str).collect());
        Self { config, chroms }
    }

    fn passes_basic(
        &self,
        record: &AllcRecord,
    ) -> bool {
        let config = self.config;
        self.chroms
            .as_ref()
            .map(|chroms| chroms.contains(record.chrom.as_str()))
            .unwrap_or(true)
            && (config.patterns.is_empty()
                || config.patterns.iter().any(|p| p.matches(&record.context)))
            && record.cov >= config.min_cov
            && config.max_cov.map(|max| record.cov <= max).unwrap_or(true)
    }

    /// Offsets past the end of the record's arrays are not checked.
    fn passes_snp(
        &self,
        record: &AllcRecord,
        path: &Path,
    ) -> anyhow::Result<bool> {
        let snp = record.snp.as_ref().ok_or_else(|| {
            AllcError::MissingSnpColumns {
                path:  path.to_path_buf(),
                chrom: record.chrom.to_string(),
                pos:   record.pos,
            }
        })?;

        if let Some(max_mismatch) = &self.config.max_mismatch {
            let exceeded = max_mismatch
                .iter()
                .zip(&snp.mismatches)
                .any(|(cutoff, mismatches)| mismatches > cutoff);
            if exceeded {
                return Ok(false);
            }
        }
        if let Some(max_frac) = &self.config.max_mismatch_frac {
            let exceeded = max_frac.iter().enumerate().any(|(offset, cutoff)| {
                snp.mismatch_frac(offset)
                    .map(|frac| frac > *cutoff)
                    .unwrap_or(false)
            });
            if exceeded {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn keep(
        &self,
        record: &AllcRecord,
        path: &Path,
    ) -> anyhow::Result<bool> {
        if !self.passes_basic(record) {
            return Ok(false);
        }
        if self.config.uses_snp() {
            return self.passes_snp(record, path);
        }
        Ok(true)
    }
}

/// Copies the records of `input` that pass `config` to `output`.
pub fn filter_allc<P: AsRef<Path>, Q: AsRef<Path>>(
    input: P,
    output: Q,
    config: &FilterConfig,
) -> anyhow::Result<FilterReport> {
    let input = input.as_ref();
    let output = config.output_path(output);
    let filter = RecordFilter::new(config);

    let tmp = tempfile::NamedTempFile::new_in(parent_dir(&output))?;
    let mut writer = AllcWriter::new(
        tmp.as_file().try_clone()?,
        Compression::from_path(&output),
        config.buffer_lines,
    )?;

    let (mut kept, mut total) = (0u64, 0u64);
    for record in AllcReader::from_path(input)? {
        let record = record?;
        total += 1;
        if filter.keep(&record, input)? {
            writer.write_record(&record)?;
            kept += 1;
        }
    }

    let index = writer.finish()?;
    tmp.persist(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    if config.index {
        index.write(&output)?;
    }
    else {
        ChromIndex::remove(&output)?;
    }
    info!(
        "Kept {} of {} records of {} in {}",
        kept,
        total,
        input.display(),
        output.display()
    );

    Ok(FilterReport {
        input: input.to_path_buf(),
        output,
        kept,
        total,
    })
}

/// Filters every `(input, output)` pair on the global pool.
pub fn filter_allc_files<P, Q>(
    pairs: &[(P, Q)],
    config: &FilterConfig,
) -> anyhow::Result<Vec<FilterReport>>
where
    P: AsRef<Path> + Sync,
    Q: AsRef<Path> + Sync, {
    THREAD_POOL.install(|| {
        pairs
            .par_iter()
            .map(|(input, output)| {
                filter_allc(input, output, config).with_context(|| {
                    format!("Failed to filter {}", input.as_ref().display())
                })
            })
            .collect()
    })
}
