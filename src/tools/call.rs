//! Methylation calling from `samtools mpileup` output.
//!
//! Each pileup column over a reference `C` (forward strand) or `G`
//! (reverse strand) becomes one ALLC record. On the forward strand `.`
//! reads are unconverted and `T` reads converted; on the reverse strand
//! the same roles go to `,` and `a`. Indel calls are removed from the
//! read-base string before counting.

use std::borrow::Cow;
use std::io::{
    BufRead,
    BufReader,
    Read,
};
use std::path::{
    Path,
    PathBuf,
};
use std::process::{
    Command,
    Stdio,
};

use anyhow::{
    anyhow,
    bail,
    Context,
};
use hashbrown::HashSet;
use log::{
    debug,
    info,
    warn,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::data_structs::typedef::{
    ChromName,
    PosType,
};
use crate::data_structs::{
    AllcRecord,
    ContextSummary,
    Strand,
};
use crate::error::AllcError;
use crate::io::allc::AllcWriter;
use crate::io::compression::Compression;
use crate::io::fasta::ReferenceWindow;
use crate::io::pileup::{
    strip_indels,
    strip_read_markers,
    BaseCounts,
    PileupLine,
};
use crate::utils::{
    append_suffix,
    parent_dir,
    read_json_config,
};
use crate::{
    getter_fn,
    with_field_fn,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Bases before the cytosine in the context string.
    pub upstream_bases:    usize,
    /// Bases after the cytosine in the context string.
    pub downstream_bases:  usize,
    /// Output lines held in memory before a write.
    pub buffer_lines:      usize,
    /// `samtools mpileup -q`.
    pub min_mapq:          u32,
    /// `samtools mpileup -Q`.
    pub min_base_quality:  u32,
    /// Also drop `^` read-start and `$` read-end markers before counting.
    /// Off by default, which keeps counts identical to older ALLC files.
    pub strip_read_starts: bool,
    /// Write the `.idx` sidecar next to the output.
    pub index:             bool,
    pub samtools:          PathBuf,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            upstream_bases:    0,
            downstream_bases:  2,
            buffer_lines:      100_000,
            min_mapq:          10,
            min_base_quality:  20,
            strip_read_starts: false,
            index:             true,
            samtools:          PathBuf::from("samtools"),
        }
    }
}

impl CallConfig {
    with_field_fn!(upstream_bases, usize);
    with_field_fn!(downstream_bases, usize);
    with_field_fn!(buffer_lines, usize);
    with_field_fn!(min_mapq, u32);
    with_field_fn!(min_base_quality, u32);
    with_field_fn!(strip_read_starts, bool);
    with_field_fn!(index, bool);
    with_field_fn!(samtools, PathBuf);

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        read_json_config(path)
    }

    pub fn context_len(&self) -> usize {
        self.upstream_bases + 1 + self.downstream_bases
    }
}

/// Context string of the cytosine at 1-based `pos`, read on `strand`.
/// `None` if the window does not fit inside the sequence, or, on the
/// reverse strand, holds a base other than `ACGTN`.
pub fn context_window(
    sequence: &[u8],
    pos: PosType,
    strand: Strand,
    upstream: usize,
    downstream: usize,
) -> Option<String> {
    let idx = (pos as usize).checked_sub(1)?;
    let bases = match strand {
        Strand::Reverse => {
            let window = sequence.get(idx.checked_sub(downstream)?..idx + upstream + 1)?;
            if !window
                .iter()
                .all(|b| matches!(b, b'A' | b'C' | b'G' | b'T' | b'N'))
            {
                return None;
            }
            bio::alphabets::dna::revcomp(window)
        },
        _ => {
            sequence
                .get(idx.checked_sub(upstream)?..idx + downstream + 1)?
                .to_vec()
        },
    };
    String::from_utf8(bases).ok()
}

/// Turns a pileup stream into ALLC records.
pub struct PileupCaller {
    config:    CallConfig,
    reference: ReferenceWindow,
}

impl PileupCaller {
    pub fn new(
        config: CallConfig,
        reference: ReferenceWindow,
    ) -> Self {
        Self { config, reference }
    }

    getter_fn!(config, CallConfig);

    /// Calls every line of `pileup` into `writer` and returns the
    /// per-context totals.
    ///
    /// The pileup must be grouped by chromosome. Chromosomes missing from
    /// the reference are skipped with a warning.
    pub fn call<R: BufRead>(
        &mut self,
        mut pileup: R,
        writer: &mut AllcWriter,
    ) -> anyhow::Result<ContextSummary> {
        let upstream = self.config.upstream_bases;
        let downstream = self.config.downstream_bases;

        let mut summary = ContextSummary::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut chrom: Option<ChromName> = None;
        let mut sequence: Option<Vec<u8>> = None;
        let mut line = String::new();
        let mut line_no = 0usize;
        let mut n_records = 0usize;

        loop {
            line.clear();
            if pileup.read_line(&mut line)? == 0 {
                break;
            }
            line_no += 1;
            if line.trim_end().is_empty() {
                continue;
            }
            let column = PileupLine::parse(&line)
                .with_context(|| format!("pileup line {}", line_no))?;

            if chrom.as_deref() != Some(column.chrom) {
                if !seen.insert(column.chrom.to_string()) {
                    return Err(AllcError::PileupNotGrouped {
                        chrom: column.chrom.to_string(),
                    }
                    .into());
                }
                sequence = self.reference.sequence_for(column.chrom)?;
                if sequence.is_none() {
                    warn!(
                        "{} is not in the reference, skipping its sites",
                        column.chrom
                    );
                }
                debug!("Calling {}", column.chrom);
                chrom = Some(ChromName::from(column.chrom));
            }

            let (Some(seq), Some(chrom_name)) = (sequence.as_deref(), chrom.as_ref())
            else {
                continue;
            };
            let strand = match column.ref_base {
                b'C' => Strand::Forward,
                b'G' => Strand::Reverse,
                _ => continue,
            };

            let bases: Cow<[u8]> = if self.config.strip_read_starts {
                strip_read_markers(column.bases)
            }
            else {
                Cow::Borrowed(column.bases)
            };
            let counts = BaseCounts::count(&strip_indels(&bases));
            let (mc, cov) = match strand {
                Strand::Forward => counts.forward(),
                _ => counts.reverse(),
            };
            if cov == 0 {
                continue;
            }

            let Some(context) =
                context_window(seq, column.pos, strand, upstream, downstream)
            else {
                continue;
            };

            summary.add(&context, mc as u64, cov as u64);
            writer.write_record(&AllcRecord::new(
                chrom_name.clone(),
                column.pos,
                strand,
                context,
                mc,
                cov,
            ))?;
            n_records += 1;
        }

        debug!("Called {} sites from {} pileup lines", n_records, line_no);
        Ok(summary)
    }

    /// Calls `pileup` into a new ALLC file at `output`, compressed according
    /// to its extension. The file appears only once calling succeeded.
    pub fn call_to_path<R: BufRead, P: AsRef<Path>>(
        &mut self,
        pileup: R,
        output: P,
    ) -> anyhow::Result<ContextSummary> {
        let output = output.as_ref();
        let tmp = tempfile::NamedTempFile::new_in(parent_dir(output))?;
        let mut writer = AllcWriter::new(
            tmp.as_file().try_clone()?,
            Compression::from_path(output),
            self.config.buffer_lines,
        )?;

        let summary = self.call(pileup, &mut writer)?;
        let index = writer.finish()?;
        tmp.persist(output)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        if self.config.index {
            index.write(output)?;
        }
        Ok(summary)
    }
}

/// Default output of [`call_bam`]: `allc_<name>.tsv.gz` next to the BAM,
/// where `<name>` is the file name up to its first dot.
pub fn default_output_path<P: AsRef<Path>>(bam: P) -> PathBuf {
    let bam = bam.as_ref();
    let name = bam
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.split('.').next().unwrap_or_default();
    parent_dir(bam).join(format!("allc_{}.tsv.gz", stem))
}

/// Runs `samtools mpileup` on `bam` and calls its output into `output`.
///
/// Both the BAM index (`<bam>.bai`) and the reference index
/// (`<fasta>.fai`) must already exist.
pub fn call_bam<P, Q, O>(
    bam: P,
    fasta: Q,
    output: O,
    config: CallConfig,
) -> anyhow::Result<ContextSummary>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    O: AsRef<Path>, {
    let (bam, fasta, output) = (bam.as_ref(), fasta.as_ref(), output.as_ref());
    let bai = append_suffix(bam, ".bai");
    if !bai.exists() {
        return Err(AllcError::MissingAlignmentIndex {
            bam: bam.to_path_buf(),
            bai,
        }
        .into());
    }
    let reference = ReferenceWindow::from_fasta(fasta)?;

    info!("Calling {} into {}", bam.display(), output.display());
    let mut child = Command::new(&config.samtools)
        .arg("mpileup")
        .arg("-Q")
        .arg(config.min_base_quality.to_string())
        .arg("-q")
        .arg(config.min_mapq.to_string())
        .arg("-B")
        .arg("-f")
        .arg(fasta)
        .arg(bam)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to run {}", config.samtools.display()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("samtools stdout was not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("samtools stderr was not captured"))?;
    let stderr_handle = std::thread::spawn(move || {
        let mut text = String::new();
        let _ = stderr.read_to_string(&mut text);
        text
    });

    let mut caller = PileupCaller::new(config, reference);
    let result = caller.call_to_path(BufReader::new(stdout), output);
    if result.is_err() {
        let _ = child.kill();
    }
    let status = child.wait()?;
    let stderr = stderr_handle
        .join()
        .map_err(|_| anyhow!("samtools stderr reader panicked"))?;

    let summary = result?;
    if !status.success() {
        bail!("samtools mpileup failed ({}): {}", status, stderr.trim());
    }
    Ok(summary)
}
