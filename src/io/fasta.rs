//! Random access to chromosome sequences of an indexed FASTA file.

use std::fs::File;
use std::io::{
    BufRead,
    BufReader,
    Seek,
    SeekFrom,
};
use std::path::{
    Path,
    PathBuf,
};

use anyhow::{
    bail,
    Context,
};
use indexmap::IndexMap;
use log::{
    debug,
    warn,
};

use crate::error::AllcError;
use crate::utils::append_suffix;

/// One line of a `.fai` index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaiRecord {
    pub name:       String,
    pub length:     u64,
    pub offset:     u64,
    pub line_bases: u64,
    pub line_bytes: u64,
}

/// Parses a `.fai` file. FASTQ indexes carry a sixth column, which is
/// ignored.
pub fn read_fai<P: AsRef<Path>>(path: P) -> anyhow::Result<IndexMap<String, FaiRecord>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut records = IndexMap::new();
    for (i, row) in reader.records().enumerate() {
        let row = row?;
        if row.len() < 5 {
            bail!("{}:{}: expected 5 columns, got {}", path.display(), i + 1, row.len());
        }
        let number = |col: usize| {
            row[col].trim().parse::<u64>().with_context(|| {
                format!("{}:{}: column {} is not an integer", path.display(), i + 1, col + 1)
            })
        };
        let record = FaiRecord {
            name:       row[0].to_string(),
            length:     number(1)?,
            offset:     number(2)?,
            line_bases: number(3)?,
            line_bytes: number(4)?,
        };
        records.insert(record.name.clone(), record);
    }
    Ok(records)
}

/// Reads whole chromosomes from a FASTA file through its `.fai` index.
#[derive(Debug)]
pub struct ReferenceWindow {
    path:   PathBuf,
    index:  IndexMap<String, FaiRecord>,
    handle: BufReader<File>,
}

impl ReferenceWindow {
    /// Opens `fasta`, which must have a `<fasta>.fai` next to it. The index
    /// is never generated here.
    pub fn from_fasta<P: AsRef<Path>>(fasta: P) -> anyhow::Result<Self> {
        let fasta = fasta.as_ref();
        let fai = append_suffix(fasta, ".fai");
        if !fai.exists() {
            return Err(AllcError::MissingFastaIndex {
                fasta: fasta.to_path_buf(),
                fai,
            }
            .into());
        }
        Self::with_index(fasta, &fai)
    }

    pub fn with_index<P: AsRef<Path>, Q: AsRef<Path>>(
        fasta: P,
        fai: Q,
    ) -> anyhow::Result<Self> {
        let fasta = fasta.as_ref();
        let index = read_fai(fai)?;
        let handle = File::open(fasta)
            .with_context(|| format!("Failed to open {}", fasta.display()))?;
        debug!("Loaded {} reference sequences from {}", index.len(), fasta.display());
        Ok(Self {
            path: fasta.to_path_buf(),
            index,
            handle: BufReader::new(handle),
        })
    }

    pub fn contains(
        &self,
        chrom: &str,
    ) -> bool {
        self.index.contains_key(chrom)
    }

    pub fn chroms(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    pub fn record(
        &self,
        chrom: &str,
    ) -> Option<&FaiRecord> {
        self.index.get(chrom)
    }

    /// Full upper-cased sequence of `chrom`, `None` if the index does not
    /// list it.
    pub fn sequence_for(
        &mut self,
        chrom: &str,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(record) = self.index.get(chrom)
        else {
            return Ok(None);
        };

        self.handle.seek(SeekFrom::Start(record.offset))?;
        let mut sequence = Vec::with_capacity(record.length as usize);
        let mut line = Vec::with_capacity(record.line_bytes as usize);
        loop {
            line.clear();
            if self.handle.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if line.first() == Some(&b'>') {
                break;
            }
            let mut end = line.len();
            while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
                end -= 1;
            }
            sequence.extend_from_slice(&line[..end]);
        }
        sequence.make_ascii_uppercase();

        if sequence.len() as u64 != record.length {
            warn!(
                "{}: {} has {} bases, index lists {}",
                self.path.display(),
                chrom,
                sequence.len(),
                record.length
            );
        }
        Ok(Some(sequence))
    }
}
