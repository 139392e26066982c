use std::fs::File;
use std::io::{
    self,
    BufRead,
    BufReader,
    Read,
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

use crate::data_structs::typedef::ChromName;
use crate::data_structs::AllcRecord;
use crate::error::AllcError;
use crate::io::compression::{
    open_text,
    Compression,
};
use crate::io::index::ChromIndex;

const READ_BUFFER_SIZE: usize = 1 << 16;

enum Inner {
    Plain(BufReader<File>),
    /// Compressed streams cannot seek, so the decoded byte count is kept to
    /// skip forward, and the stream is reopened to go back.
    Compressed {
        reader:   Box<dyn BufRead + Send>,
        consumed: u64,
    },
}

impl Inner {
    fn open(
        path: &Path,
        compression: Compression,
    ) -> anyhow::Result<Self> {
        let handle = File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(match compression {
            Compression::None => {
                Inner::Plain(BufReader::with_capacity(READ_BUFFER_SIZE, handle))
            },
            other => {
                Inner::Compressed {
                    reader:   other.get_decoder(handle)?,
                    consumed: 0,
                }
            },
        })
    }

    fn read_line(
        &mut self,
        buf: &mut String,
    ) -> io::Result<usize> {
        match self {
            Inner::Plain(reader) => reader.read_line(buf),
            Inner::Compressed { reader, consumed } => {
                let n = reader.read_line(buf)?;
                *consumed += n as u64;
                Ok(n)
            },
        }
    }
}

/// Where a source's cursor stands relative to its target chromosome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Not positioned on a chromosome yet.
    Pending,
    /// Holds a record of the target chromosome.
    Active,
    /// Reached the end of the block or of the file.
    Exhausted,
}

/// A sorted ALLC file that can be positioned on one chromosome block and
/// read forward record by record.
pub struct AllcSource {
    path:        PathBuf,
    compression: Compression,
    index:       ChromIndex,
    inner:       Inner,
    line:        String,
    chrom_cache: Option<ChromName>,
    target:      Option<String>,
    current:     Option<AllcRecord>,
    state:       CursorState,
}

impl AllcSource {
    /// Opens `path` with an index built or loaded beforehand.
    pub fn open<P: AsRef<Path>>(
        path: P,
        index: ChromIndex,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let compression = Compression::from_path(&path);
        let inner = Inner::open(&path, compression)?;
        Ok(Self {
            path,
            compression,
            index,
            inner,
            line: String::with_capacity(256),
            chrom_cache: None,
            target: None,
            current: None,
            state: CursorState::Pending,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &ChromIndex {
        &self.index
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == CursorState::Exhausted
    }

    /// Current record of the target chromosome.
    pub fn peek(&self) -> Option<&AllcRecord> {
        self.current.as_ref()
    }

    /// Positions the cursor on the first record of `chrom`. A chromosome
    /// absent from the index leaves the source exhausted.
    pub fn seek_chrom(
        &mut self,
        chrom: &str,
    ) -> anyhow::Result<()> {
        self.current = None;
        self.target = Some(chrom.to_string());
        let Some(offset) = self.index.lookup(chrom)
        else {
            self.state = CursorState::Exhausted;
            return Ok(());
        };
        self.seek_to(offset)?;
        self.state = CursorState::Pending;
        self.advance()
    }

    fn seek_to(
        &mut self,
        offset: u64,
    ) -> anyhow::Result<()> {
        let rewind = matches!(
            &self.inner,
            Inner::Compressed { consumed, .. } if *consumed > offset
        );
        if rewind {
            self.inner = Inner::open(&self.path, self.compression)?;
        }
        match &mut self.inner {
            Inner::Plain(reader) => {
                reader.seek(SeekFrom::Start(offset))?;
            },
            Inner::Compressed { reader, consumed } => {
                let skip = offset - *consumed;
                let skipped = io::copy(&mut reader.by_ref().take(skip), &mut io::sink())?;
                *consumed += skipped;
                if skipped < skip {
                    bail!(
                        "Index offset {} is past the end of {}; the index is stale",
                        offset,
                        self.path.display()
                    );
                }
            },
        }
        Ok(())
    }

    /// Reads the next record of the target chromosome into the cursor.
    pub fn advance(&mut self) -> anyhow::Result<()> {
        let Some(target) = self.target.as_deref()
        else {
            bail!("{} is not positioned on a chromosome", self.path.display());
        };
        if self.state == CursorState::Exhausted {
            self.current = None;
            return Ok(());
        }

        loop {
            self.line.clear();
            let n = self
                .inner
                .read_line(&mut self.line)
                .with_context(|| format!("Failed to read {}", self.path.display()))?;
            if n == 0 {
                self.state = CursorState::Exhausted;
                self.current = None;
                return Ok(());
            }
            if !self.line.trim_end_matches(&['\n', '\r'][..]).is_empty() {
                break;
            }
        }

        let record = AllcRecord::parse_interned(&self.line, &mut self.chrom_cache)
            .map_err(|_| {
                AllcError::CorruptLine {
                    path: self.path.clone(),
                    line: self.line.trim_end().to_string(),
                }
            })?;

        if record.chrom.as_str() != target {
            self.state = CursorState::Exhausted;
            self.current = None;
            return Ok(());
        }
        if let Some(prev) = &self.current {
            if record.pos <= prev.pos {
                return Err(AllcError::Unsorted {
                    path:  self.path.clone(),
                    chrom: target.to_string(),
                    pos:   record.pos,
                }
                .into());
            }
        }
        self.current = Some(record);
        self.state = CursorState::Active;
        Ok(())
    }

    /// Takes the current record and moves the cursor forward.
    pub fn pop(&mut self) -> anyhow::Result<Option<AllcRecord>> {
        let Some(record) = self.current.clone()
        else {
            return Ok(None);
        };
        self.advance()?;
        Ok(Some(record))
    }
}

/// Sequential reader over every record of an ALLC file. A header on the
/// first line is skipped.
pub struct AllcReader {
    path:        PathBuf,
    reader:      Box<dyn BufRead + Send>,
    line:        String,
    chrom_cache: Option<ChromName>,
    first_line:  bool,
}

impl AllcReader {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        Ok(Self {
            reader: open_text(&path)?,
            path,
            line: String::with_capacity(256),
            chrom_cache: None,
            first_line: true,
        })
    }

    fn read_next(&mut self) -> anyhow::Result<Option<AllcRecord>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            let first_line = std::mem::replace(&mut self.first_line, false);
            let line = self.line.trim_end_matches(&['\n', '\r'][..]);
            if line.is_empty() || (first_line && AllcRecord::is_header_line(line)) {
                continue;
            }
            let record = AllcRecord::parse_interned(line, &mut self.chrom_cache)
                .map_err(|_| {
                    AllcError::CorruptLine {
                        path: self.path.clone(),
                        line: line.to_string(),
                    }
                })?;
            return Ok(Some(record));
        }
    }
}

impl Iterator for AllcReader {
    type Item = anyhow::Result<AllcRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;
    use tempfile::tempdir;

    use super::*;

    const TEXT: &str = "chr1\t10\t+\tCGA\t1\t2\t1\n\
                        chr1\t20\t-\tCAG\t0\t3\t1\n\
                        chr2\t5\t+\tCTT\t2\t2\t1\n\
                        chr3\t1\t+\tCCC\t0\t1\t1\n";

    fn write(
        dir: &Path,
        name: &str,
        text: &str,
    ) -> PathBuf {
        let path = dir.join(name);
        let mut encoder = Compression::from_path(&path)
            .get_encoder(File::create(&path).unwrap(), None)
            .unwrap();
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap();
        path
    }

    fn drain(source: &mut AllcSource) -> Vec<u32> {
        let mut positions = Vec::new();
        while let Some(record) = source.pop().unwrap() {
            positions.push(record.pos);
        }
        positions
    }

    #[rstest]
    #[case::plain("a.tsv")]
    #[case::gzip("a.tsv.gz")]
    #[case::zstd("a.tsv.zst")]
    fn test_seek_chrom_in_any_order(#[case] name: &str) {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), name, TEXT);
        let index = ChromIndex::build(&path).unwrap();
        let mut source = AllcSource::open(&path, index).unwrap();
        assert_eq!(source.state(), CursorState::Pending);

        source.seek_chrom("chr2").unwrap();
        assert_eq!(drain(&mut source), vec![5]);
        assert!(source.is_exhausted());

        // Backwards.
        source.seek_chrom("chr1").unwrap();
        assert_eq!(source.state(), CursorState::Active);
        assert_eq!(drain(&mut source), vec![10, 20]);

        source.seek_chrom("chr3").unwrap();
        assert_eq!(drain(&mut source), vec![1]);

        source.seek_chrom("chrX").unwrap();
        assert!(source.is_exhausted());
        assert!(source.peek().is_none());
    }

    #[test]
    fn test_unsorted_block_is_an_error() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "u.tsv",
            "chr1\t10\t+\tCGA\t1\t2\t1\nchr1\t9\t+\tCGA\t1\t2\t1\n",
        );
        let index = ChromIndex::from_entries([("chr1", 0u64)]);
        let mut source = AllcSource::open(&path, index).unwrap();
        source.seek_chrom("chr1").unwrap();
        let err = source.pop().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AllcError>(),
            Some(AllcError::Unsorted { pos: 9, .. })
        ));
    }

    #[test]
    fn test_reader_skips_header() {
        let dir = tempdir().unwrap();
        let text = format!("chrom\tpos\tstrand\tcontext\tmc\tcov\tcount\n{TEXT}");
        let path = write(dir.path(), "h.tsv.gz", &text);
        let records = AllcReader::from_path(&path)
            .unwrap()
            .collect::<anyhow::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].chrom.as_str(), "chr1");
    }

    #[test]
    fn test_reader_reports_corrupt_line() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "c.tsv", "chr1\t1\t+\tCGA\t1\t2\t1\nbroken\n");
        let mut reader = AllcReader::from_path(&path).unwrap();
        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        assert!(err.downcast_ref::<AllcError>().unwrap().is_corrupt_input());
    }
}
