//! Sparse chromosome index over sorted ALLC files.
//!
//! ALLC files keep each chromosome in one contiguous block, so it suffices
//! to store the offset of the first record of every block. The index lives
//! next to the data in a `<file>.idx` sidecar:
//!
//! ```text
//! chr1	0
//! chr2	48213
//! #eof
//! ```
//!
//! The `#eof` terminator is written only after a complete scan. Offsets are
//! positions in the uncompressed byte stream.

use std::fs::File;
use std::io::{
    BufRead,
    BufReader,
    Write,
};
use std::path::{
    Path,
    PathBuf,
};

use anyhow::Context;
use indexmap::IndexMap;
use log::{
    debug,
    warn,
};
use memchr::{
    memchr,
    memchr_iter,
};
use memmap2::Mmap;

use crate::data_structs::typedef::ChromName;
use crate::data_structs::AllcRecord;
use crate::error::AllcError;
use crate::io::compression::{
    open_text,
    Compression,
};
use crate::utils::{
    append_suffix,
    parent_dir,
};

pub const INDEX_SUFFIX: &str = ".idx";
pub const EOF_MARKER: &str = "#eof";

/// Chromosome -> byte offset of its first record, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChromIndex {
    entries: IndexMap<String, u64>,
}

impl ChromIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>, {
        Self {
            entries: entries
                .into_iter()
                .map(|(chrom, offset)| (chrom.into(), offset))
                .collect(),
        }
    }

    /// Sidecar path of a data file.
    pub fn index_path<P: AsRef<Path>>(path: P) -> PathBuf {
        append_suffix(path, INDEX_SUFFIX)
    }

    /// Offset of the first record of `chrom`, `None` if the file has no
    /// records on it.
    pub fn lookup(
        &self,
        chrom: &str,
    ) -> Option<u64> {
        self.entries.get(chrom).copied()
    }

    pub fn contains(
        &self,
        chrom: &str,
    ) -> bool {
        self.entries.contains_key(chrom)
    }

    pub fn chroms(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a block start. Returns `false` if the chromosome already has
    /// one.
    pub(crate) fn insert(
        &mut self,
        chrom: &str,
        offset: u64,
    ) -> bool {
        if self.entries.contains_key(chrom) {
            return false;
        }
        self.entries.insert(chrom.to_string(), offset);
        true
    }

    /// Scans `path` once, validating sort order on the way.
    ///
    /// A first line whose `pos`, `mc` or `cov` fields are not integers is
    /// taken as a header. Anywhere else such a line, or any line the record
    /// parser rejects, is [`AllcError::CorruptLine`]. Positions that do not strictly increase
    /// within a block are [`AllcError::Unsorted`], and a chromosome that
    /// starts a second block is [`AllcError::NonContiguousChrom`].
    pub fn build<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut scanner = IndexScanner::new(path);

        if Compression::from_path(path).is_compressed() {
            let mut reader = open_text(path)?;
            let mut buf = Vec::with_capacity(256);
            let mut offset = 0u64;
            loop {
                buf.clear();
                let n = reader
                    .read_until(b'\n', &mut buf)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                if n == 0 {
                    break;
                }
                scanner.push(&buf, offset)?;
                offset += n as u64;
            }
        }
        else {
            let file = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            if file.metadata()?.len() == 0 {
                return Ok(scanner.finish());
            }
            let mmap = unsafe { Mmap::map(&file)? };
            let data = &mmap[..];
            let mut start = 0usize;
            while start < data.len() {
                let end = memchr(b'\n', &data[start..])
                    .map(|nl| start + nl + 1)
                    .unwrap_or(data.len());
                scanner.push(&data[start..end], start as u64)?;
                start = end;
            }
        }

        let index = scanner.finish();
        debug!(
            "Indexed {} chromosomes of {}",
            index.len(),
            path.display()
        );
        Ok(index)
    }

    /// Reads a sidecar. Returns `None` when it is missing or stale: no
    /// terminator, a duplicated terminator or a malformed entry.
    pub fn read<P: AsRef<Path>>(index_path: P) -> anyhow::Result<Option<Self>> {
        let index_path = index_path.as_ref();
        if !index_path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(index_path)?);
        let mut index = ChromIndex::new();
        let mut terminated = false;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if terminated {
                // Anything after the terminator means a second write raced
                // the first one.
                return Ok(None);
            }
            if line == EOF_MARKER {
                terminated = true;
                continue;
            }
            let Some((chrom, offset)) = line.rsplit_once('\t')
            else {
                return Ok(None);
            };
            let Ok(offset) = offset.parse::<u64>()
            else {
                return Ok(None);
            };
            if !index.insert(chrom, offset) {
                return Ok(None);
            }
        }

        Ok(terminated.then_some(index))
    }

    /// Writes the sidecar of `data_path` atomically.
    pub fn write<P: AsRef<Path>>(
        &self,
        data_path: P,
    ) -> anyhow::Result<PathBuf> {
        let index_path = Self::index_path(data_path);
        let mut tmp = tempfile::NamedTempFile::new_in(parent_dir(&index_path))?;
        {
            let mut writer = std::io::BufWriter::new(tmp.as_file_mut());
            for (chrom, offset) in self.iter() {
                writeln!(writer, "{chrom}\t{offset}")?;
            }
            writeln!(writer, "{EOF_MARKER}")?;
            writer.flush()?;
        }
        tmp.persist(&index_path).with_context(|| {
            format!("Failed to write index {}", index_path.display())
        })?;
        Ok(index_path)
    }

    /// Reuses a fresh sidecar, otherwise builds and writes a new one.
    /// `force` always rebuilds.
    pub fn load_or_build<P: AsRef<Path>>(
        path: P,
        force: bool,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let index_path = Self::index_path(path);

        if !force && !is_older_than(&index_path, path) {
            if let Some(index) = Self::read(&index_path)? {
                return Ok(index);
            }
            if index_path.exists() {
                warn!("Index {} is incomplete, rebuilding", index_path.display());
            }
        }

        let index = Self::build(path)?;
        index.write(path)?;
        Ok(index)
    }

    /// Deletes the sidecar of `data_path` if it exists.
    pub fn remove<P: AsRef<Path>>(data_path: P) -> anyhow::Result<()> {
        let index_path = Self::index_path(data_path);
        match std::fs::remove_file(&index_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| {
                    format!("Failed to remove {}", index_path.display())
                })
            },
        }
    }
}

/// Whether `a` was modified strictly before `b`. Unknown times count as
/// not older.
fn is_older_than(
    a: &Path,
    b: &Path,
) -> bool {
    let mtime = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
    match (mtime(a), mtime(b)) {
        (Some(a), Some(b)) => a < b,
        _ => false,
    }
}

/// Chromosome and position of a record line, `None` if the line has fewer
/// than seven fields or `pos`, `mc` or `cov` are not integers.
pub(crate) fn key_fields(line: &[u8]) -> Option<(&[u8], u64)> {
    let mut bounds = [0usize; 7];
    let mut n_fields = 1;
    for tab in memchr_iter(b'\t', line) {
        if n_fields == bounds.len() {
            break;
        }
        bounds[n_fields] = tab + 1;
        n_fields += 1;
    }
    if n_fields < 7 {
        return None;
    }
    let field = |i: usize| {
        let start = bounds[i];
        let end = memchr(b'\t', &line[start..])
            .map(|p| start + p)
            .unwrap_or(line.len());
        &line[start..end]
    };
    let pos = parse_u64(field(1))?;
    parse_u64(field(4))?;
    parse_u64(field(5))?;
    Some((field(0), pos))
}

fn parse_u64(data: &[u8]) -> Option<u64> {
    if data.is_empty() || data.len() > 19 {
        return None;
    }
    let mut acc = 0u64;
    for &b in data {
        if !b.is_ascii_digit() {
            return None;
        }
        acc = acc * 10 + (b - b'0') as u64;
    }
    Some(acc)
}

struct IndexScanner<'a> {
    path:        &'a Path,
    index:       ChromIndex,
    first_line:  bool,
    current:     Vec<u8>,
    last_pos:    u64,
    chrom_cache: Option<ChromName>,
}

impl<'a> IndexScanner<'a> {
    fn new(path: &'a Path) -> Self {
        Self {
            path,
            index: ChromIndex::new(),
            first_line: true,
            current: Vec::new(),
            last_pos: 0,
            chrom_cache: None,
        }
    }

    /// Consumes one raw line (with its terminator) starting at `offset`.
    fn push(
        &mut self,
        raw: &[u8],
        offset: u64,
    ) -> anyhow::Result<()> {
        let line = trim_line(raw);
        let first_line = std::mem::replace(&mut self.first_line, false);
        if line.is_empty() {
            return Ok(());
        }

        let Some((chrom, pos)) = key_fields(line)
        else {
            if first_line {
                return Ok(());
            }
            return Err(self.corrupt(line));
        };
        // Same rules the merge applies when it reads the record back.
        let parses = std::str::from_utf8(line)
            .map(|text| AllcRecord::parse_interned(text, &mut self.chrom_cache).is_ok())
            .unwrap_or(false);
        if !parses {
            return Err(self.corrupt(line));
        }

        if chrom == self.current.as_slice() && !self.index.is_empty() {
            if pos <= self.last_pos {
                return Err(AllcError::Unsorted {
                    path:  self.path.to_path_buf(),
                    chrom: String::from_utf8_lossy(chrom).into_owned(),
                    pos:   pos as _,
                }
                .into());
            }
        }
        else {
            let name = String::from_utf8_lossy(chrom);
            if !self.index.insert(&name, offset) {
                return Err(AllcError::NonContiguousChrom {
                    path:  self.path.to_path_buf(),
                    chrom: name.into_owned(),
                }
                .into());
            }
            self.current.clear();
            self.current.extend_from_slice(chrom);
        }
        self.last_pos = pos;
        Ok(())
    }

    fn corrupt(
        &self,
        line: &[u8],
    ) -> anyhow::Error {
        AllcError::CorruptLine {
            path: self.path.to_path_buf(),
            line: String::from_utf8_lossy(line).into_owned(),
        }
        .into()
    }

    fn finish(self) -> ChromIndex {
        self.index
    }
}

pub(crate) fn trim_line(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &raw[..end]
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;
    use tempfile::{
        tempdir,
        NamedTempFile,
    };

    use super::*;

    fn write_file(lines: &[&str]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        for &line in lines {
            writeln!(tmp, "{}", line).unwrap();
        }
        tmp
    }

    const RECORDS: [&str; 5] = [
        "chr1\t10\t+\tCGA\t1\t2\t1",
        "chr1\t20\t-\tCAG\t0\t3\t1",
        "chr2\t5\t+\tCTT\t2\t2\t1",
        "chr2\t6\t+\tCGG\t1\t1\t1",
        "chrM\t1\t+\tCCC\t0\t1\t1",
    ];

    #[test]
    fn test_empty_file() {
        let tmp = NamedTempFile::new().unwrap();
        assert!(ChromIndex::build(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_offsets_point_at_block_starts() {
        let tmp = write_file(&RECORDS);
        let index = ChromIndex::build(tmp.path()).unwrap();
        let text = std::fs::read_to_string(tmp.path()).unwrap();

        assert_eq!(index.chroms().collect::<Vec<_>>(), vec!["chr1", "chr2", "chrM"]);
        for chrom in ["chr1", "chr2", "chrM"] {
            let offset = index.lookup(chrom).unwrap() as usize;
            assert!(text[offset..].starts_with(&format!("{chrom}\t")));
        }
        assert_eq!(index.lookup("chr1"), Some(0));
        assert_eq!(index.lookup("chrX"), None);
    }

    #[test]
    fn test_header_is_skipped() {
        let mut lines = vec!["chrom\tpos\tstrand\tcontext\tmc\tcov\tcount"];
        lines.extend_from_slice(&RECORDS);
        let tmp = write_file(&lines);
        let index = ChromIndex::build(tmp.path()).unwrap();
        assert_eq!(index.lookup("chr1"), Some(lines[0].len() as u64 + 1));
    }

    #[test]
    fn test_missing_trailing_newline() {
        let mut tmp = NamedTempFile::new().unwrap();
        write!(tmp, "{}\n{}", RECORDS[1], RECORDS[2]).unwrap();
        let index = ChromIndex::build(tmp.path()).unwrap();
        assert_eq!(index.lookup("chr2"), Some(RECORDS[1].len() as u64 + 1));
    }

    #[rstest]
    #[case::corrupt(&[RECORDS[0], "chr1\tx\t+\tCGA\t1\t2\t1"])]
    #[case::mc_exceeds_cov(&[RECORDS[0], "chr1\t12\t+\tCGA\t9\t2\t1"])]
    #[case::bad_count(&[RECORDS[0], "chr1\t12\t+\tCGA\t1\t2\tone"])]
    #[case::pos_overflow(&[RECORDS[0], "chr1\t99999999999\t+\tCGA\t1\t2\t1"])]
    #[case::snp_length_mismatch(&[RECORDS[0], "chr1\t12\t+\tCGA\t1\t2\t1\t1,1\t0"])]
    #[case::unsorted(&[RECORDS[1], RECORDS[0]])]
    #[case::duplicate_pos(&[RECORDS[0], RECORDS[0]])]
    #[case::non_contiguous(&[RECORDS[0], RECORDS[2], "chr1\t30\t+\tCGA\t1\t1\t1"])]
    fn test_build_rejects_invalid_files(#[case] lines: &[&str]) {
        let tmp = write_file(lines);
        let err = ChromIndex::build(tmp.path()).unwrap_err();
        let err = err.downcast_ref::<AllcError>().unwrap();
        assert!(err.is_corrupt_input());
    }

    #[test]
    fn test_compressed_offsets_match_plain() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("a.tsv");
        let packed = dir.path().join("a.tsv.gz");
        let text = RECORDS.iter().map(|l| format!("{l}\n")).collect::<String>();
        std::fs::write(&plain, &text).unwrap();
        let mut encoder = Compression::Gz
            .get_encoder(File::create(&packed).unwrap(), None)
            .unwrap();
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap();

        assert_eq!(
            ChromIndex::build(&plain).unwrap(),
            ChromIndex::build(&packed).unwrap()
        );
    }

    #[test]
    fn test_sidecar_roundtrip() {
        let tmp = write_file(&RECORDS);
        let index = ChromIndex::build(tmp.path()).unwrap();
        let index_path = index.write(tmp.path()).unwrap();
        assert_eq!(index_path, ChromIndex::index_path(tmp.path()));

        let text = std::fs::read_to_string(&index_path).unwrap();
        assert!(text.ends_with("#eof\n"));
        assert_eq!(ChromIndex::read(&index_path).unwrap(), Some(index));

        ChromIndex::remove(tmp.path()).unwrap();
        assert!(!index_path.exists());
        ChromIndex::remove(tmp.path()).unwrap();
    }

    #[rstest]
    #[case::no_terminator("chr1\t0\n")]
    #[case::double_terminator("chr1\t0\n#eof\n#eof\n")]
    #[case::bad_offset("chr1\tzero\n#eof\n")]
    fn test_stale_sidecars(#[case] content: &str) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.tsv.idx");
        std::fs::write(&path, content).unwrap();
        assert_eq!(ChromIndex::read(&path).unwrap(), None);
    }

    #[test]
    fn test_load_or_build_replaces_stale_sidecar() {
        let tmp = write_file(&RECORDS);
        let index_path = ChromIndex::index_path(tmp.path());
        std::fs::write(&index_path, "chr1\t0\n").unwrap();

        let index = ChromIndex::load_or_build(tmp.path(), false).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(ChromIndex::read(&index_path).unwrap(), Some(index));
    }

    #[test]
    fn test_load_or_build_reuses_fresh_sidecar() {
        let tmp = write_file(&RECORDS);
        let fake = ChromIndex::from_entries([("chrZ", 0u64)]);
        fake.write(tmp.path()).unwrap();

        let loaded = ChromIndex::load_or_build(tmp.path(), false).unwrap();
        assert_eq!(loaded, fake);
        let forced = ChromIndex::load_or_build(tmp.path(), true).unwrap();
        assert_eq!(forced.len(), 3);
    }
}
