use std::fs::File;
use std::io::{
    self,
    Read,
    Write,
};
use std::path::Path;

use anyhow::Context;
use log::debug;

use crate::data_structs::AllcRecord;
use crate::io::compression::{
    Compression,
    Encoder,
};
use crate::io::index::ChromIndex;

/// Accumulates formatted lines and hands them to `sink` in bulk. The buffer
/// is flushed as soon as it holds more than `threshold` lines, which bounds
/// memory on high-depth regions.
pub struct LineBuffer<W: Write> {
    sink:      W,
    buf:       String,
    lines:     usize,
    threshold: usize,
    /// Bytes accepted so far, buffered or not.
    position:  u64,
}

impl<W: Write> LineBuffer<W> {
    pub fn new(
        sink: W,
        threshold: usize,
    ) -> Self {
        Self {
            sink,
            buf: String::new(),
            lines: 0,
            threshold,
            position: 0,
        }
    }

    /// Appends one line. `line` must end with a newline.
    pub fn append(
        &mut self,
        line: &str,
    ) -> io::Result<()> {
        self.buf.push_str(line);
        self.position += line.len() as u64;
        self.lines += 1;
        self.flush_if_full()
    }

    pub fn append_record(
        &mut self,
        record: &AllcRecord,
    ) -> io::Result<()> {
        let before = self.buf.len();
        record.write_line(&mut self.buf);
        self.position += (self.buf.len() - before) as u64;
        self.lines += 1;
        self.flush_if_full()
    }

    fn flush_if_full(&mut self) -> io::Result<()> {
        if self.lines > self.threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes out the buffered lines.
    pub fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.sink.write_all(self.buf.as_bytes())?;
            self.buf.clear();
        }
        self.lines = 0;
        Ok(())
    }

    /// Offset of the next line in the uncompressed output.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn buffered_lines(&self) -> usize {
        self.lines
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    /// Flushes pending lines and copies `reader` through to the sink.
    pub fn append_from<R: Read>(
        &mut self,
        reader: &mut R,
    ) -> io::Result<u64> {
        self.flush()?;
        let copied = io::copy(reader, &mut self.sink)?;
        self.position += copied;
        Ok(copied)
    }

    pub fn into_inner(mut self) -> io::Result<W> {
        self.flush()?;
        Ok(self.sink)
    }
}

/// Writes ALLC records to a possibly compressed file, recording the start
/// of every chromosome block on the way.
pub struct AllcWriter {
    buffer:     LineBuffer<Encoder<File>>,
    index:      ChromIndex,
    last_chrom: Option<String>,
}

impl AllcWriter {
    pub fn new(
        handle: File,
        compression: Compression,
        buffer_lines: usize,
    ) -> anyhow::Result<Self> {
        let encoder = compression.get_encoder(handle, None)?;
        Ok(Self {
            buffer:     LineBuffer::new(encoder, buffer_lines),
            index:      ChromIndex::new(),
            last_chrom: None,
        })
    }

    /// Creates `path`, compressing according to its extension.
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        buffer_lines: usize,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let handle = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        debug!("Writing ALLC records to {}", path.display());
        Self::new(handle, Compression::from_path(path), buffer_lines)
    }

    /// Writes `record` and returns the offset its line starts at.
    pub fn write_record(
        &mut self,
        record: &AllcRecord,
    ) -> io::Result<u64> {
        let offset = self.buffer.position();
        if self.last_chrom.as_deref() != Some(record.chrom.as_str()) {
            self.index.insert(record.chrom.as_str(), offset);
            self.last_chrom = Some(record.chrom.to_string());
        }
        self.buffer.append_record(record)?;
        Ok(offset)
    }

    /// Copies already formatted ALLC text, e.g. a finished partial file.
    /// The copied lines are not added to the inline index.
    pub fn append_from<R: Read>(
        &mut self,
        reader: &mut R,
    ) -> io::Result<u64> {
        self.last_chrom = None;
        self.buffer.append_from(reader)
    }

    pub fn bytes_written(&self) -> u64 {
        self.buffer.position()
    }

    /// Index of the blocks written through [`AllcWriter::write_record`].
    pub fn index(&self) -> &ChromIndex {
        &self.index
    }

    /// Flushes and closes the stream. Returns the inline index.
    pub fn finish(self) -> anyhow::Result<ChromIndex> {
        let encoder = self.buffer.into_inner()?;
        let file = encoder.finish()?;
        file.sync_data()?;
        Ok(self.index)
    }
}
