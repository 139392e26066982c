use std::fs::File;
use std::io::{
    self,
    BufRead,
    BufReader,
    Write,
};
use std::path::Path;

use anyhow::Context;
use serde::{
    Deserialize,
    Serialize,
};

const READ_BUFFER_SIZE: usize = 1 << 16;

/// Stream compression of ALLC files, detected from the file extension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    None,
    Gz,
    Zstd,
    Xz2,
    Bzip2,
}

impl Compression {
    pub fn name(&self) -> &str {
        match self {
            Compression::None => "none",
            Compression::Gz => "gzip",
            Compression::Zstd => "zstd",
            Compression::Xz2 => "xz2",
            Compression::Bzip2 => "bzip2",
        }
    }

    /// Extension appended to compressed outputs, without the dot.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gz => Some("gz"),
            Compression::Zstd => Some("zst"),
            Compression::Xz2 => Some("xz"),
            Compression::Bzip2 => Some("bz2"),
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        match path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("gz") | Some("bgz") => Compression::Gz,
            Some("zst") => Compression::Zstd,
            Some("xz") => Compression::Xz2,
            Some("bz2") => Compression::Bzip2,
            _ => Compression::None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, Compression::None)
    }

    /// Wraps `handle` in a buffered decoder. Gzip and bzip2 decoders read
    /// every member, so bgzip and concatenated files decode in full.
    pub fn get_decoder(
        &self,
        handle: File,
    ) -> anyhow::Result<Box<dyn BufRead + Send>> {
        let reader: Box<dyn BufRead + Send> = match self {
            Compression::None => {
                Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, handle))
            },
            Compression::Gz => {
                Box::new(BufReader::with_capacity(
                    READ_BUFFER_SIZE,
                    flate2::read::MultiGzDecoder::new(handle),
                ))
            },
            Compression::Zstd => {
                Box::new(BufReader::with_capacity(
                    READ_BUFFER_SIZE,
                    zstd::Decoder::new(handle)?,
                ))
            },
            Compression::Xz2 => {
                Box::new(BufReader::with_capacity(
                    READ_BUFFER_SIZE,
                    xz2::read::XzDecoder::new_multi_decoder(handle),
                ))
            },
            Compression::Bzip2 => {
                Box::new(BufReader::with_capacity(
                    READ_BUFFER_SIZE,
                    bzip2::read::MultiBzDecoder::new(handle),
                ))
            },
        };
        Ok(reader)
    }

    pub fn get_encoder<W: Write>(
        &self,
        handle: W,
        compression_level: Option<u32>,
    ) -> anyhow::Result<Encoder<W>> {
        let encoder = match self {
            Compression::None => Encoder::Plain(handle),
            Compression::Gz => {
                Encoder::Gz(flate2::write::GzEncoder::new(
                    handle,
                    compression_level
                        .map(flate2::Compression::new)
                        .unwrap_or_default(),
                ))
            },
            Compression::Zstd => {
                Encoder::Zstd(zstd::Encoder::new(
                    handle,
                    compression_level.unwrap_or(0) as i32,
                )?)
            },
            Compression::Xz2 => {
                Encoder::Xz2(xz2::write::XzEncoder::new(
                    handle,
                    compression_level.unwrap_or(6),
                ))
            },
            Compression::Bzip2 => {
                Encoder::Bzip2(bzip2::write::BzEncoder::new(
                    handle,
                    compression_level
                        .map(bzip2::Compression::new)
                        .unwrap_or_default(),
                ))
            },
        };
        Ok(encoder)
    }
}

/// Opens a file for line reading, decoding according to its extension.
pub fn open_text<P: AsRef<Path>>(path: P) -> anyhow::Result<Box<dyn BufRead + Send>> {
    let path = path.as_ref();
    let handle = File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Compression::from_path(path).get_decoder(handle)
}

/// A writer that compresses on the fly. The stream must be closed with
/// [`Encoder::finish`]; dropping it may leave a truncated trailer.
pub enum Encoder<W: Write> {
    Plain(W),
    Gz(flate2::write::GzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
    Xz2(xz2::write::XzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
}

impl<W: Write> Encoder<W> {
    /// Writes the compression trailer and returns the inner sink.
    pub fn finish(self) -> io::Result<W> {
        let mut inner = match self {
            Encoder::Plain(w) => w,
            Encoder::Gz(e) => e.finish()?,
            Encoder::Zstd(e) => e.finish()?,
            Encoder::Xz2(e) => e.finish()?,
            Encoder::Bzip2(e) => e.finish()?,
        };
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(
        &mut self,
        buf: &[u8],
    ) -> io::Result<usize> {
        match self {
            Encoder::Plain(w) => w.write(buf),
            Encoder::Gz(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
            Encoder::Xz2(e) => e.write(buf),
            Encoder::Bzip2(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Plain(w) => w.flush(),
            Encoder::Gz(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
            Encoder::Xz2(e) => e.flush(),
            Encoder::Bzip2(e) => e.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use rstest::rstest;
    use tempfile::tempdir;

    use super::*;

    #[rstest]
    #[case("sample.tsv", Compression::None)]
    #[case("sample.tsv.gz", Compression::Gz)]
    #[case("sample.tsv.bgz", Compression::Gz)]
    #[case("sample.tsv.GZ", Compression::Gz)]
    #[case("sample.tsv.zst", Compression::Zstd)]
    #[case("sample.tsv.bz2", Compression::Bzip2)]
    #[case("sample.tsv.xz", Compression::Xz2)]
    fn test_from_path(
        #[case] path: &str,
        #[case] expected: Compression,
    ) {
        assert_eq!(Compression::from_path(path), expected);
    }

    #[rstest]
    #[case::gz(Compression::Gz)]
    #[case::zstd(Compression::Zstd)]
    #[case::xz(Compression::Xz2)]
    #[case::bzip2(Compression::Bzip2)]
    fn test_encoder_finishes_stream(#[case] compression: Compression) {
        let dir = tempdir().unwrap();
        let path = dir
            .path()
            .join(format!("data.tsv.{}", compression.extension().unwrap()));
        let text = "chr1\t1\t+\tCGA\t1\t2\t1\n".repeat(1000);

        let mut encoder = compression
            .get_encoder(File::create(&path).unwrap(), None)
            .unwrap();
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let mut decoded = String::new();
        open_text(&path)
            .unwrap()
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, text);
    }

    #[test]
    fn test_concatenated_gzip_members() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("multi.tsv.gz");
        let mut file = File::create(&path).unwrap();
        for chunk in ["a\n", "b\n"] {
            let mut encoder = Compression::Gz.get_encoder(Vec::new(), None).unwrap();
            encoder.write_all(chunk.as_bytes()).unwrap();
            file.write_all(&encoder.finish().unwrap()).unwrap();
        }
        drop(file);

        let mut decoded = String::new();
        open_text(&path)
            .unwrap()
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "a\nb\n");
    }
}
