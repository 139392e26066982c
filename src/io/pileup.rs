//! Parsing of `samtools mpileup` text output.

use std::borrow::Cow;

use anyhow::{
    anyhow,
    Context,
};

use crate::data_structs::typedef::{
    CountType,
    PosType,
};

/// The columns of a pileup line used for calling: chromosome, 1-based
/// position, reference base and the read-base string. Depth and qualities
/// are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PileupLine<'a> {
    pub chrom:    &'a str,
    pub pos:      PosType,
    pub ref_base: u8,
    pub bases:    &'a [u8],
}

impl<'a> PileupLine<'a> {
    pub fn parse(line: &'a str) -> anyhow::Result<Self> {
        let line = line.trim_end_matches(&['\n', '\r'][..]);
        let mut fields = line.split('\t');
        let mut next = |name: &str| {
            fields
                .next()
                .ok_or_else(|| anyhow!("pileup line has no {} column: {:?}", name, line))
        };
        let chrom = next("chromosome")?;
        let pos = next("position")?;
        let pos = pos
            .parse::<PosType>()
            .with_context(|| format!("invalid pileup position {:?}", pos))?;
        let ref_base = next("reference base")?
            .bytes()
            .next()
            .map(|b| b.to_ascii_uppercase())
            .unwrap_or(b'N');
        next("depth")?;
        // Zero-depth lines may end right after the depth column.
        let bases = fields.next().unwrap_or("").as_bytes();

        Ok(Self {
            chrom,
            pos,
            ref_base,
            bases,
        })
    }
}

/// Removes insertion and deletion calls (`+2AT`, `-1G`, ...) from a
/// read-base string. A sign that is not followed by digits is kept.
pub fn strip_indels(bases: &[u8]) -> Cow<'_, [u8]> {
    if !bases.iter().any(|b| matches!(b, b'+' | b'-')) {
        return Cow::Borrowed(bases);
    }

    let mut out = Vec::with_capacity(bases.len());
    let mut prev = 0;
    let mut i = 0;
    while i < bases.len() {
        if !matches!(bases[i], b'+' | b'-') {
            i += 1;
            continue;
        }
        let digits_start = i + 1;
        let digits_end = bases[digits_start..]
            .iter()
            .position(|b| !b.is_ascii_digit())
            .map(|p| digits_start + p)
            .unwrap_or(bases.len());
        if digits_end == digits_start {
            i += 1;
            continue;
        }
        let size = bases[digits_start..digits_end]
            .iter()
            .fold(0usize, |acc, d| {
                acc.saturating_mul(10).saturating_add((d - b'0') as usize)
            });
        out.extend_from_slice(&bases[prev..i]);
        i = digits_end.saturating_add(size).min(bases.len());
        prev = i;
    }
    out.extend_from_slice(&bases[prev..]);
    Cow::Owned(out)
}

/// Removes read-start (`^` plus the mapping-quality character) and
/// read-end (`$`) markers.
pub fn strip_read_markers(bases: &[u8]) -> Cow<'_, [u8]> {
    if !bases.iter().any(|b| matches!(b, b'^' | b'$')) {
        return Cow::Borrowed(bases);
    }
    let mut out = Vec::with_capacity(bases.len());
    let mut iter = bases.iter();
    while let Some(&b) = iter.next() {
        match b {
            b'^' => {
                iter.next();
            },
            b'$' => {},
            _ => out.push(b),
        }
    }
    Cow::Owned(out)
}

/// Bisulfite read-base tallies of one pileup column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseCounts {
    /// `.`: reference match on the forward strand.
    pub forward_match:   CountType,
    /// `T`: C->T conversion on the forward strand.
    pub forward_convert: CountType,
    /// `,`: reference match on the reverse strand.
    pub reverse_match:   CountType,
    /// `a`: G->A conversion seen on the reverse strand.
    pub reverse_convert: CountType,
}

impl BaseCounts {
    pub fn count(bases: &[u8]) -> Self {
        bases.iter().fold(Self::default(), |mut acc, b| {
            match b {
                b'.' => acc.forward_match += 1,
                b'T' => acc.forward_convert += 1,
                b',' => acc.reverse_match += 1,
                b'a' => acc.reverse_convert += 1,
                _ => {},
            }
            acc
        })
    }

    /// `(mc, cov)` of a C reference site.
    pub fn forward(&self) -> (CountType, CountType) {
        (self.forward_match, self.forward_match + self.forward_convert)
    }

    /// `(mc, cov)` of a G reference site.
    pub fn reverse(&self) -> (CountType, CountType) {
        (self.reverse_match, self.reverse_match + self.reverse_convert)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_parse_line() {
        let line = PileupLine::parse("chr1\t42\tc\t5\t..,T^!.\tIIIII\n").unwrap();
        assert_eq!(line.chrom, "chr1");
        assert_eq!(line.pos, 42);
        assert_eq!(line.ref_base, b'C');
        assert_eq!(line.bases, b"..,T^!.");
    }

    #[test]
    fn test_parse_zero_depth_line() {
        let line = PileupLine::parse("chr1\t1\tN\t0").unwrap();
        assert!(line.bases.is_empty());
        assert!(PileupLine::parse("chr1\tx\tC\t1\t.").is_err());
        assert!(PileupLine::parse("chr1\t1").is_err());
    }

    #[rstest]
    #[case::no_indel("..,T", "..,T")]
    #[case::insertion(".+2TT..", "...")]
    #[case::deletion(".-1A,", ".,")]
    #[case::multi_digit(".+12ACGTACGTACGT.", "..")]
    #[case::bare_signs(".+.-", ".+.-")]
    #[case::past_end(".+5AT", ".")]
    #[case::adjacent("+1A-1C.", ".")]
    fn test_strip_indels(
        #[case] input: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(
            strip_indels(input.as_bytes()).as_ref(),
            expected.as_bytes()
        );
    }

    #[test]
    fn test_strip_read_markers() {
        assert_eq!(strip_read_markers(b"^,..$,").as_ref(), b"..,");
        assert_eq!(strip_read_markers(b"..").as_ref(), b"..");
    }

    #[test]
    fn test_base_counts() {
        let counts = BaseCounts::count(b"...,,T");
        assert_eq!(counts.forward(), (3, 4));
        assert_eq!(counts.reverse(), (2, 2));
        let counts = BaseCounts::count(b",,aA.t");
        assert_eq!(counts.reverse(), (2, 3));
    }
}
