use std::fmt::{
    Display,
    Write,
};
use std::str::FromStr;

use itertools::Itertools;
use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;

use super::enums::Strand;
use super::typedef::{
    ChromName,
    CountType,
    DensityType,
    PosType,
};

/// Column names of the ALLC text format, in order.
pub const ALLC_COLUMNS: [&str; 9] = [
    "chrom",
    "pos",
    "strand",
    "context",
    "mc",
    "cov",
    "count",
    "matches",
    "mismatches",
];

/// Columns before the optional SNP pair.
const N_REQUIRED: usize = ALLC_COLUMNS.len() - 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseRecordError {
    #[error("missing column `{0}`")]
    MissingField(&'static str),
    #[error("column `{field}` is not an integer: {value:?}")]
    InvalidInteger { field: &'static str, value: String },
    #[error("mc ({mc}) exceeds cov ({cov})")]
    McExceedsCov { mc: CountType, cov: CountType },
    #[error("matches and mismatches have different lengths ({0} vs {1})")]
    SnpLengthMismatch(usize, usize),
}

fn parse_int<T: FromStr>(
    field: &'static str,
    value: &str,
) -> Result<T, ParseRecordError> {
    value.parse::<T>().map_err(|_| {
        ParseRecordError::InvalidInteger {
            field,
            value: value.to_string(),
        }
    })
}

/// Per-offset match/mismatch counts of the context window, used for SNP
/// filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnpCounts {
    pub matches:    Vec<CountType>,
    pub mismatches: Vec<CountType>,
}

impl SnpCounts {
    pub fn new(
        matches: Vec<CountType>,
        mismatches: Vec<CountType>,
    ) -> Result<Self, ParseRecordError> {
        if matches.len() != mismatches.len() {
            return Err(ParseRecordError::SnpLengthMismatch(
                matches.len(),
                mismatches.len(),
            ));
        }
        Ok(Self {
            matches,
            mismatches,
        })
    }

    pub fn zeros(len: usize) -> Self {
        Self {
            matches:    vec![0; len],
            mismatches: vec![0; len],
        }
    }

    fn parse(
        matches: &str,
        mismatches: &str,
    ) -> Result<Self, ParseRecordError> {
        let parse_list = |field: &'static str, value: &str| {
            value
                .split(',')
                .map(|v| parse_int::<CountType>(field, v))
                .collect::<Result<Vec<_>, _>>()
        };
        Self::new(
            parse_list("matches", matches)?,
            parse_list("mismatches", mismatches)?,
        )
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Element-wise saturating sum. Both sides must have the same length.
    pub fn add_assign(
        &mut self,
        other: &SnpCounts,
    ) {
        debug_assert_eq!(self.len(), other.len());
        for (acc, v) in self.matches.iter_mut().zip(&other.matches) {
            *acc = acc.saturating_add(*v);
        }
        for (acc, v) in self.mismatches.iter_mut().zip(&other.mismatches) {
            *acc = acc.saturating_add(*v);
        }
    }

    /// Mismatch fraction at a context offset, `None` if the offset is
    /// uncovered.
    pub fn mismatch_frac(
        &self,
        offset: usize,
    ) -> Option<DensityType> {
        let matches = *self.matches.get(offset)?;
        let mismatches = *self.mismatches.get(offset)?;
        let total = matches + mismatches;
        (total > 0).then(|| mismatches as DensityType / total as DensityType)
    }
}

/// One line of an ALLC file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllcRecord {
    pub chrom:   ChromName,
    /// 1-based position.
    pub pos:     PosType,
    pub strand:  Strand,
    pub context: String,
    /// Unconverted (methylated) base count.
    pub mc:      CountType,
    /// Total observed bases.
    pub cov:     CountType,
    /// Number of records this line stands for.
    pub count:   CountType,
    pub snp:     Option<SnpCounts>,
}

impl AllcRecord {
    pub fn new(
        chrom: ChromName,
        pos: PosType,
        strand: Strand,
        context: String,
        mc: CountType,
        cov: CountType,
    ) -> Self {
        Self {
            chrom,
            pos,
            strand,
            context,
            mc,
            cov,
            count: 1,
            snp: None,
        }
    }

    pub fn with_count(
        mut self,
        count: CountType,
    ) -> Self {
        self.count = count;
        self
    }

    pub fn with_snp(
        mut self,
        snp: Option<SnpCounts>,
    ) -> Self {
        self.snp = snp;
        self
    }

    /// Parses a line, reusing `chrom_cache` when the chromosome name is
    /// unchanged so records of one block share the same allocation.
    pub fn parse_interned(
        line: &str,
        chrom_cache: &mut Option<ChromName>,
    ) -> Result<Self, ParseRecordError> {
        let line = line.trim_end_matches(&['\n', '\r'][..]);
        let mut fields = line.split('\t');
        let mut next = |name: &'static str| {
            fields
                .next()
                .filter(|v| !v.is_empty())
                .ok_or(ParseRecordError::MissingField(name))
        };

        let chrom_str = next("chrom")?;
        let pos = parse_int::<PosType>("pos", next("pos")?)?;
        let strand = Strand::from_str(next("strand")?).unwrap_or(Strand::None);
        let context = next("context")?.to_string();
        let mc = parse_int::<CountType>("mc", next("mc")?)?;
        let cov = parse_int::<CountType>("cov", next("cov")?)?;
        let count = parse_int::<CountType>("count", next("count")?)?;
        let snp = match (next("matches"), next("mismatches")) {
            (Ok(matches), Ok(mismatches)) => {
                Some(SnpCounts::parse(matches, mismatches)?)
            },
            _ => None,
        };

        if mc > cov {
            return Err(ParseRecordError::McExceedsCov { mc, cov });
        }

        let chrom = match chrom_cache {
            Some(cached) if cached.as_str() == chrom_str => cached.clone(),
            _ => {
                let new = ChromName::from(chrom_str);
                *chrom_cache = Some(new.clone());
                new
            },
        };

        Ok(Self {
            chrom,
            pos,
            strand,
            context,
            mc,
            cov,
            count,
            snp,
        })
    }

    /// Whether the line is a header rather than a record: the position or
    /// count columns do not parse as integers.
    pub fn is_header_line(line: &str) -> bool {
        let fields = line.trim_end_matches(&['\n', '\r'][..]).split('\t').collect_vec();
        if fields.len() < N_REQUIRED {
            return true;
        }
        [1usize, 4, 5]
            .iter()
            .any(|&i| fields[i].parse::<u64>().is_err())
    }

    /// Appends the tab-separated line, including the trailing newline.
    pub fn write_line(
        &self,
        buf: &mut String,
    ) {
        // Writing into a String cannot fail.
        let _ = writeln!(buf, "{}", self);
    }

    pub fn density(&self) -> Option<DensityType> {
        (self.cov > 0).then(|| self.mc as DensityType / self.cov as DensityType)
    }
}

impl FromStr for AllcRecord {
    type Err = ParseRecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_interned(s, &mut None)
    }
}

impl Display for AllcRecord {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.chrom, self.pos, self.strand, self.context, self.mc, self.cov, self.count
        )?;
        if let Some(snp) = &self.snp {
            write!(
                f,
                "\t{}\t{}",
                snp.matches.iter().join(","),
                snp.mismatches.iter().join(",")
            )?;
        }
        Ok(())
    }
}
