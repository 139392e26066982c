use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use itertools::Itertools;
use serde::{
    Deserialize,
    Serialize,
};

use crate::error::AllcError;

/// Concrete bases an IUPAC nucleotide code stands for.
pub fn iupac_bases(code: u8) -> Option<&'static [u8]> {
    let bases: &'static [u8] = match code.to_ascii_uppercase() {
        b'A' => b"A",
        b'C' => b"C",
        b'G' => b"G",
        b'T' => b"T",
        b'R' => b"AG",
        b'Y' => b"CT",
        b'S' => b"CG",
        b'W' => b"AT",
        b'K' => b"GT",
        b'M' => b"AC",
        b'B' => b"CGT",
        b'D' => b"AGT",
        b'H' => b"ACT",
        b'V' => b"ACG",
        b'N' => b"ACGT",
        _ => return None,
    };
    Some(bases)
}

/// A methylation-type filter such as `CGN` or `CHH`, written with IUPAC
/// codes and matched position by position against record contexts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContextPattern {
    pattern: String,
}

impl ContextPattern {
    pub fn new(pattern: &str) -> Result<Self, AllcError> {
        let pattern = pattern.to_ascii_uppercase();
        if let Some(code) = pattern.bytes().find(|b| iupac_bases(*b).is_none()) {
            return Err(AllcError::InvalidPattern {
                pattern,
                code: code as char,
            });
        }
        Ok(Self { pattern })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn len(&self) -> usize {
        self.pattern.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    /// Every concrete `ACGT` context the pattern matches.
    pub fn expand(&self) -> BTreeSet<String> {
        self.pattern
            .bytes()
            .filter_map(iupac_bases)
            .map(|bases| bases.iter().copied())
            .multi_cartesian_product()
            .map(|bytes| bytes.into_iter().map(char::from).collect::<String>())
            .collect()
    }

    /// Whether `context` is matched. A context base equal to the ambiguity
    /// code itself also matches, so reference `N` bases pass an `N`
    /// position.
    pub fn matches(
        &self,
        context: &str,
    ) -> bool {
        context.len() == self.pattern.len()
            && self
                .pattern
                .bytes()
                .zip(context.bytes())
                .all(|(code, base)| {
                    let base = base.to_ascii_uppercase();
                    base == code
                        || iupac_bases(code)
                            .map(|bases| bases.contains(&base))
                            .unwrap_or(false)
                })
    }
}

/// Expands several patterns into the union of their concrete contexts.
pub fn expand_patterns<'a, I>(patterns: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a ContextPattern>, {
    patterns
        .into_iter()
        .flat_map(ContextPattern::expand)
        .collect()
}

impl FromStr for ContextPattern {
    type Err = AllcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContextPattern {
    type Error = AllcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ContextPattern> for String {
    fn from(value: ContextPattern) -> Self {
        value.pattern
    }
}

impl Display for ContextPattern {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.pattern)
    }
}
