use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::Context as _;
use hashbrown::HashMap;
use serde::{
    Deserialize,
    Serialize,
    Serializer,
};

use super::typedef::DensityType;

/// Serializes a HashMap in deterministic order.
fn serialize_sorted_map<S, K: Ord + Serialize, V: Serialize>(
    map: &HashMap<K, V>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer, {
    let sorted_map: BTreeMap<_, _> = map.iter().collect();
    sorted_map.serialize(serializer)
}

/// Running methylated/total base counts of one context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextCounts {
    pub mc:  u64,
    pub cov: u64,
}

impl ContextCounts {
    pub fn mc_rate(&self) -> Option<DensityType> {
        (self.cov > 0).then(|| self.mc as DensityType / self.cov as DensityType)
    }
}

#[derive(Serialize)]
struct SummaryRow<'a> {
    context: &'a str,
    mc:      u64,
    cov:     u64,
    mc_rate: Option<DensityType>,
}

/// Per-context totals collected while calling a sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    #[serde(serialize_with = "serialize_sorted_map")]
    contexts: HashMap<String, ContextCounts>,
}

impl ContextSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        context: &str,
        mc: u64,
        cov: u64,
    ) {
        let entry = match self.contexts.get_mut(context) {
            Some(entry) => entry,
            None => self.contexts.entry(context.to_string()).or_default(),
        };
        entry.mc += mc;
        entry.cov += cov;
    }

    pub fn get(
        &self,
        context: &str,
    ) -> Option<&ContextCounts> {
        self.contexts.get(context)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Totals over all contexts.
    pub fn total(&self) -> ContextCounts {
        self.contexts.values().fold(ContextCounts::default(), |acc, c| {
            ContextCounts {
                mc:  acc.mc + c.mc,
                cov: acc.cov + c.cov,
            }
        })
    }

    /// Entries sorted by context.
    pub fn sorted(&self) -> Vec<(&str, ContextCounts)> {
        let mut entries: Vec<_> = self
            .contexts
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        entries
    }

    pub fn merge(
        &mut self,
        other: &ContextSummary,
    ) {
        for (context, counts) in other.contexts.iter() {
            self.add(context, counts.mc, counts.cov);
        }
    }

    /// Writes a `context, mc, cov, mc_rate` table.
    pub fn write_tsv<W: Write>(
        &self,
        sink: W,
    ) -> anyhow::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(sink);
        for (context, counts) in self.sorted() {
            writer.serialize(SummaryRow {
                context,
                mc: counts.mc,
                cov: counts.cov,
                mc_rate: counts.mc_rate(),
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_tsv_file(
        &self,
        path: &Path,
    ) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        self.write_tsv(file)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
