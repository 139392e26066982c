#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{
    Path,
    PathBuf,
};

use allctools::data_structs::{
    AllcRecord,
    Strand,
};
use allctools::io::allc::{
    AllcReader,
    AllcWriter,
};
use rand::Rng;

pub const FASTA: &str = ">chr1\nTTCGATTC\n>chr2\nGGCGCA\n";
pub const FAI: &str = "chr1\t8\t6\t8\t9\nchr2\t6\t21\t6\t7\n";

pub fn init_logger() {
    let _ = pretty_env_logger::try_init();
}

/// Summed `(mc, cov, count)` per `(chrom, pos)`.
pub type SiteTotals = BTreeMap<(String, u32), (u32, u32, u32)>;

pub fn write_text(
    dir: &Path,
    name: &str,
    lines: &[&str],
) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    path
}

/// Writes records through [`AllcWriter`], so the extension picks the
/// compression.
pub fn write_records(
    path: &Path,
    records: &[AllcRecord],
) {
    let mut writer = AllcWriter::from_path(path, 1_000).unwrap();
    for record in records {
        writer.write_record(record).unwrap();
    }
    writer.finish().unwrap();
}

pub fn read_records(path: &Path) -> Vec<AllcRecord> {
    AllcReader::from_path(path)
        .unwrap()
        .collect::<anyhow::Result<Vec<_>>>()
        .unwrap()
}

pub fn read_lines(path: &Path) -> Vec<String> {
    read_records(path).iter().map(ToString::to_string).collect()
}

pub fn totals(records: &[AllcRecord]) -> SiteTotals {
    let mut totals = SiteTotals::new();
    for record in records {
        let entry = totals
            .entry((record.chrom.to_string(), record.pos))
            .or_insert((0, 0, 0));
        entry.0 += record.mc;
        entry.1 += record.cov;
        entry.2 += record.count;
    }
    totals
}

/// A sorted random sample over `chroms`. Strand and context depend only on
/// the position, so equal positions of different samples agree.
pub fn random_sample<R: Rng>(
    rng: &mut R,
    chroms: &[&str],
    max_pos: u32,
    density: f64,
) -> Vec<AllcRecord> {
    let mut records = Vec::new();
    for chrom in chroms {
        if rng.gen_bool(0.2) {
            continue;
        }
        for pos in 1..=max_pos {
            if !rng.gen_bool(density) {
                continue;
            }
            let (strand, context) = if pos % 2 == 0 {
                (Strand::Forward, "CGA")
            }
            else {
                (Strand::Reverse, "CHG")
            };
            let cov = rng.gen_range(1..30);
            let mc = rng.gen_range(0..=cov);
            records.push(AllcRecord::new(
                (*chrom).into(),
                pos,
                strand,
                context.to_string(),
                mc,
                cov,
            ));
        }
    }
    records
}

/// Positions strictly increase within each chromosome and every chromosome
/// forms one block.
pub fn assert_sorted(records: &[AllcRecord]) {
    let mut seen: Vec<&str> = Vec::new();
    for pair in records.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.chrom == b.chrom {
            assert!(a.pos < b.pos, "{} not before {}", a, b);
        }
        else {
            seen.push(a.chrom.as_str());
            assert!(!seen.contains(&b.chrom.as_str()), "{} split into blocks", b.chrom);
        }
    }
}
