mod common;

use std::path::PathBuf;

use allctools::io::index::ChromIndex;
use allctools::tools::merge::{
    merge_allc_files,
    MergeConfig,
};
use common::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rstest::rstest;
use tempfile::tempdir;

fn sources(
    dir: &std::path::Path,
    n: usize,
) -> (Vec<PathBuf>, SiteTotals) {
    let mut rng = StdRng::seed_from_u64(42);
    let mut all = Vec::new();
    let paths = (0..n)
        .map(|i| {
            let records = random_sample(&mut rng, &["chr1", "chr2", "chr3"], 150, 0.4);
            let path = dir.join(format!("allc_{}.tsv.gz", i));
            write_records(&path, &records);
            all.extend(records);
            path
        })
        .collect();
    (paths, totals(&all))
}

#[rstest]
#[case::single_worker(1)]
#[case::per_chrom(3)]
fn merge_files_into_compressed_indexed_output(#[case] n_workers: usize) {
    init_logger();
    let dir = tempdir().unwrap();
    let (paths, expected) = sources(dir.path(), 4);
    let config = MergeConfig::default().with_n_workers(n_workers);

    let report = merge_allc_files(&paths, dir.path().join("merged.tsv"), &config).unwrap();
    assert_eq!(report.output, dir.path().join("merged.tsv.gz"));
    assert!(!report.fallback);
    assert!(report.skipped.is_empty());

    let merged = read_records(&report.output);
    assert_sorted(&merged);
    assert_eq!(report.records as usize, merged.len());
    assert_eq!(totals(&merged), expected);

    let index = ChromIndex::read(ChromIndex::index_path(&report.output))
        .unwrap()
        .unwrap();
    assert_eq!(index, ChromIndex::build(&report.output).unwrap());
    assert_eq!(
        index.chroms().collect::<Vec<_>>(),
        report.chroms.iter().map(String::as_str).collect::<Vec<_>>()
    );

    // No partial files are left behind.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains("merged.tsv.gz_"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[test]
fn worker_count_does_not_change_output() {
    let dir = tempdir().unwrap();
    let (paths, _) = sources(dir.path(), 5);

    let single = merge_allc_files(
        &paths,
        dir.path().join("single.tsv"),
        &MergeConfig::default().with_compress(false),
    )
    .unwrap();
    let parallel = merge_allc_files(
        &paths,
        dir.path().join("parallel.tsv"),
        &MergeConfig::default().with_compress(false).with_n_workers(2),
    )
    .unwrap();
    assert_eq!(
        std::fs::read_to_string(&single.output).unwrap(),
        std::fs::read_to_string(&parallel.output).unwrap()
    );
}

#[rstest]
#[case::corrupt("chr1\t1\t+\tCGA\t1\t2\t1\nchr1\t5\t+\tCGA\tnot-a-number\t2\t1")]
#[case::mc_exceeds_cov("chr1\t1\t+\tCGA\t1\t2\t1\nchr1\t7\t+\tCGA\t9\t2\t1")]
#[case::bad_count("chr1\t1\t+\tCGA\t1\t2\t1\nchr1\t7\t+\tCGA\t1\t2\tmany")]
#[case::unsorted("chr1\t9\t+\tCGA\t1\t2\t1\nchr1\t3\t+\tCGA\t1\t2\t1")]
#[case::split_chrom(
    "chr1\t1\t+\tCGA\t1\t2\t1\nchr2\t1\t+\tCGA\t1\t2\t1\nchr1\t4\t+\tCGA\t1\t2\t1"
)]
fn damaged_sources_are_skipped(#[case] damaged: &str) {
    init_logger();
    let dir = tempdir().unwrap();
    let good = write_text(dir.path(), "good.tsv", &["chr1\t5\t+\tCGA\t1\t2\t1"]);
    let bad = write_text(dir.path(), "bad.tsv", &[damaged]);

    let report = merge_allc_files(
        &[good, bad.clone()],
        dir.path().join("out.tsv"),
        &MergeConfig::default().with_compress(false).with_n_workers(2),
    )
    .unwrap();
    assert_eq!(report.skipped, vec![bad]);
    assert_eq!(read_lines(&report.output), vec!["chr1\t5\t+\tCGA\t1\t2\t1"]);
}

#[rstest]
#[case::single_worker(1)]
#[case::per_chrom(2)]
fn damage_behind_a_fresh_sidecar_is_skipped(#[case] n_workers: usize) {
    init_logger();
    let dir = tempdir().unwrap();
    let good = write_text(dir.path(), "good.tsv", &["chr1\t5\t+\tCGA\t1\t2\t1"]);
    let bad = write_text(dir.path(), "bad.tsv", &[
        "chr1\t1\t+\tCGA\t1\t2\t1",
        "chr1\t7\t+\tCGA\t9\t2\t1",
    ]);
    // A sidecar written after the data counts as fresh, so indexing does not
    // rescan the file.
    std::fs::write(ChromIndex::index_path(&bad), "chr1\t0\n#eof\n").unwrap();

    let report = merge_allc_files(
        &[good, bad.clone()],
        dir.path().join("out.tsv"),
        &MergeConfig::default().with_compress(false).with_n_workers(n_workers),
    )
    .unwrap();
    assert_eq!(report.skipped, vec![bad.clone()]);
    assert!(!ChromIndex::index_path(&bad).exists());
    assert_eq!(read_lines(&report.output), vec!["chr1\t5\t+\tCGA\t1\t2\t1"]);
}

#[test]
fn no_usable_sources_is_an_error() {
    let dir = tempdir().unwrap();
    let bad = write_text(dir.path(), "bad.tsv", &["chr1\t1\t+\tCGA\t1\t1\t1", "garbage"]);
    let result = merge_allc_files(&[bad], dir.path().join("out.tsv"), &MergeConfig::default());
    assert!(result.is_err());
}

#[rstest]
#[case::single_worker(1)]
#[case::per_chrom(2)]
fn open_file_budget_falls_back_to_batches(#[case] n_workers: usize) {
    init_logger();
    let dir = tempdir().unwrap();
    let (paths, expected) = sources(dir.path(), 7);
    let config = MergeConfig::default()
        .with_n_workers(n_workers)
        .with_mini_batch(3)
        .with_max_open_sources(Some(3));

    let report = merge_allc_files(&paths, dir.path().join("out.tsv.gz"), &config).unwrap();
    assert!(report.fallback);

    let merged = totals(&read_records(&report.output));
    assert_eq!(merged.len(), expected.len());
    for (site, (mc, cov, _)) in expected {
        let (merged_mc, merged_cov, _) = merged[&site];
        assert_eq!((merged_mc, merged_cov), (mc, cov));
    }
}

#[test]
fn index_can_be_turned_off() {
    let dir = tempdir().unwrap();
    let (paths, _) = sources(dir.path(), 2);
    let report = merge_allc_files(
        &paths,
        dir.path().join("out.tsv.gz"),
        &MergeConfig::default().with_index(false),
    )
    .unwrap();
    assert!(report.output.exists());
    assert!(!ChromIndex::index_path(&report.output).exists());
}
