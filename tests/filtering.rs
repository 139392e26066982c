mod common;

use allctools::data_structs::ContextPattern;
use allctools::tools::filter::{
    filter_allc,
    FilterConfig,
};
use allctools::tools::merge::{
    merge_allc_files,
    MergeConfig,
};
use common::*;
use tempfile::tempdir;

#[test]
fn filter_merged_output_by_context_and_coverage() {
    init_logger();
    let dir = tempdir().unwrap();
    let a = write_text(dir.path(), "a.tsv", &[
        "chr1\t1\t+\tCGA\t1\t2\t1",
        "chr1\t2\t-\tCAG\t1\t1\t1",
        "chr2\t8\t+\tCTT\t3\t4\t1",
    ]);
    let b = write_text(dir.path(), "b.tsv", &[
        "chr1\t1\t+\tCGA\t0\t2\t1",
        "chr2\t8\t+\tCTT\t0\t1\t1",
    ]);
    let merged = merge_allc_files(
        &[a, b],
        dir.path().join("merged.tsv"),
        &MergeConfig::default(),
    )
    .unwrap();

    let config = FilterConfig::default()
        .with_patterns(vec![ContextPattern::new("CGN").unwrap(), "CHH".parse().unwrap()])
        .with_min_cov(3);
    let report = filter_allc(&merged.output, dir.path().join("filtered.tsv"), &config).unwrap();
    assert_eq!(report.output, dir.path().join("filtered.tsv.gz"));
    assert_eq!((report.kept, report.total), (2, 3));
    assert_eq!(read_lines(&report.output), vec![
        "chr1\t1\t+\tCGA\t1\t4\t2",
        "chr2\t8\t+\tCTT\t3\t5\t2",
    ]);
}

#[test]
fn invalid_pattern_in_config_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("filter.json");
    std::fs::write(&path, r#"{"patterns": ["CGX"]}"#).unwrap();
    assert!(FilterConfig::from_json_file(&path).is_err());

    std::fs::write(&path, r#"{"patterns": ["cgn"], "max_cov": 50}"#).unwrap();
    let config = FilterConfig::from_json_file(&path).unwrap();
    assert_eq!(config.patterns, vec![ContextPattern::new("CGN").unwrap()]);
    assert_eq!(config.max_cov, Some(50));
    assert!(config.compress);
}
