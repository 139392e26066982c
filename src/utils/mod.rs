//! Helpers shared across the crate: the global thread pool, builder macros
//! for config structs and small path utilities.

use std::ffi::OsString;
use std::fs::File;
use std::io::{
    self,
    BufReader,
};
use std::path::{
    Path,
    PathBuf,
};

use anyhow::Context;
use once_cell::sync::Lazy;
use rayon::{
    ThreadPool,
    ThreadPoolBuilder,
};
use serde::de::DeserializeOwned;

/// Global pool for independent per-file work. Sized by `ALLC_NUM_THREADS`,
/// all cores if unset.
pub static THREAD_POOL: Lazy<ThreadPool> = Lazy::new(|| {
    let num_threads: Option<usize> = std::env::var("ALLC_NUM_THREADS")
        .ok()
        .and_then(|str| str.parse::<usize>().ok());
    ThreadPoolBuilder::new()
        .num_threads(num_threads.unwrap_or(0))
        .build()
        .expect("Failed to create thread pool")
});

pub fn n_threads() -> usize {
    THREAD_POOL.current_num_threads()
}

#[macro_export]
macro_rules! getter_fn {
    ($field_name: ident, $field_type: ty) => {
        pub fn $field_name(&self) -> &$field_type {
            &self.$field_name
        }
    };
}
pub use getter_fn;

#[macro_export]
macro_rules! with_field_fn {
    ($field_name: ident, $field_type: ty) => {
        paste::paste! {
            pub fn [<with_$field_name>](mut self, value: $field_type) -> Self {
            self.$field_name = value;
            self
            }
        }
    };
}
pub use with_field_fn;

/// Reads a JSON config file. Missing fields take their defaults when the
/// target type is `#[serde(default)]`.
pub fn read_json_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> anyhow::Result<T> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open config {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse config {}", path.display()))
}

/// `path` with `suffix` appended to the file name, e.g. `a.tsv` -> `a.tsv.idx`.
pub fn append_suffix<P: AsRef<Path>>(
    path: P,
    suffix: &str,
) -> PathBuf {
    let mut os: OsString = path.as_ref().as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Directory holding `path`; `.` for bare file names.
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Whether an I/O error means the process ran out of file descriptors.
pub fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    // EMFILE (per process) and ENFILE (system wide).
    matches!(err.raw_os_error(), Some(24) | Some(23))
}

/// Sample name of an ALLC path: the file name without a leading `allc_`
/// and without everything from `.tsv` on.
pub fn infer_sample_name<P: AsRef<Path>>(path: P) -> String {
    let name = path
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.strip_prefix("allc_").unwrap_or(&name);
    match name.find(".tsv") {
        Some(idx) => name[..idx].to_string(),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("/data/allc_sample1.tsv.gz", "sample1")]
    #[case("allc_A.tsv", "A")]
    #[case("B.tsv.gz", "B")]
    #[case("dir/allc_C", "C")]
    #[case("my_allc_D.tsv", "my_allc_D")]
    fn test_infer_sample_name(
        #[case] path: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(infer_sample_name(path), expected);
    }

    #[test]
    fn test_append_suffix() {
        assert_eq!(
            append_suffix("out/merged.tsv.gz", ".idx"),
            PathBuf::from("out/merged.tsv.gz.idx")
        );
    }

    #[test]
    fn test_parent_dir_of_bare_name() {
        assert_eq!(parent_dir(Path::new("merged.tsv")), Path::new("."));
        assert_eq!(parent_dir(Path::new("out/merged.tsv")), Path::new("out"));
    }

    #[test]
    fn test_descriptor_exhaustion() {
        assert!(is_descriptor_exhaustion(&io::Error::from_raw_os_error(24)));
        assert!(!is_descriptor_exhaustion(&io::Error::from_raw_os_error(2)));
    }
}
