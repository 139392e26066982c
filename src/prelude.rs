pub use crate::data_structs::typedef::{
    ChromName,
    CountType,
    DensityType,
    PosType,
};
pub use crate::data_structs::{
    AllcRecord,
    ContextCounts,
    ContextPattern,
    ContextSummary,
    SnpCounts,
    Strand,
};
pub use crate::error::AllcError;
pub use crate::io::allc::{
    AllcReader,
    AllcSource,
    AllcWriter,
    CursorState,
};
pub use crate::io::compression::Compression;
pub use crate::io::fasta::ReferenceWindow;
pub use crate::io::index::ChromIndex;
pub use crate::tools::call::{
    call_bam,
    CallConfig,
    PileupCaller,
};
pub use crate::tools::filter::{
    filter_allc,
    filter_allc_files,
    FilterConfig,
    FilterReport,
};
pub use crate::tools::merge::{
    merge_allc_files,
    merge_minibatch,
    MergeConfig,
    MergeEngine,
    MergeReport,
    MergeResult,
    MergeTarget,
};
