use arcstr::ArcStr;

/// 1-based genomic coordinate.
pub type PosType = u32;
/// Base counts (`mc`, `cov`, `count`, SNP arrays).
pub type CountType = u32;
/// Interned chromosome name shared by every record of a block.
pub type ChromName = ArcStr;
/// Methylation level.
pub type DensityType = f64;
