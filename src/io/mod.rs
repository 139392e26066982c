pub mod allc;
pub mod compression;
pub mod fasta;
pub mod index;
pub mod pileup;
