pub mod call;
pub mod filter;
pub mod merge;
