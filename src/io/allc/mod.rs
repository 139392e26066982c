//! Reading and writing of ALLC text files.
//!
//! [`AllcSource`] is the seekable per-chromosome cursor the merge engine
//! drives. [`AllcReader`] streams a whole file. [`AllcWriter`] writes
//! records through a bounded [`LineBuffer`] and builds the chromosome index
//! inline.

mod reader;
mod writer;

pub use reader::{
    AllcReader,
    AllcSource,
    CursorState,
};
pub use writer::{
    AllcWriter,
    LineBuffer,
};
