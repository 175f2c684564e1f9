//! MOBI/AZW3 binary encoding: PalmDoc compression, EXTH metadata,
//! language codes, and the record-level writer.

pub mod exth;
pub mod lang;
pub mod palmdoc;
pub mod writer;

pub use writer::{EncodeParams, MobiEncoder, RecordPlan};
