//! # palmpress
//!
//! Converts EPUB ebooks into Kindle AZW3 (KF8) files.
//!
//! The pipeline reads the EPUB container, merges all spine chapters into
//! one integrated XHTML document (namespacing ids, rewriting links and
//! CSS so merged chapters cannot collide), optimises images under size
//! and quality budgets, generates an inline table of contents plus a
//! binary NCX record with byte-accurate `filepos` offsets, and assembles
//! the Palm Database: Record 0 (PalmDOC + MOBI + EXTH headers),
//! PalmDoc-compressed text records, image records, and the
//! FDST/FLIS/FCIS/EOF trailer.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::Path;
//! use palmpress::{convert_file, ConvertOptions};
//!
//! let warnings = convert_file(
//!     Path::new("input.epub"),
//!     Path::new("output.azw3"),
//!     ConvertOptions::default(),
//! )?;
//! for warning in &warnings {
//!     eprintln!("{}", warning);
//! }
//! # Ok::<(), palmpress::Error>(())
//! ```
//!
//! For in-memory conversion use [`Pipeline`] directly:
//!
//! ```no_run
//! use std::io::Cursor;
//! use palmpress::{ConvertOptions, Pipeline};
//!
//! let epub: Vec<u8> = std::fs::read("input.epub")?;
//! let conversion = Pipeline::new(ConvertOptions::default()).convert(Cursor::new(epub))?;
//! std::fs::write("output.azw3", &conversion.azw3)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod compose;
pub mod dom;
pub mod epub;
pub mod error;
pub mod images;
pub mod mobi;
pub mod options;
pub mod pipeline;

pub use error::{Error, Result, Stage, Warning};
pub use images::{ImageConfig, ImageMap};
pub use mobi::EncodeParams;
pub use options::ConvertOptions;
pub use pipeline::{convert_file, Conversion, Pipeline};
