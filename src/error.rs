//! Error types for palmpress operations.

use thiserror::Error;

/// Fatal errors that abort a conversion.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Invalid EPUB: {0}")]
    InvalidEpub(String),

    #[error("File not found in archive: {0}")]
    FileNotFound(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Missing required metadata: {0}")]
    MissingMetadata(&'static str),

    #[error("No valid XHTML chapters in spine")]
    NoChapters,

    #[error("Binary assembly error: {0}")]
    Assembly(String),

    #[error("UTF-8 decoding error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("strict mode: {0} recoverable warning(s) escalated")]
    StrictMode(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage a recoverable warning originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Cover,
    Integrate,
    Css,
    Images,
    Ncx,
    Toc,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Parse => "parse",
            Stage::Cover => "cover",
            Stage::Integrate => "integrate",
            Stage::Css => "css",
            Stage::Images => "images",
            Stage::Ncx => "ncx",
            Stage::Toc => "toc",
        };
        f.write_str(name)
    }
}

/// A recoverable problem, accumulated by the pipeline and escalated to
/// [`Error::StrictMode`] when strict mode is on.
#[derive(Debug, Clone)]
pub struct Warning {
    pub stage: Stage,
    pub message: String,
}

impl Warning {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.stage, self.message)
    }
}
