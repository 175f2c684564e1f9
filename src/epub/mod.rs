//! EPUB reading: container access, package document model, navigation,
//! chapter content, and cover detection.

pub mod content;
pub mod cover;
pub mod ncx;
pub mod package;
pub mod reader;

pub use content::ChapterContent;
pub use cover::{Cover, CoverMethod};
pub use ncx::NavPoint;
pub use package::{Creator, GuideRef, ManifestItem, Metadata, Package, SpineRef};
pub use reader::EpubArchive;
