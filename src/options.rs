//! Conversion options shared across the pipeline.

use crate::images::ImageConfig;
use crate::mobi::EncodeParams;

/// All options controlling one conversion.
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Image re-encoding budgets.
    pub image: ImageConfig,
    /// Delete every `<img>` before integration; no image records are
    /// produced.
    pub no_images: bool,
    /// Escalate accumulated warnings to a fatal result (after the output
    /// has been produced).
    pub strict: bool,
    /// Injectable unique id and timestamp for reproducible output.
    pub encode: EncodeParams,
}
