//! Document composition: chapter integration, CSS rewriting, and
//! table-of-contents generation.

pub mod css;
pub mod integrate;
pub mod toc;

pub use integrate::HtmlIntegrator;
