//! Chapter content loading.
//!
//! Parses a single XHTML spine document into a lenient DOM and collects the
//! stylesheet and image references it makes, resolved to archive-absolute
//! paths, together with the presentational attributes inherited from the
//! body (or the html root).

use markup5ever_rcdom::RcDom;

use crate::dom;
use crate::epub::package::resolve_path;

/// Attributes inherited onto the chapter DIV, in emission order.
const INHERITED_ATTRS: [&str; 4] = ["class", "dir", "lang", "xml:lang"];

/// One loaded spine chapter.
pub struct ChapterContent {
    /// Manifest id of the spine item.
    pub id: String,
    /// Archive-absolute path of the chapter file.
    pub path: String,
    pub dom: RcDom,
    /// Linked stylesheets, archive-absolute, in link order.
    pub stylesheets: Vec<String>,
    /// Contents of inline `<style>` elements, in document order.
    pub inline_css: Vec<String>,
    /// Referenced images, archive-absolute, in document order.
    pub images: Vec<String>,
    /// `{class, dir, lang, xml:lang}` from body, falling back to html.
    pub body_attrs: Vec<(String, String)>,
}

impl ChapterContent {
    /// Directory of the chapter file inside the archive.
    pub fn dir(&self) -> &str {
        match self.path.rfind('/') {
            Some(idx) => &self.path[..idx],
            None => "",
        }
    }
}

/// Parse chapter bytes into a [`ChapterContent`].
pub fn load_chapter(id: &str, path: &str, bytes: &[u8]) -> ChapterContent {
    let tree = dom::parse_html(bytes);
    let dir = match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    };

    let mut stylesheets = Vec::new();
    for link in dom::find_all(&tree.document, "link") {
        let rel = dom::get_attr(&link, "rel").unwrap_or_default();
        let is_stylesheet = rel
            .split_ascii_whitespace()
            .any(|t| t.eq_ignore_ascii_case("stylesheet"));
        if is_stylesheet {
            if let Some(href) = dom::get_attr(&link, "href") {
                stylesheets.push(resolve_path(&dir, &href));
            }
        }
    }

    let inline_css: Vec<String> = dom::find_all(&tree.document, "style")
        .iter()
        .map(dom::text_content)
        .filter(|css| !css.trim().is_empty())
        .collect();

    let mut images = Vec::new();
    for img in dom::find_all(&tree.document, "img") {
        if let Some(src) = dom::get_attr(&img, "src") {
            if !is_remote(&src) {
                images.push(resolve_path(&dir, &src));
            }
        }
    }

    let body = dom::find_first(&tree.document, "body");
    let html = dom::find_first(&tree.document, "html");
    let mut body_attrs = Vec::new();
    for name in INHERITED_ATTRS {
        let value = body
            .as_ref()
            .and_then(|b| dom::get_attr(b, name))
            .or_else(|| html.as_ref().and_then(|h| dom::get_attr(h, name)));
        if let Some(value) = value {
            if !value.is_empty() {
                body_attrs.push((name.to_string(), value));
            }
        }
    }

    ChapterContent {
        id: id.to_string(),
        path: path.to_string(),
        dom: tree,
        stylesheets,
        inline_css,
        images,
        body_attrs,
    }
}

/// Whether an href carries a URL scheme (left untouched everywhere).
pub fn is_remote(href: &str) -> bool {
    match href.find(':') {
        Some(idx) => href[..idx]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'),
        None => false,
    }
}
