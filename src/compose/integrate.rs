//! Chapter integration.
//!
//! Merges spine chapters into one XHTML document: each chapter becomes a
//! `<div id="chNN">` in spine order, element ids are namespaced, links are
//! rewritten to point into the merged document, HTML5 block tags are
//! converted to Kindle-safe equivalents, and aggregated CSS lands in a
//! single `<style>` element.
//!
//! Transforms are applied while serialising: the chapter DOM is walked once
//! and XHTML text is emitted directly, so no tree mutation is needed.

use std::collections::{HashMap, HashSet};

use markup5ever_rcdom::{Handle, NodeData};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::compose::css;
use crate::dom::{escape_attr, escape_text};
use crate::epub::content::{is_remote, ChapterContent};
use crate::epub::package::resolve_path;
use crate::error::{Stage, Warning};

/// URL form escaping: unreserved characters pass, space becomes `+`.
const QUERY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// HTML5 block tags Kindle does not render, with their replacements.
const TAG_CONVERSIONS: [(&str, &str); 8] = [
    ("article", "div"),
    ("section", "div"),
    ("aside", "div"),
    ("nav", "div"),
    ("header", "div"),
    ("footer", "div"),
    ("figure", "div"),
    ("figcaption", "p"),
];

/// Attributes stripped from every element.
const STRIPPED_ATTRS: [&str; 5] = [
    "contenteditable",
    "draggable",
    "hidden",
    "spellcheck",
    "translate",
];

/// Elements never emitted into the merged body.
const DROPPED_ELEMENTS: [&str; 6] = ["script", "style", "link", "meta", "title", "base"];

/// Elements emitted self-closing when empty.
const VOID_ELEMENTS: [&str; 6] = ["img", "br", "hr", "input", "wbr", "col"];

/// Escape an id for use inside a namespaced identifier.
pub fn sanitize_id(id: &str) -> String {
    id.split(' ')
        .map(|part| utf8_percent_encode(part, QUERY_ENCODE).to_string())
        .collect::<Vec<_>>()
        .join("+")
}

/// The namespaced form of an element id: `chNN-<sanitized>`, with
/// `kobo.`-prefixed ids preserved verbatim.
pub fn namespace_id(chapter_id: &str, id: &str) -> String {
    if id.starts_with("kobo.") {
        id.to_string()
    } else {
        format!("{}-{}", chapter_id, sanitize_id(id))
    }
}

pub struct HtmlIntegrator {
    chapters: Vec<ChapterContent>,
    /// chapter path -> assigned chapter id (`ch01`, `ch02`, ...)
    chapter_ids: HashMap<String, String>,
    /// chapter file basename -> chapter id, first spine occurrence wins
    basenames: HashMap<String, String>,
    /// Archive paths of manifest raster images (srcs that will become
    /// kindle:embed references later).
    manifest_images: HashSet<String>,
    global_css: Vec<String>,
    chapter_css: Vec<String>,
    remove_images: bool,
}

impl HtmlIntegrator {
    pub fn new(remove_images: bool, manifest_images: HashSet<String>) -> Self {
        Self {
            chapters: Vec::new(),
            chapter_ids: HashMap::new(),
            basenames: HashMap::new(),
            manifest_images,
            global_css: Vec::new(),
            chapter_css: Vec::new(),
            remove_images,
        }
    }

    /// Accept a chapter and assign it the next `chNN` id.
    pub fn add_chapter(&mut self, chapter: ChapterContent) -> String {
        let id = format!("ch{:02}", self.chapters.len() + 1);
        self.chapter_ids.insert(chapter.path.clone(), id.clone());
        let basename = chapter
            .path
            .rsplit('/')
            .next()
            .unwrap_or(&chapter.path)
            .to_string();
        self.basenames.entry(basename).or_insert_with(|| id.clone());
        self.chapters.push(chapter);
        id
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    pub fn chapters(&self) -> &[ChapterContent] {
        &self.chapters
    }

    /// chapter path -> chapter id table, for the TOC builder and tests.
    pub fn chapter_table(&self) -> &HashMap<String, String> {
        &self.chapter_ids
    }

    pub fn chapter_id(&self, path: &str) -> Option<&str> {
        self.chapter_ids.get(path).map(String::as_str)
    }

    /// Append CSS applied to the whole document (transformed, no
    /// namespacing).
    pub fn add_global_css(&mut self, source: &str) {
        self.global_css.push(css::transform_global(source));
    }

    /// Append CSS scoped to one chapter (transformed and namespaced).
    pub fn add_chapter_css(&mut self, chapter_id: &str, source: &str) {
        self.chapter_css
            .push(css::transform_namespaced(source, chapter_id));
    }

    /// Produce the integrated XHTML document.
    pub fn integrate(&self, warnings: &mut Vec<Warning>) -> String {
        let mut body = String::new();
        for chapter in &self.chapters {
            let chapter_id = &self.chapter_ids[&chapter.path];
            self.render_chapter(chapter, chapter_id, &mut body, warnings);
        }

        let mut style = String::new();
        for sheet in self.global_css.iter().chain(self.chapter_css.iter()) {
            if !style.is_empty() {
                style.push('\n');
            }
            style.push_str(sheet);
        }
        let style = style.replace("</style>", "<\\/style>");

        let mut doc = String::with_capacity(body.len() + style.len() + 256);
        doc.push_str(
            "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:mbp=\"http://mobipocket.com/ns/mbp\"><head><style type=\"text/css\">\n",
        );
        doc.push_str(&style);
        doc.push_str("\n</style></head><body>");
        doc.push_str(&body);
        doc.push_str("</body></html>");
        doc
    }

    fn render_chapter(
        &self,
        chapter: &ChapterContent,
        chapter_id: &str,
        out: &mut String,
        warnings: &mut Vec<Warning>,
    ) {
        out.push_str("<div id=\"");
        out.push_str(chapter_id);
        out.push('"');
        for (name, value) in &chapter.body_attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_attr(value));
            out.push('"');
        }
        out.push('>');
        out.push_str("<mbp:pagebreak/>");

        if let Some(body) = crate::dom::find_first(&chapter.dom.document, "body") {
            let ctx = RenderCtx {
                chapter_id,
                chapter_dir: chapter.dir(),
            };
            for child in body.children.borrow().iter() {
                self.render_node(child, &ctx, out, warnings);
            }
        }
        out.push_str("</div>");
    }

    fn render_node(
        &self,
        node: &Handle,
        ctx: &RenderCtx,
        out: &mut String,
        warnings: &mut Vec<Warning>,
    ) {
        match node.data {
            NodeData::Text { ref contents } => {
                out.push_str(&escape_text(&contents.borrow()));
            }
            NodeData::Element { ref name, ref attrs, .. } => {
                let tag = name.local.as_ref();
                if DROPPED_ELEMENTS.contains(&tag) {
                    return;
                }
                if tag == "img" && self.remove_images {
                    return;
                }

                let converted = TAG_CONVERSIONS
                    .iter()
                    .find(|(from, _)| *from == tag)
                    .map(|(_, to)| *to);
                let out_tag = converted.unwrap_or(tag);

                out.push('<');
                out.push_str(out_tag);

                let mut wrote_class = false;
                for attr in attrs.borrow().iter() {
                    let attr_name = attr.name.local.as_ref();
                    if STRIPPED_ATTRS.contains(&attr_name) || attr_name.starts_with("data-") {
                        continue;
                    }
                    let value = attr.value.to_string();
                    let rewritten = match attr_name {
                        "id" => namespace_id(ctx.chapter_id, &value),
                        "href" if tag == "a" => self.rewrite_href(&value, ctx, warnings),
                        "src" if tag == "img" => self.rewrite_img_src(&value, ctx),
                        "class" if converted.is_some() => {
                            wrote_class = true;
                            format!("{} {}", value, tag)
                        }
                        _ => value,
                    };
                    out.push(' ');
                    out.push_str(attr_name);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(&rewritten));
                    out.push('"');
                }
                if converted.is_some() && !wrote_class {
                    out.push_str(" class=\"");
                    out.push_str(tag);
                    out.push('"');
                }

                let children = node.children.borrow();
                if children.is_empty() && VOID_ELEMENTS.contains(&out_tag) {
                    out.push_str("/>");
                    return;
                }
                out.push('>');
                for child in children.iter() {
                    self.render_node(child, ctx, out, warnings);
                }
                out.push_str("</");
                out.push_str(out_tag);
                out.push('>');
            }
            _ => {
                for child in node.children.borrow().iter() {
                    self.render_node(child, ctx, out, warnings);
                }
            }
        }
    }

    /// Rewrite an `<a href>` to target the merged document.
    fn rewrite_href(&self, href: &str, ctx: &RenderCtx, warnings: &mut Vec<Warning>) -> String {
        if href.is_empty() || is_remote(href) {
            return href.to_string();
        }

        if let Some(frag) = href.strip_prefix('#') {
            // Fragment-only: resolves within the enclosing chapter
            if frag.starts_with("kobo.") {
                return format!("#{}", frag);
            }
            return format!("#{}-{}", ctx.chapter_id, sanitize_id(frag));
        }

        let (path, frag) = match href.split_once('#') {
            Some((p, f)) => (p, Some(f)),
            None => (href, None),
        };
        let resolved = resolve_path(ctx.chapter_dir, path);
        let target = self.chapter_ids.get(&resolved).or_else(|| {
            let basename = resolved.rsplit('/').next().unwrap_or(&resolved);
            self.basenames.get(basename)
        });

        match target {
            Some(chapter_id) => match frag {
                None | Some("") => format!("#{}", chapter_id),
                Some(frag) if frag.starts_with("kobo.") => format!("#{}", frag),
                Some(frag) => format!("#{}-{}", chapter_id, sanitize_id(frag)),
            },
            None => {
                warnings.push(Warning::new(
                    Stage::Integrate,
                    format!("link target not in spine: {}", href),
                ));
                href.to_string()
            }
        }
    }

    /// Resolve an `<img src>` to its archive-absolute path when the target
    /// is a manifest image; unknown srcs keep their original value.
    fn rewrite_img_src(&self, src: &str, ctx: &RenderCtx) -> String {
        if is_remote(src) {
            return src.to_string();
        }
        let resolved = resolve_path(ctx.chapter_dir, src);
        if self.manifest_images.contains(&resolved) {
            resolved
        } else {
            src.to_string()
        }
    }
}

struct RenderCtx<'a> {
    chapter_id: &'a str,
    chapter_dir: &'a str,
}
