//! Table-of-contents generation.
//!
//! Two outputs from the same navigation tree: the inline TOC DIV inserted
//! into the integrated HTML, and the binary NCX record carrying `filepos`
//! byte offsets into the final text. Filepos values are computed only once
//! the HTML byte stream is frozen.

use std::collections::HashMap;

use memchr::memmem;

use crate::compose::integrate::sanitize_id;
use crate::epub::ncx::NavPoint;
use crate::epub::package::GuideRef;
use crate::error::{Stage, Warning};

/// Default inline TOC heading.
const DEFAULT_TITLE: &str = "Table of Contents";

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// The merged-document anchor for a navigation target: `#chNN`,
/// `#chNN-<sanitized>`, `#kobo.…`, or `#` when the chapter is unknown.
fn entry_href(point: &NavPoint, chapter_ids: &HashMap<String, String>) -> String {
    match chapter_ids.get(&point.content_path) {
        Some(chapter_id) => {
            if point.fragment.is_empty() {
                format!("#{}", chapter_id)
            } else if point.fragment.starts_with("kobo.") {
                format!("#{}", point.fragment)
            } else {
                format!("#{}-{}", chapter_id, sanitize_id(&point.fragment))
            }
        }
        None => "#".to_string(),
    }
}

/// Build the inline TOC DIV.
pub fn build_inline_toc(
    nav: &[NavPoint],
    chapter_ids: &HashMap<String, String>,
    title: &str,
) -> String {
    let title = if title.trim().is_empty() {
        DEFAULT_TITLE
    } else {
        title
    };
    let mut out = String::from("<div id=\"toc\"><h1>");
    out.push_str(&escape(title));
    out.push_str("</h1>");
    push_inline_list(nav, chapter_ids, &mut out);
    out.push_str("</div>");
    out
}

fn push_inline_list(nav: &[NavPoint], chapter_ids: &HashMap<String, String>, out: &mut String) {
    if nav.is_empty() {
        return;
    }
    out.push_str("<ul>");
    for point in nav {
        out.push_str("<li><a href=\"");
        out.push_str(&entry_href(point, chapter_ids));
        out.push_str("\">");
        out.push_str(&escape(&point.label));
        out.push_str("</a>");
        push_inline_list(&point.children, chapter_ids, out);
        out.push_str("</li>");
    }
    out.push_str("</ul>");
}

/// Insert the TOC DIV immediately after the opening `<body…>` tag.
pub fn insert_inline_toc(html: &str, toc_div: &str) -> String {
    let insert_at = memmem::find(html.as_bytes(), b"<body")
        .and_then(|start| {
            html[start..]
                .find('>')
                .map(|close| start + close + 1)
        })
        .unwrap_or(0);
    let mut out = String::with_capacity(html.len() + toc_div.len());
    out.push_str(&html[..insert_at]);
    out.push_str(toc_div);
    out.push_str(&html[insert_at..]);
    out
}

/// Byte offset of the `<` opening the element carrying `id="<target>"`,
/// in the final HTML byte stream.
pub fn calculate_filepos(html: &[u8], target_id: &str) -> Option<usize> {
    let needle = format!("id=\"{}\"", target_id);
    let at = memmem::find(html, needle.as_bytes())?;
    // Walk backwards to the nearest tag open
    let mut pos = at;
    while pos > 0 && html[pos] != b'<' {
        pos -= 1;
    }
    if html[pos] == b'<' {
        Some(pos)
    } else {
        None
    }
}

/// Resolve a navigation target to a filepos, retrying with the chapter-only
/// id when the fragment form is absent.
fn resolve_filepos(
    html: &[u8],
    point: &NavPoint,
    chapter_ids: &HashMap<String, String>,
    warnings: &mut Vec<Warning>,
) -> Option<usize> {
    let chapter_id = chapter_ids.get(&point.content_path)?;
    let target = if point.fragment.is_empty() {
        chapter_id.clone()
    } else if point.fragment.starts_with("kobo.") {
        point.fragment.clone()
    } else {
        format!("{}-{}", chapter_id, sanitize_id(&point.fragment))
    };

    if let Some(pos) = calculate_filepos(html, &target) {
        return Some(pos);
    }
    if target != *chapter_id {
        if let Some(pos) = calculate_filepos(html, chapter_id) {
            warnings.push(Warning::new(
                Stage::Toc,
                format!(
                    "TOC fragment \"{}\" not found, using chapter start for \"{}\"",
                    point.fragment, point.label
                ),
            ));
            return Some(pos);
        }
    }
    warnings.push(Warning::new(
        Stage::Toc,
        format!("TOC entry \"{}\" has no target in the document", point.label),
    ));
    None
}

/// Build the binary NCX record over the frozen HTML bytes.
///
/// The record is itself an HTML document: optional `<guide>` references in
/// the head, then the navigation tree as nested lists whose anchors carry
/// 8-digit `filepos` offsets. Returns `None` when nothing resolved.
pub fn build_ncx_record(
    html: &[u8],
    nav: &[NavPoint],
    chapter_ids: &HashMap<String, String>,
    guide: &[GuideRef],
    title: &str,
    warnings: &mut Vec<Warning>,
) -> Option<Vec<u8>> {
    if nav.is_empty() {
        return None;
    }

    let mut list = String::new();
    let mut resolved = 0usize;
    push_ncx_list(html, nav, chapter_ids, warnings, &mut list, &mut resolved);
    if resolved == 0 {
        return None;
    }

    let mut guide_entries = String::new();
    for reference in guide {
        let (path, fragment) = match reference.href.split_once('#') {
            Some((p, f)) => (p, f.to_string()),
            None => (reference.href.as_str(), String::new()),
        };
        let point = NavPoint {
            label: reference.title.clone(),
            content_path: path.to_string(),
            fragment,
            children: Vec::new(),
        };
        // Guide targets outside the spine are simply skipped
        if chapter_ids.contains_key(&point.content_path) {
            let mut scratch = Vec::new();
            if let Some(pos) = resolve_filepos(html, &point, chapter_ids, &mut scratch) {
                guide_entries.push_str(&format!(
                    "<reference type=\"{}\" title=\"{}\" filepos=\"{:08}\"/>",
                    escape(&reference.ref_type),
                    escape(&reference.title),
                    pos
                ));
            }
        }
    }
    if let Some(toc_pos) = calculate_filepos(html, "toc") {
        guide_entries.push_str(&format!(
            "<reference type=\"toc\" title=\"{}\" filepos=\"{:08}\"/>",
            DEFAULT_TITLE, toc_pos
        ));
    }

    let title = if title.trim().is_empty() {
        DEFAULT_TITLE
    } else {
        title
    };
    let mut record = String::new();
    record.push_str("<html><head>");
    if !guide_entries.is_empty() {
        record.push_str("<guide>");
        record.push_str(&guide_entries);
        record.push_str("</guide>");
    }
    record.push_str("</head><body><h1>");
    record.push_str(&escape(title));
    record.push_str("</h1>");
    record.push_str(&list);
    record.push_str("</body></html>");
    Some(record.into_bytes())
}

fn push_ncx_list(
    html: &[u8],
    nav: &[NavPoint],
    chapter_ids: &HashMap<String, String>,
    warnings: &mut Vec<Warning>,
    out: &mut String,
    resolved: &mut usize,
) {
    if nav.is_empty() {
        return;
    }
    let mut items = String::new();
    for point in nav {
        let filepos = resolve_filepos(html, point, chapter_ids, warnings);
        let mut children = String::new();
        push_ncx_list(html, &point.children, chapter_ids, warnings, &mut children, resolved);
        match filepos {
            Some(pos) => {
                items.push_str(&format!(
                    "<li><a filepos=\"{:08}\">{}</a>{}</li>",
                    pos,
                    escape(&point.label),
                    children
                ));
                *resolved += 1;
            }
            None => {
                // Entry skipped; surviving children stay in the list
                items.push_str(&children);
            }
        }
    }
    if !items.is_empty() {
        out.push_str("<ul>");
        out.push_str(&items);
        out.push_str("</ul>");
    }
}
