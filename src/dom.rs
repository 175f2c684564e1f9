//! HTML parsing helpers over html5ever's reference DOM.
//!
//! Chapters are parsed leniently into `RcDom` trees; the integrator walks
//! them with the helpers here and emits XHTML text directly.

use html5ever::tendril::TendrilSink;
use html5ever::tree_builder::TreeBuilderOpts;
use html5ever::{parse_document, ParseOpts};
use markup5ever_rcdom::{Handle, NodeData, RcDom};

/// Parse HTML/XHTML content into a DOM tree.
pub fn parse_html(html: &[u8]) -> RcDom {
    let opts = ParseOpts {
        tree_builder: TreeBuilderOpts {
            drop_doctype: true,
            ..Default::default()
        },
        ..Default::default()
    };
    parse_document(RcDom::default(), opts).from_utf8().one(html)
}

/// Local tag name of an element node.
pub fn element_name(handle: &Handle) -> Option<String> {
    match handle.data {
        NodeData::Element { ref name, .. } => Some(name.local.as_ref().to_string()),
        _ => None,
    }
}

/// Get the first element with the given local name, depth first.
pub fn find_first(handle: &Handle, name: &str) -> Option<Handle> {
    if element_name(handle).as_deref() == Some(name) {
        return Some(handle.clone());
    }
    for child in handle.children.borrow().iter() {
        if let Some(found) = find_first(child, name) {
            return Some(found);
        }
    }
    None
}

/// Find all elements with the given local name, document order.
pub fn find_all(handle: &Handle, name: &str) -> Vec<Handle> {
    let mut results = Vec::new();
    find_all_into(handle, name, &mut results);
    results
}

fn find_all_into(handle: &Handle, name: &str, results: &mut Vec<Handle>) {
    if element_name(handle).as_deref() == Some(name) {
        results.push(handle.clone());
    }
    for child in handle.children.borrow().iter() {
        find_all_into(child, name, results);
    }
}

/// Get an attribute value from an element.
pub fn get_attr(handle: &Handle, attr_name: &str) -> Option<String> {
    if let NodeData::Element { ref attrs, .. } = handle.data {
        for attr in attrs.borrow().iter() {
            if attr.name.local.as_ref() == attr_name {
                return Some(attr.value.to_string());
            }
        }
    }
    None
}

/// Concatenated text content of a node, tags ignored.
pub fn text_content(handle: &Handle) -> String {
    let mut text = String::new();
    text_content_into(handle, &mut text);
    text
}

fn text_content_into(handle: &Handle, text: &mut String) {
    match handle.data {
        NodeData::Text { ref contents } => text.push_str(&contents.borrow()),
        _ => {
            for child in handle.children.borrow().iter() {
                text_content_into(child, text);
            }
        }
    }
}

/// Escape text node content for XHTML output.
pub fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Escape an attribute value for double-quoted XHTML output.
pub fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_find() {
        let dom = parse_html(b"<html><body><p id=\"a\">Hello <b>World</b></p></body></html>");
        let p = find_first(&dom.document, "p").unwrap();
        assert_eq!(get_attr(&p, "id").as_deref(), Some("a"));
        assert_eq!(text_content(&p), "Hello World");
    }

    #[test]
    fn test_find_all_order() {
        let dom = parse_html(b"<body><img src=\"a\"/><div><img src=\"b\"/></div></body>");
        let imgs = find_all(&dom.document, "img");
        let srcs: Vec<_> = imgs.iter().filter_map(|i| get_attr(i, "src")).collect();
        assert_eq!(srcs, vec!["a", "b"]);
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape_text("a<b&c"), "a&lt;b&amp;c");
        assert_eq!(escape_attr("say \"hi\""), "say &quot;hi&quot;");
    }
}
