//! Navigation parsing: NCX navMap and the EPUB 3 nav document fallback.

use quick_xml::events::Event;
use quick_xml::Reader;

use markup5ever_rcdom::Handle;

use crate::dom;
use crate::epub::package::{local_name, resolve_path};
use crate::error::{Error, Result};

/// One navigation entry. `content_path` is archive-absolute and
/// fragment-free; `fragment` carries the target id without the `#`.
#[derive(Debug, Clone, Default)]
pub struct NavPoint {
    pub label: String,
    pub content_path: String,
    pub fragment: String,
    pub children: Vec<NavPoint>,
}

impl NavPoint {
    fn from_src(label: String, src: &str, base_dir: &str) -> Self {
        let (path, fragment) = match src.split_once('#') {
            Some((p, f)) => (p, f.to_string()),
            None => (src, String::new()),
        };
        NavPoint {
            label,
            content_path: resolve_path(base_dir, path),
            fragment,
            children: Vec::new(),
        }
    }

    /// Total number of entries in this subtree.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(NavPoint::count).sum::<usize>()
    }
}

/// Parse an NCX document into a NavPoint tree. `ncx_dir` is the directory
/// of the NCX file inside the archive.
pub fn parse_ncx(content: &str, ncx_dir: &str) -> Result<Vec<NavPoint>> {
    struct State {
        children: Vec<NavPoint>,
        label: Option<String>,
        src: Option<String>,
    }

    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<State> = vec![State {
        children: Vec::new(),
        label: None,
        src: None,
    }];
    let mut in_text = false;
    let mut in_nav_map = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match local_name(e.name().as_ref()) {
                b"navMap" => in_nav_map = true,
                b"navPoint" if in_nav_map => stack.push(State {
                    children: Vec::new(),
                    label: None,
                    src: None,
                }),
                b"text" if in_nav_map => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if in_nav_map && local_name(e.name().as_ref()) == b"content" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"src" {
                            if let Some(state) = stack.last_mut() {
                                state.src = Some(
                                    String::from_utf8_lossy(&attr.value).into_owned(),
                                );
                            }
                        }
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if in_text {
                    if let Some(state) = stack.last_mut() {
                        let raw = String::from_utf8_lossy(e.as_ref());
                        match &mut state.label {
                            Some(existing) => existing.push_str(&raw),
                            None => state.label = Some(raw.into_owned()),
                        }
                    }
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if in_text {
                    if let Some(state) = stack.last_mut() {
                        let resolved = crate::epub::package::resolve_entity(
                            &String::from_utf8_lossy(e.as_ref()),
                        );
                        match &mut state.label {
                            Some(existing) => existing.push_str(&resolved),
                            None => state.label = Some(resolved),
                        }
                    }
                }
            }
            Ok(Event::End(e)) => match local_name(e.name().as_ref()) {
                b"navMap" => in_nav_map = false,
                b"text" => in_text = false,
                b"navPoint" => {
                    if let Some(state) = stack.pop() {
                        if let (Some(label), Some(src)) = (state.label, state.src) {
                            let mut point =
                                NavPoint::from_src(label.trim().to_string(), &src, ncx_dir);
                            point.children = state.children;
                            if let Some(parent) = stack.last_mut() {
                                parent.children.push(point);
                            }
                        } else if let Some(parent) = stack.last_mut() {
                            // Keep orphaned children attached to the grandparent
                            parent.children.extend(state.children);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(e)),
            _ => {}
        }
    }

    Ok(stack.pop().map(|s| s.children).unwrap_or_default())
}

/// Parse an EPUB 3 navigation document (`properties="nav"`) into the same
/// NavPoint model. Lenient HTML parse; the `epub:type="toc"` nav wins,
/// otherwise the first `<nav>` with a list.
pub fn parse_nav_doc(content: &[u8], nav_dir: &str) -> Vec<NavPoint> {
    let dom = dom::parse_html(content);
    let navs = dom::find_all(&dom.document, "nav");
    let toc_nav = navs
        .iter()
        .find(|n| {
            dom::get_attr(n, "epub:type")
                .map(|t| t.split_ascii_whitespace().any(|v| v == "toc"))
                .unwrap_or(false)
        })
        .or_else(|| navs.first())
        .cloned();

    match toc_nav.and_then(|nav| dom::find_first(&nav, "ol")) {
        Some(ol) => parse_nav_list(&ol, nav_dir),
        None => Vec::new(),
    }
}

fn parse_nav_list(ol: &Handle, nav_dir: &str) -> Vec<NavPoint> {
    let mut points = Vec::new();
    for li in ol.children.borrow().iter() {
        if dom::element_name(li).as_deref() != Some("li") {
            continue;
        }
        let mut point: Option<NavPoint> = None;
        let mut children = Vec::new();
        for child in li.children.borrow().iter() {
            match dom::element_name(child).as_deref() {
                Some("a") if point.is_none() => {
                    let label = dom::text_content(child).trim().to_string();
                    if let Some(href) = dom::get_attr(child, "href") {
                        point = Some(NavPoint::from_src(label, &href, nav_dir));
                    }
                }
                Some("ol") => children.extend(parse_nav_list(child, nav_dir)),
                _ => {}
            }
        }
        if let Some(mut p) = point {
            p.children = children;
            points.push(p);
        } else {
            points.extend(children);
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    const NCX: &str = r#"<?xml version="1.0"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <navMap>
    <navPoint id="p1" playOrder="1">
      <navLabel><text>Chapter 1</text></navLabel>
      <content src="text/ch01.xhtml"/>
      <navPoint id="p1a" playOrder="2">
        <navLabel><text>Section 1.1</text></navLabel>
        <content src="text/ch01.xhtml#s1"/>
      </navPoint>
    </navPoint>
    <navPoint id="p2" playOrder="3">
      <navLabel><text>&#31532;2&#31456;</text></navLabel>
      <content src="text/ch02.xhtml"/>
    </navPoint>
  </navMap>
</ncx>"#;

    #[test]
    fn test_parse_ncx_tree() {
        let points = parse_ncx(NCX, "OEBPS").unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].label, "Chapter 1");
        assert_eq!(points[0].content_path, "OEBPS/text/ch01.xhtml");
        assert_eq!(points[0].fragment, "");
        assert_eq!(points[0].children.len(), 1);
        assert_eq!(points[0].children[0].fragment, "s1");
        assert_eq!(points[1].label, "第2章");
    }

    #[test]
    fn test_parse_nav_doc() {
        let nav = br#"<html xmlns:epub="http://www.idpf.org/2007/ops"><body>
<nav epub:type="toc"><ol>
  <li><a href="ch01.xhtml">One</a>
    <ol><li><a href="ch01.xhtml#sec">One.One</a></li></ol>
  </li>
  <li><a href="ch02.xhtml">Two</a></li>
</ol></nav></body></html>"#;
        let points = parse_nav_doc(nav, "OEBPS/text");
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].content_path, "OEBPS/text/ch01.xhtml");
        assert_eq!(points[0].children[0].fragment, "sec");
        assert_eq!(points[1].label, "Two");
    }

    #[test]
    fn test_count() {
        let points = parse_ncx(NCX, "").unwrap();
        let total: usize = points.iter().map(NavPoint::count).sum();
        assert_eq!(total, 3);
    }
}
