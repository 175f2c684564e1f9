//! Package document (OPF) parsing.
//!
//! Parses metadata, manifest, spine, and guide into the [`Package`] model.
//! All hrefs are resolved against the package directory and normalised to
//! forward-slash, archive-absolute form.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex_lite::Regex;

use crate::error::{Error, Result};
use crate::epub::reader::normalize_path;

/// A dc:creator with its MARC relator role (may be empty).
#[derive(Debug, Clone, Default)]
pub struct Creator {
    pub name: String,
    pub role: String,
}

/// Dublin Core metadata extracted from the package document.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub title: String,
    pub language: String,
    /// Identifier chosen by the ISBN-first selection rule.
    pub identifier: String,
    pub creators: Vec<Creator>,
    pub date: Option<String>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub subjects: Vec<String>,
    pub rights: Option<String>,
    /// Manifest id named by the legacy `<meta name="cover">` element.
    pub cover_id: Option<String>,
}

/// One manifest item, href archive-absolute.
#[derive(Debug, Clone)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: Vec<String>,
}

impl ManifestItem {
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| p.eq_ignore_ascii_case(name))
    }

    pub fn is_html(&self) -> bool {
        self.media_type == "application/xhtml+xml" || self.media_type == "text/html"
    }

    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }

    pub fn is_raster_image(&self) -> bool {
        self.is_image() && self.media_type != "image/svg+xml"
    }
}

/// A spine itemref.
#[derive(Debug, Clone)]
pub struct SpineRef {
    pub idref: String,
    pub linear: bool,
}

/// A guide reference, href archive-absolute with the fragment preserved.
#[derive(Debug, Clone)]
pub struct GuideRef {
    pub ref_type: String,
    pub title: String,
    pub href: String,
}

/// The parsed package document.
#[derive(Debug, Clone, Default)]
pub struct Package {
    pub metadata: Metadata,
    pub manifest: HashMap<String, ManifestItem>,
    /// Manifest ids in document order; the sole authority for image ordering.
    pub manifest_order: Vec<String>,
    pub spine: Vec<SpineRef>,
    pub guide: Vec<GuideRef>,
    pub ncx_path: Option<String>,
    pub nav_path: Option<String>,
    pub page_progression_direction: String,
}

impl Package {
    /// Look up a manifest item by id.
    pub fn item(&self, id: &str) -> Option<&ManifestItem> {
        self.manifest.get(id)
    }

    /// Look up a manifest item by archive-absolute href (fragment stripped).
    pub fn item_by_href(&self, href: &str) -> Option<&ManifestItem> {
        let path = href.split('#').next().unwrap_or(href);
        self.manifest_order
            .iter()
            .filter_map(|id| self.manifest.get(id))
            .find(|item| item.href == path)
    }

    /// Manifest items in document order.
    pub fn items_in_order(&self) -> impl Iterator<Item = &ManifestItem> {
        self.manifest_order
            .iter()
            .filter_map(move |id| self.manifest.get(id))
    }
}

/// Internal identifier capture before selection.
#[derive(Debug, Default)]
struct RawIdentifier {
    value: String,
    scheme: String,
    id: String,
}

#[derive(Debug)]
enum TextTarget {
    Dc(&'static str),
    /// `<meta property="role" refines="#id">` body text.
    RoleRefine(String),
}

/// Parse an OPF document. `opf_dir` is the directory of the package
/// document inside the archive (`""` for the root).
pub fn parse_opf(content: &str, opf_dir: &str) -> Result<Package> {
    let mut pkg = Package::default();
    let mut identifiers: Vec<RawIdentifier> = Vec::new();
    let mut unique_id_ref = String::new();
    let mut toc_id: Option<String> = None;
    let mut creator_ids: HashMap<String, usize> = HashMap::new();
    let mut pending_roles: Vec<(String, String)> = Vec::new();

    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut in_metadata = false;
    let mut target: Option<TextTarget> = None;
    let mut buf_text = String::new();
    let mut current_creator: Option<(String, String)> = None; // (id, role)
    let mut current_identifier: Option<RawIdentifier> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"package" => {
                        if let Some(v) = attr(&e, b"unique-identifier")? {
                            unique_id_ref = v;
                        }
                    }
                    b"metadata" => in_metadata = true,
                    b"title" if in_metadata => start_text(&mut target, &mut buf_text, "title"),
                    b"language" if in_metadata => {
                        start_text(&mut target, &mut buf_text, "language")
                    }
                    b"publisher" if in_metadata => {
                        start_text(&mut target, &mut buf_text, "publisher")
                    }
                    b"description" if in_metadata => {
                        start_text(&mut target, &mut buf_text, "description")
                    }
                    b"subject" if in_metadata => {
                        start_text(&mut target, &mut buf_text, "subject")
                    }
                    b"date" if in_metadata => start_text(&mut target, &mut buf_text, "date"),
                    b"rights" if in_metadata => start_text(&mut target, &mut buf_text, "rights"),
                    b"creator" if in_metadata => {
                        let id = attr(&e, b"id")?.unwrap_or_default();
                        let role = attr_local(&e, b"role")?.unwrap_or_default();
                        current_creator = Some((id, role));
                        start_text(&mut target, &mut buf_text, "creator");
                    }
                    b"identifier" if in_metadata => {
                        current_identifier = Some(RawIdentifier {
                            value: String::new(),
                            scheme: attr_local(&e, b"scheme")?.unwrap_or_default(),
                            id: attr(&e, b"id")?.unwrap_or_default(),
                        });
                        start_text(&mut target, &mut buf_text, "identifier");
                    }
                    b"meta" if in_metadata => {
                        handle_meta(&e, &mut pkg, &mut pending_roles)?;
                        // EPUB 3 role refinement may carry the value as text
                        if attr(&e, b"property")?.as_deref() == Some("role") {
                            if let Some(refines) = attr(&e, b"refines")? {
                                if attr(&e, b"content")?.is_none() {
                                    buf_text.clear();
                                    target = Some(TextTarget::RoleRefine(
                                        refines.trim_start_matches('#').to_string(),
                                    ));
                                }
                            }
                        }
                    }
                    b"spine" => {
                        toc_id = attr(&e, b"toc")?;
                        if let Some(dir) = attr(&e, b"page-progression-direction")? {
                            pkg.page_progression_direction = dir;
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"item" => {
                        if let Some(item) = parse_item(&e, opf_dir)? {
                            if !pkg.manifest.contains_key(&item.id) {
                                pkg.manifest_order.push(item.id.clone());
                                pkg.manifest.insert(item.id.clone(), item);
                            }
                        }
                    }
                    b"itemref" => {
                        if let Some(idref) = attr(&e, b"idref")? {
                            let linear = attr(&e, b"linear")?.as_deref() != Some("no");
                            pkg.spine.push(SpineRef { idref, linear });
                        }
                    }
                    b"reference" => {
                        let ref_type = attr(&e, b"type")?.unwrap_or_default();
                        let title = attr(&e, b"title")?.unwrap_or_default();
                        if let Some(href) = attr(&e, b"href")? {
                            pkg.guide.push(GuideRef {
                                ref_type,
                                title,
                                href: resolve_with_fragment(opf_dir, &href),
                            });
                        }
                    }
                    b"meta" if in_metadata => handle_meta(&e, &mut pkg, &mut pending_roles)?,
                    b"spine" => {
                        toc_id = attr(&e, b"toc")?;
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if target.is_some() {
                    buf_text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if target.is_some() {
                    buf_text.push_str(&resolve_entity(&String::from_utf8_lossy(e.as_ref())));
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                let local = local_name(name.as_ref());
                if local == b"metadata" {
                    in_metadata = false;
                }
                if let Some(t) = target.take() {
                    let text = buf_text.trim().to_string();
                    match t {
                        TextTarget::Dc("title") => {
                            if pkg.metadata.title.is_empty() {
                                pkg.metadata.title = text;
                            }
                        }
                        TextTarget::Dc("language") => {
                            if pkg.metadata.language.is_empty() {
                                pkg.metadata.language = text;
                            }
                        }
                        TextTarget::Dc("creator") => {
                            let (id, role) = current_creator.take().unwrap_or_default();
                            if !text.is_empty() {
                                if !id.is_empty() {
                                    creator_ids.insert(id, pkg.metadata.creators.len());
                                }
                                pkg.metadata.creators.push(Creator { name: text, role });
                            }
                        }
                        TextTarget::Dc("identifier") => {
                            let mut raw = current_identifier.take().unwrap_or_default();
                            raw.value = text;
                            if !raw.value.is_empty() {
                                identifiers.push(raw);
                            }
                        }
                        TextTarget::Dc("publisher") => pkg.metadata.publisher = some(text),
                        TextTarget::Dc("description") => pkg.metadata.description = some(text),
                        TextTarget::Dc("date") => pkg.metadata.date = some(text),
                        TextTarget::Dc("rights") => pkg.metadata.rights = some(text),
                        TextTarget::Dc("subject") => {
                            if !text.is_empty() {
                                pkg.metadata.subjects.push(text);
                            }
                        }
                        TextTarget::Dc(_) => {}
                        TextTarget::RoleRefine(refines) => {
                            if !text.is_empty() {
                                pending_roles.push((refines, text));
                            }
                        }
                    }
                    buf_text.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(e)),
            _ => {}
        }
    }

    // Apply EPUB 3 role refinements to role-less creators
    for (refines, role) in pending_roles {
        if let Some(&idx) = creator_ids.get(&refines) {
            let creator = &mut pkg.metadata.creators[idx];
            if creator.role.is_empty() {
                creator.role = role;
            }
        }
    }

    pkg.metadata.identifier = select_identifier(&identifiers, &unique_id_ref);

    // Resolve the NCX path from the spine toc attribute, falling back to the
    // manifest media type, and capture the EPUB 3 nav document.
    if let Some(toc_id) = toc_id {
        if let Some(item) = pkg.manifest.get(&toc_id) {
            pkg.ncx_path = Some(item.href.clone());
        }
    }
    if pkg.ncx_path.is_none() {
        let ncx_path = pkg
            .items_in_order()
            .find(|i| i.media_type == "application/x-dtbncx+xml")
            .map(|i| i.href.clone());
        pkg.ncx_path = ncx_path;
    }
    let nav_path = pkg
        .items_in_order()
        .find(|i| i.has_property("nav"))
        .map(|i| i.href.clone());
    pkg.nav_path = nav_path;

    Ok(pkg)
}

fn parse_item(e: &BytesStart, opf_dir: &str) -> Result<Option<ManifestItem>> {
    let id = attr(e, b"id")?.unwrap_or_default();
    let href = attr(e, b"href")?.unwrap_or_default();
    if id.is_empty() || href.is_empty() {
        return Ok(None);
    }
    let media_type = attr(e, b"media-type")?.unwrap_or_default();
    let properties = attr(e, b"properties")?
        .map(|p| p.split_ascii_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    Ok(Some(ManifestItem {
        id,
        href: resolve_path(opf_dir, &href),
        media_type,
        properties,
    }))
}

fn handle_meta(
    e: &BytesStart,
    pkg: &mut Package,
    pending_roles: &mut Vec<(String, String)>,
) -> Result<()> {
    // Legacy EPUB 2 cover pointer
    let name = attr(e, b"name")?;
    let content = attr(e, b"content")?;
    if name.as_deref() == Some("cover") {
        if let Some(content) = content.clone() {
            if !content.is_empty() {
                pkg.metadata.cover_id = Some(content);
            }
        }
    }
    // EPUB 3 role refinement via content attribute
    if attr(e, b"property")?.as_deref() == Some("role") {
        if let Some(refines) = attr(e, b"refines")? {
            if let Some(content) = content {
                if !content.is_empty() {
                    pending_roles
                        .push((refines.trim_start_matches('#').to_string(), content));
                }
            }
        }
    }
    Ok(())
}

/// EXTH identifier selection: ISBN scheme first, then a bare 13/10-digit
/// run, then the package unique-identifier, then the first identifier.
fn select_identifier(identifiers: &[RawIdentifier], unique_id_ref: &str) -> String {
    if let Some(isbn) = identifiers
        .iter()
        .find(|i| i.scheme.eq_ignore_ascii_case("isbn"))
    {
        return isbn.value.clone();
    }

    let digits = Regex::new(r"(^|\D)(\d{13}|\d{10})(\D|$)").unwrap();
    if let Some(found) = identifiers
        .iter()
        .find(|i| digits.is_match(&i.value.replace('-', "")))
    {
        return found.value.clone();
    }

    if !unique_id_ref.is_empty() {
        if let Some(named) = identifiers.iter().find(|i| i.id == unique_id_ref) {
            return named.value.clone();
        }
    }

    identifiers
        .iter()
        .map(|i| i.value.clone())
        .next()
        .unwrap_or_default()
}

/// Join `base_dir` and a relative path, normalising `.`/`..` segments
/// without collapsing through the archive root.
pub fn resolve_path(base_dir: &str, rel: &str) -> String {
    let rel = normalize_path(rel);
    let mut parts: Vec<&str> = if base_dir.is_empty() {
        Vec::new()
    } else {
        base_dir.split('/').collect()
    };
    for seg in rel.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Resolve the path part of an href, keeping any fragment.
pub fn resolve_with_fragment(base_dir: &str, href: &str) -> String {
    match href.split_once('#') {
        Some((path, frag)) => format!("{}#{}", resolve_path(base_dir, path), frag),
        None => resolve_path(base_dir, href),
    }
}

fn start_text(target: &mut Option<TextTarget>, buf: &mut String, field: &'static str) {
    buf.clear();
    *target = Some(TextTarget::Dc(field));
}

fn some(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn attr(e: &BytesStart, key: &[u8]) -> Result<Option<String>> {
    for a in e.attributes().flatten() {
        if a.key.as_ref() == key {
            let value = a
                .unescape_value()
                .map_err(|err| Error::InvalidEpub(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Attribute lookup by local name (matches `opf:role` as well as `role`).
fn attr_local(e: &BytesStart, key: &[u8]) -> Result<Option<String>> {
    for a in e.attributes().flatten() {
        if local_name(a.key.as_ref()) == key {
            let value = a
                .unescape_value()
                .map_err(|err| Error::InvalidEpub(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Extract the local name from a potentially namespaced XML name.
pub fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|&b| b == b':')
        .map(|i| &name[i + 1..])
        .unwrap_or(name)
}

/// Resolve a general entity reference (named or numeric) to its text.
pub(crate) fn resolve_entity(entity: &str) -> String {
    match entity {
        "apos" => "'".into(),
        "quot" => "\"".into(),
        "lt" => "<".into(),
        "gt" => ">".into(),
        "amp" => "&".into(),
        _ => {
            // Numeric character references: #1234 or #x4E2D
            if let Some(num) = entity.strip_prefix('#') {
                let code = if let Some(hex) = num.strip_prefix('x').or(num.strip_prefix('X')) {
                    u32::from_str_radix(hex, 16).ok()
                } else {
                    num.parse::<u32>().ok()
                };
                if let Some(c) = code.and_then(char::from_u32) {
                    return c.to_string();
                }
            }
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPF: &str = r##"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="pub-id" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Sample &amp; Noise</dc:title>
    <dc:language>ja</dc:language>
    <dc:identifier id="pub-id">urn:uuid:0000</dc:identifier>
    <dc:identifier opf:scheme="ISBN" xmlns:opf="http://www.idpf.org/2007/opf">978-4-0000-0000-0</dc:identifier>
    <dc:creator id="author">Natsume Soseki</dc:creator>
    <meta refines="#author" property="role" scheme="marc:relators">aut</meta>
    <dc:date>2020-01-02</dc:date>
    <dc:subject>Fiction</dc:subject>
    <meta name="cover" content="cover-img"/>
  </metadata>
  <manifest>
    <item id="cover-img" href="images/cover.jpg" media-type="image/jpeg"/>
    <item id="ch1" href="text/ch01.xhtml" media-type="application/xhtml+xml"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
  </manifest>
  <spine toc="ncx" page-progression-direction="rtl">
    <itemref idref="ch1"/>
    <itemref idref="missing" linear="no"/>
  </spine>
  <guide>
    <reference type="cover" title="Cover" href="text/cover.xhtml"/>
  </guide>
</package>"##;

    #[test]
    fn test_parse_opf_model() {
        let pkg = parse_opf(OPF, "OEBPS").unwrap();
        assert_eq!(pkg.metadata.title, "Sample & Noise");
        assert_eq!(pkg.metadata.language, "ja");
        assert_eq!(pkg.metadata.identifier, "978-4-0000-0000-0");
        assert_eq!(pkg.metadata.creators.len(), 1);
        assert_eq!(pkg.metadata.creators[0].role, "aut");
        assert_eq!(pkg.metadata.cover_id.as_deref(), Some("cover-img"));
        assert_eq!(pkg.manifest_order, vec!["cover-img", "ch1", "ncx"]);
        assert_eq!(
            pkg.item("ch1").unwrap().href,
            "OEBPS/text/ch01.xhtml"
        );
        assert_eq!(pkg.ncx_path.as_deref(), Some("OEBPS/toc.ncx"));
        assert_eq!(pkg.page_progression_direction, "rtl");
        assert_eq!(pkg.spine.len(), 2);
        assert!(!pkg.spine[1].linear);
        assert_eq!(pkg.guide[0].href, "OEBPS/text/cover.xhtml");
    }

    #[test]
    fn test_identifier_bare_digits() {
        let ids = vec![
            RawIdentifier {
                value: "urn:uuid:123".into(),
                scheme: String::new(),
                id: "a".into(),
            },
            RawIdentifier {
                value: "978-1-23456-789-7".into(),
                scheme: String::new(),
                id: "b".into(),
            },
        ];
        assert_eq!(select_identifier(&ids, "a"), "978-1-23456-789-7");
    }

    #[test]
    fn test_identifier_unique_fallback() {
        let ids = vec![
            RawIdentifier {
                value: "urn:uuid:first".into(),
                scheme: String::new(),
                id: "x".into(),
            },
            RawIdentifier {
                value: "urn:uuid:second".into(),
                scheme: String::new(),
                id: "pub-id".into(),
            },
        ];
        assert_eq!(select_identifier(&ids, "pub-id"), "urn:uuid:second");
        assert_eq!(select_identifier(&ids, ""), "urn:uuid:first");
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("OEBPS/text", "../images/a.png"), "OEBPS/images/a.png");
        assert_eq!(resolve_path("", "ch1.xhtml"), "ch1.xhtml");
        assert_eq!(resolve_path("OEBPS", "./style.css"), "OEBPS/style.css");
        // Never collapses past the archive root
        assert_eq!(resolve_path("a", "../../../x.png"), "x.png");
    }

    #[test]
    fn test_local_name() {
        assert_eq!(local_name(b"dc:title"), b"title");
        assert_eq!(local_name(b"title"), b"title");
    }
}
