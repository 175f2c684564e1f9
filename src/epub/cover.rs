//! Cover image detection.
//!
//! Fixed priority: manifest `cover-image` property, legacy metadata cover
//! id, guide reference (possibly via an intermediate cover XHTML), then
//! filename match. SVG is never treated as an image.

use std::io::{Read, Seek};

use log::debug;

use crate::dom;
use crate::epub::package::{resolve_path, Package};
use crate::epub::reader::EpubArchive;

/// How the cover was found. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverMethod {
    ManifestProperty,
    MetaCover,
    GuideImage,
    GuideXhtmlFirstImg,
    Filename,
}

impl std::fmt::Display for CoverMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CoverMethod::ManifestProperty => "manifest-property",
            CoverMethod::MetaCover => "meta-cover",
            CoverMethod::GuideImage => "guide-image",
            CoverMethod::GuideXhtmlFirstImg => "guide-xhtml-first-img",
            CoverMethod::Filename => "filename",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Cover {
    /// Archive-absolute path of the cover image.
    pub path: String,
    pub media_type: String,
    pub method: CoverMethod,
}

/// Detect the cover image, if any.
pub fn detect<R: Read + Seek>(pkg: &Package, archive: &mut EpubArchive<R>) -> Option<Cover> {
    let cover = by_manifest_property(pkg)
        .or_else(|| by_meta_cover(pkg))
        .or_else(|| by_guide(pkg, archive))
        .or_else(|| by_filename(pkg));
    match &cover {
        Some(c) => debug!("cover detected via {}: {}", c.method, c.path),
        None => debug!("no cover detected"),
    }
    cover
}

fn by_manifest_property(pkg: &Package) -> Option<Cover> {
    pkg.items_in_order()
        .find(|item| item.has_property("cover-image") && item.is_raster_image())
        .map(|item| Cover {
            path: item.href.clone(),
            media_type: item.media_type.clone(),
            method: CoverMethod::ManifestProperty,
        })
}

fn by_meta_cover(pkg: &Package) -> Option<Cover> {
    let id = pkg.metadata.cover_id.as_ref()?;
    pkg.item(id)
        .filter(|item| item.is_raster_image())
        .map(|item| Cover {
            path: item.href.clone(),
            media_type: item.media_type.clone(),
            method: CoverMethod::MetaCover,
        })
}

fn by_guide<R: Read + Seek>(pkg: &Package, archive: &mut EpubArchive<R>) -> Option<Cover> {
    let guide_ref = pkg
        .guide
        .iter()
        .find(|r| r.ref_type.eq_ignore_ascii_case("cover"))?;
    let target = guide_ref.href.split('#').next().unwrap_or(&guide_ref.href);
    let item = pkg.item_by_href(target)?;

    if item.is_raster_image() {
        return Some(Cover {
            path: item.href.clone(),
            media_type: item.media_type.clone(),
            method: CoverMethod::GuideImage,
        });
    }

    if item.is_html() {
        // The guide points at a cover page; use its first <img>
        let bytes = archive.read(&item.href).ok()?;
        let tree = dom::parse_html(&bytes);
        let img = dom::find_first(&tree.document, "img")?;
        let src = dom::get_attr(&img, "src")?;
        let dir = match item.href.rfind('/') {
            Some(idx) => &item.href[..idx],
            None => "",
        };
        let resolved = resolve_path(dir, &src);
        let image_item = pkg.item_by_href(&resolved)?;
        if image_item.is_raster_image() {
            return Some(Cover {
                path: image_item.href.clone(),
                media_type: image_item.media_type.clone(),
                method: CoverMethod::GuideXhtmlFirstImg,
            });
        }
    }
    None
}

fn by_filename(pkg: &Package) -> Option<Cover> {
    pkg.items_in_order()
        .find(|item| {
            if !item.is_raster_image() {
                return false;
            }
            let basename = item.href.rsplit('/').next().unwrap_or(&item.href);
            basename.to_lowercase().contains("cover")
        })
        .map(|item| Cover {
            path: item.href.clone(),
            media_type: item.media_type.clone(),
            method: CoverMethod::Filename,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epub::package::{ManifestItem, Metadata};

    fn image_item(id: &str, href: &str, media_type: &str) -> ManifestItem {
        ManifestItem {
            id: id.to_string(),
            href: href.to_string(),
            media_type: media_type.to_string(),
            properties: Vec::new(),
        }
    }

    fn pkg_with(items: Vec<ManifestItem>) -> Package {
        let mut pkg = Package {
            metadata: Metadata::default(),
            ..Default::default()
        };
        for item in items {
            pkg.manifest_order.push(item.id.clone());
            pkg.manifest.insert(item.id.clone(), item);
        }
        pkg
    }

    #[test]
    fn test_manifest_property_wins() {
        let mut with_prop = image_item("a", "img/art.png", "image/png");
        with_prop.properties.push("cover-image".into());
        let pkg = pkg_with(vec![image_item("c", "img/cover.jpg", "image/jpeg"), with_prop]);
        let cover = by_manifest_property(&pkg).unwrap();
        assert_eq!(cover.path, "img/art.png");
        assert_eq!(cover.method, CoverMethod::ManifestProperty);
    }

    #[test]
    fn test_meta_cover() {
        let mut pkg = pkg_with(vec![image_item("cimg", "img/front.jpg", "image/jpeg")]);
        pkg.metadata.cover_id = Some("cimg".into());
        let cover = by_meta_cover(&pkg).unwrap();
        assert_eq!(cover.method, CoverMethod::MetaCover);
    }

    #[test]
    fn test_filename_excludes_svg() {
        let pkg = pkg_with(vec![
            image_item("s", "img/cover.svg", "image/svg+xml"),
            image_item("j", "img/My-Cover.JPEG.jpg", "image/jpeg"),
        ]);
        let cover = by_filename(&pkg).unwrap();
        assert_eq!(cover.path, "img/My-Cover.JPEG.jpg");
        assert_eq!(cover.method, CoverMethod::Filename);
    }

    #[test]
    fn test_no_cover() {
        let pkg = pkg_with(vec![image_item("p", "img/photo.png", "image/png")]);
        assert!(by_manifest_property(&pkg).is_none());
        assert!(by_meta_cover(&pkg).is_none());
        assert!(by_filename(&pkg).is_none());
    }
}
