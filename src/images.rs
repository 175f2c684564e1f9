//! Image optimisation and the image record table.
//!
//! Manifest images are decoded, optionally resized and re-encoded under
//! size and quality budgets, and inserted into an insertion-ordered
//! [`ImageMap`]. The map's 1-based indices back the `kindle:embed:NNNN`
//! references rewritten into the final HTML.

use std::collections::HashMap;
use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, GenericImageView, ImageFormat, ImageReader};
use log::debug;
use memchr::memmem;

use crate::error::{Stage, Warning};

/// Budgets and quality knobs for image re-encoding.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// JPEG quality for re-encoded output.
    pub quality: u8,
    /// Floor for the stepping re-encode loop.
    pub min_quality: u8,
    /// Floor used when the image is the cover.
    pub cover_min_quality: u8,
    /// Non-cover images wider than this are resampled down.
    pub max_width: u32,
    /// Per-image output budget in kilobytes.
    pub max_size_kb: u32,
    /// Images with more pixels than this are passed through undecoded.
    pub pixel_cap: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            quality: 85,
            min_quality: 50,
            cover_min_quality: 70,
            max_width: 1280,
            max_size_kb: 260,
            pixel_cap: 32_000_000,
        }
    }
}

/// One emitted image record.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub data: Vec<u8>,
    pub path: String,
    pub media_type: String,
}

/// Insertion-ordered image table with a stable path → index mapping.
///
/// Insertion order follows manifest order; a path inserted twice keeps its
/// first record.
#[derive(Debug, Default)]
pub struct ImageMap {
    records: Vec<ImageRecord>,
    path_to_index: HashMap<String, usize>,
}

impl ImageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record; returns false when the path is already mapped.
    pub fn insert(&mut self, path: &str, data: Vec<u8>, media_type: &str) -> bool {
        if self.path_to_index.contains_key(path) {
            return false;
        }
        self.path_to_index
            .insert(path.to_string(), self.records.len());
        self.records.push(ImageRecord {
            data,
            path: path.to_string(),
            media_type: media_type.to_string(),
        });
        true
    }

    /// 0-based record index for a path.
    pub fn index_of(&self, path: &str) -> Option<usize> {
        self.path_to_index.get(path).copied()
    }

    /// `kindle:embed:` reference for a path; the index is rendered 1-based
    /// as four uppercase hex digits (more when it does not fit).
    pub fn kindle_embed(&self, path: &str) -> Option<String> {
        self.index_of(path)
            .map(|idx| format!("kindle:embed:{:04X}", idx + 1))
    }

    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Optimise one manifest image, returning the bytes to embed and their
/// effective media type. Never fails: anything undecodable is passed
/// through with a warning.
pub fn optimize(
    path: &str,
    bytes: &[u8],
    media_type: &str,
    is_cover: bool,
    cfg: &ImageConfig,
    warnings: &mut Vec<Warning>,
) -> (Vec<u8>, String) {
    let passthrough = |warnings: &mut Vec<Warning>, reason: String| {
        warnings.push(Warning::new(Stage::Images, reason));
        (bytes.to_vec(), media_type.to_string())
    };

    // Dimension probe before committing to a full decode
    let dims = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()
        .and_then(|r| r.into_dimensions().ok());
    let (width, height) = match dims {
        Some(d) => d,
        None => return passthrough(warnings, format!("cannot probe image {}", path)),
    };
    if width as u64 * height as u64 > cfg.pixel_cap {
        return passthrough(
            warnings,
            format!("image {} exceeds pixel cap ({}x{})", path, width, height),
        );
    }

    let source_format = image::guess_format(bytes).ok();

    if source_format == Some(ImageFormat::Gif) && is_animated_gif(bytes) {
        debug!("passing through animated gif {}", path);
        return (bytes.to_vec(), "image/gif".to_string());
    }

    let mut img = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(e) => return passthrough(warnings, format!("cannot decode image {}: {}", path, e)),
    };

    if !is_cover && img.width() > cfg.max_width {
        let (w, h) = img.dimensions();
        let target_h = ((h as u64 * cfg.max_width as u64) / w as u64).max(1) as u32;
        img = img.resize_exact(cfg.max_width, target_h, FilterType::Lanczos3);
    }

    let want_png = source_format == Some(ImageFormat::Png) && has_transparency(&img);
    if want_png {
        let mut out = Vec::new();
        if img
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .is_err()
        {
            return passthrough(warnings, format!("cannot re-encode png {}", path));
        }
        // Keep whichever rendition is smaller; PNG has no quality dial
        let final_bytes = if out.len() < bytes.len() {
            out
        } else {
            bytes.to_vec()
        };
        if final_bytes.len() > cfg.max_size_kb as usize * 1024 {
            warnings.push(Warning::new(
                Stage::Images,
                format!("image {} exceeds the size budget ({} bytes)", path, final_bytes.len()),
            ));
        }
        return (final_bytes, "image/png".to_string());
    }

    let floor = if is_cover {
        cfg.cover_min_quality
    } else {
        cfg.min_quality
    };
    let start = cfg.quality.clamp(floor, 100);
    let budget = cfg.max_size_kb as usize * 1024;

    let mut quality = start;
    let mut best: Option<Vec<u8>> = None;
    loop {
        match encode_jpeg(&img, quality) {
            Ok(out) => {
                let better = best.as_ref().map(|b| out.len() < b.len()).unwrap_or(true);
                if better {
                    best = Some(out);
                }
            }
            Err(e) => {
                return passthrough(warnings, format!("cannot encode jpeg {}: {}", path, e))
            }
        }
        let within = best.as_ref().map(|b| b.len() <= budget).unwrap_or(false);
        if within || quality < floor + 5 {
            break;
        }
        quality -= 5;
    }

    let out = best.unwrap_or_else(|| bytes.to_vec());
    if out.len() > budget {
        warnings.push(Warning::new(
            Stage::Images,
            format!("image {} exceeds the size budget ({} bytes)", path, out.len()),
        ));
    }
    (out, "image/jpeg".to_string())
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> image::ImageResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    // JPEG has no alpha channel; flatten first
    let rgb = img.to_rgb8();
    encoder.encode_image(&rgb)?;
    Ok(out)
}

fn is_animated_gif(bytes: &[u8]) -> bool {
    match image::codecs::gif::GifDecoder::new(Cursor::new(bytes)) {
        Ok(decoder) => decoder.into_frames().take(2).count() > 1,
        Err(_) => false,
    }
}

/// Any pixel with alpha below opaque.
fn has_transparency(img: &DynamicImage) -> bool {
    if !img.color().has_alpha() {
        return false;
    }
    img.to_rgba8().pixels().any(|p| p[3] < 255)
}

/// Replace known `<img src="...">` targets with their kindle:embed
/// references. Unknown srcs are left untouched. Runs after all other HTML
/// rewrites so the map sees archive-absolute paths.
pub fn rewrite_html_images(html: &str, map: &ImageMap) -> String {
    let bytes = html.as_bytes();
    let finder = memmem::Finder::new(b"<img");
    let mut out = String::with_capacity(html.len());
    let mut last = 0;

    let mut search = 0;
    while let Some(found) = finder.find(&bytes[search..]) {
        let tag_start = search + found;
        let tag_end = match memchr::memchr(b'>', &bytes[tag_start..]) {
            Some(off) => tag_start + off,
            None => break,
        };
        let tag = &html[tag_start..tag_end];
        if let Some((value_start, value_end)) = find_src_value(tag) {
            let src = &tag[value_start..value_end];
            if let Some(embed) = map.kindle_embed(src) {
                out.push_str(&html[last..tag_start + value_start]);
                out.push_str(&embed);
                last = tag_start + value_end;
            }
        }
        search = tag_end;
    }
    out.push_str(&html[last..]);
    out
}

/// Locate the src attribute value inside an `<img ...` tag slice.
fn find_src_value(tag: &str) -> Option<(usize, usize)> {
    let at = memmem::find(tag.as_bytes(), b"src=")?;
    let rest = &tag[at + 4..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let value_start = at + 5;
    let end = tag[value_start..].find(quote)?;
    Some((value_start, value_start + end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn png_bytes(width: u32, height: u32, alpha: u8) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, image::Rgba([120, 40, 40, alpha]));
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_map_ordering_and_embed() {
        let mut map = ImageMap::new();
        assert!(map.insert("img/cover.jpg", vec![1], "image/jpeg"));
        assert!(map.insert("img/photo.png", vec![2], "image/png"));
        assert!(!map.insert("img/cover.jpg", vec![3], "image/jpeg"));
        assert_eq!(map.len(), 2);
        assert_eq!(map.index_of("img/cover.jpg"), Some(0));
        assert_eq!(
            map.kindle_embed("img/photo.png").as_deref(),
            Some("kindle:embed:0002")
        );
        assert!(map.kindle_embed("img/none.png").is_none());
        // First insertion wins
        assert_eq!(map.records()[0].data, vec![1]);
    }

    #[test]
    fn test_embed_wide_index() {
        let mut map = ImageMap::new();
        for i in 0..0x10000 {
            map.insert(&format!("p{}", i), Vec::new(), "image/png");
        }
        assert_eq!(map.kindle_embed("p0").as_deref(), Some("kindle:embed:0001"));
        assert_eq!(
            map.kindle_embed(&format!("p{}", 0xFFFF)).as_deref(),
            Some("kindle:embed:10000")
        );
    }

    #[test]
    fn test_opaque_png_becomes_jpeg() {
        let bytes = png_bytes(8, 8, 255);
        let mut warnings = Vec::new();
        let (out, media_type) = optimize(
            "a.png",
            &bytes,
            "image/png",
            false,
            &ImageConfig::default(),
            &mut warnings,
        );
        assert_eq!(media_type, "image/jpeg");
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_alpha_png_stays_png() {
        let bytes = png_bytes(8, 8, 128);
        let mut warnings = Vec::new();
        let (out, media_type) = optimize(
            "a.png",
            &bytes,
            "image/png",
            false,
            &ImageConfig::default(),
            &mut warnings,
        );
        assert_eq!(media_type, "image/png");
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn test_resize_over_max_width() {
        let bytes = png_bytes(64, 32, 255);
        let cfg = ImageConfig {
            max_width: 16,
            ..Default::default()
        };
        let mut warnings = Vec::new();
        let (out, _) = optimize("w.png", &bytes, "image/png", false, &cfg, &mut warnings);
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
    }

    #[test]
    fn test_cover_not_resized() {
        let bytes = png_bytes(64, 32, 255);
        let cfg = ImageConfig {
            max_width: 16,
            ..Default::default()
        };
        let mut warnings = Vec::new();
        let (out, _) = optimize("c.png", &bytes, "image/png", true, &cfg, &mut warnings);
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (64, 32));
    }

    #[test]
    fn test_undecodable_passthrough_with_warning() {
        let bytes = b"not an image at all";
        let mut warnings = Vec::new();
        let (out, media_type) = optimize(
            "bad.bin",
            bytes,
            "image/jpeg",
            false,
            &ImageConfig::default(),
            &mut warnings,
        );
        assert_eq!(out, bytes);
        assert_eq!(media_type, "image/jpeg");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_rewrite_html_images() {
        let mut map = ImageMap::new();
        map.insert("images/cover.jpg", vec![0], "image/jpeg");
        let html = r#"<p><img src="images/cover.jpg" alt=""/><img src="other.png"/></p>"#;
        let out = rewrite_html_images(html, &map);
        assert!(out.contains(r#"<img src="kindle:embed:0001" alt=""/>"#));
        assert!(out.contains(r#"<img src="other.png"/>"#));
    }
}
