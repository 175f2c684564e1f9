//! The conversion pipeline.
//!
//! Strictly ordered stages: parse → validate metadata → detect cover →
//! build HTML + image map → load navigation → insert inline TOC → rewrite
//! image refs → build the NCX record → plan records → write binary.
//! Individual chapter/image/TOC failures degrade to warnings; strict mode
//! escalates a non-empty warning list after the output bytes exist.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use log::{debug, info, warn};

use crate::compose::{toc, HtmlIntegrator};
use crate::epub::content::load_chapter;
use crate::epub::cover::{self, Cover};
use crate::epub::ncx::{self, NavPoint};
use crate::epub::package::{parse_opf, Package};
use crate::epub::reader::EpubArchive;
use crate::error::{Error, Result, Stage, Warning};
use crate::images::{self, ImageMap};
use crate::mobi::MobiEncoder;
use crate::options::ConvertOptions;

/// The outcome of a successful conversion.
#[derive(Debug)]
pub struct Conversion {
    /// The complete AZW3 byte stream.
    pub azw3: Vec<u8>,
    /// Recoverable problems encountered along the way.
    pub warnings: Vec<Warning>,
}

pub struct Pipeline {
    options: ConvertOptions,
}

impl Pipeline {
    pub fn new(options: ConvertOptions) -> Self {
        Self { options }
    }

    /// Convert an EPUB from any `Read + Seek` source.
    pub fn convert<R: Read + Seek>(&self, reader: R) -> Result<Conversion> {
        let mut warnings: Vec<Warning> = Vec::new();
        let mut archive = EpubArchive::from_reader(reader)?;

        // Parse the package document
        let opf_path = archive.opf_path().to_string();
        let opf = archive.read_text(&opf_path)?;
        let pkg = parse_opf(&opf, &archive.opf_dir())?;
        validate_metadata(&pkg)?;
        info!(
            "converting \"{}\" ({} manifest items, {} spine items)",
            pkg.metadata.title,
            pkg.manifest_order.len(),
            pkg.spine.len()
        );
        if !pkg.page_progression_direction.is_empty() {
            debug!("page progression: {}", pkg.page_progression_direction);
        }

        let cover = cover::detect(&pkg, &mut archive);

        // Load chapters in spine order
        let manifest_images: HashSet<String> = pkg
            .items_in_order()
            .filter(|item| item.is_raster_image())
            .map(|item| item.href.clone())
            .collect();
        let mut integrator = HtmlIntegrator::new(self.options.no_images, manifest_images);
        for spine_ref in &pkg.spine {
            let item = match pkg.item(&spine_ref.idref) {
                Some(item) => item,
                None => {
                    note(&mut warnings, Stage::Parse, format!(
                        "spine idref \"{}\" not in manifest",
                        spine_ref.idref
                    ));
                    continue;
                }
            };
            if !item.is_html() {
                continue;
            }
            let bytes = match archive.read(&item.href) {
                Ok(bytes) => bytes,
                Err(e) => {
                    note(&mut warnings, Stage::Parse, format!(
                        "cannot read chapter {}: {}",
                        item.href, e
                    ));
                    continue;
                }
            };
            let chapter = load_chapter(&item.id, &item.href, &bytes);
            let chapter_id = integrator.add_chapter(chapter);
            debug!("chapter {} <- {}", chapter_id, item.href);
        }
        if integrator.chapter_count() == 0 {
            return Err(Error::NoChapters);
        }

        // Image records, in manifest order
        let mut image_map = ImageMap::new();
        if !self.options.no_images {
            self.build_image_map(&pkg, &mut archive, cover.as_ref(), &mut image_map, &mut warnings);
        }

        // CSS: unlinked manifest sheets globally, linked sheets and inline
        // styles per chapter
        self.collect_css(&pkg, &mut archive, &mut integrator, &mut warnings);

        // Navigation
        let nav = self.load_navigation(&pkg, &mut archive, &mut warnings);

        // Integrate, then apply the byte-level post passes in a fixed order
        let logged = warnings.len();
        let mut html = integrator.integrate(&mut warnings);
        if !nav.is_empty() {
            let toc_div = toc::build_inline_toc(&nav, integrator.chapter_table(), &pkg.metadata.title);
            html = toc::insert_inline_toc(&html, &toc_div);
        }
        html = images::rewrite_html_images(&html, &image_map);

        // The HTML bytes are frozen from here on; filepos offsets depend
        // on that
        let ncx_record = toc::build_ncx_record(
            html.as_bytes(),
            &nav,
            integrator.chapter_table(),
            &pkg.guide,
            &pkg.metadata.title,
            &mut warnings,
        );
        for warning in &warnings[logged..] {
            warn!("{}", warning);
        }

        let cover_index = match &cover {
            Some(c) => match image_map.index_of(&c.path) {
                Some(idx) => Some(idx as u32),
                None => {
                    if !self.options.no_images {
                        note(&mut warnings, Stage::Cover, format!(
                            "cover {} not present in the image table",
                            c.path
                        ));
                    }
                    None
                }
            },
            None => None,
        };

        let azw3 = MobiEncoder {
            metadata: &pkg.metadata,
            html: html.as_bytes(),
            images: &image_map,
            ncx_record: ncx_record.as_deref(),
            cover_index,
            params: self.options.encode,
        }
        .encode()?;

        info!(
            "wrote {} bytes ({} chapters, {} images, {} warnings)",
            azw3.len(),
            integrator.chapter_count(),
            image_map.len(),
            warnings.len()
        );
        Ok(Conversion { azw3, warnings })
    }

    fn build_image_map<R: Read + Seek>(
        &self,
        pkg: &Package,
        archive: &mut EpubArchive<R>,
        cover: Option<&Cover>,
        image_map: &mut ImageMap,
        warnings: &mut Vec<Warning>,
    ) {
        for item in pkg.items_in_order() {
            if !item.is_image() {
                continue;
            }
            if item.media_type == "image/svg+xml" {
                debug!("skipping svg image {}", item.href);
                continue;
            }
            let bytes = match archive.read(&item.href) {
                Ok(bytes) => bytes,
                Err(e) => {
                    note(warnings, Stage::Images, format!(
                        "cannot read image {}: {}",
                        item.href, e
                    ));
                    continue;
                }
            };
            let is_cover = cover.map(|c| c.path == item.href).unwrap_or(false);
            let (data, media_type) = images::optimize(
                &item.href,
                &bytes,
                &item.media_type,
                is_cover,
                &self.options.image,
                warnings,
            );
            if !image_map.insert(&item.href, data, &media_type) {
                debug!("duplicate image path ignored: {}", item.href);
            }
        }
    }

    fn collect_css<R: Read + Seek>(
        &self,
        pkg: &Package,
        archive: &mut EpubArchive<R>,
        integrator: &mut HtmlIntegrator,
        warnings: &mut Vec<Warning>,
    ) {
        let linked: HashSet<String> = integrator
            .chapters()
            .iter()
            .flat_map(|c| c.stylesheets.iter().cloned())
            .collect();

        for item in pkg.items_in_order() {
            if item.media_type == "text/css" && !linked.contains(&item.href) {
                match archive.read_text(&item.href) {
                    Ok(css) => integrator.add_global_css(&css),
                    Err(e) => note(warnings, Stage::Css, format!(
                        "cannot read stylesheet {}: {}",
                        item.href, e
                    )),
                }
            }
        }

        let jobs: Vec<(String, Vec<String>, Vec<String>)> = integrator
            .chapters()
            .iter()
            .map(|c| {
                (
                    integrator.chapter_id(&c.path).unwrap_or_default().to_string(),
                    c.stylesheets.clone(),
                    c.inline_css.clone(),
                )
            })
            .collect();
        for (chapter_id, stylesheets, inline) in jobs {
            for path in stylesheets {
                match archive.read_text(&path) {
                    Ok(css) => integrator.add_chapter_css(&chapter_id, &css),
                    Err(e) => note(warnings, Stage::Css, format!(
                        "cannot read stylesheet {}: {}",
                        path, e
                    )),
                }
            }
            for css in inline {
                integrator.add_chapter_css(&chapter_id, &css);
            }
        }
    }

    fn load_navigation<R: Read + Seek>(
        &self,
        pkg: &Package,
        archive: &mut EpubArchive<R>,
        warnings: &mut Vec<Warning>,
    ) -> Vec<NavPoint> {
        if let Some(ncx_path) = &pkg.ncx_path {
            match archive.read_text(ncx_path) {
                Ok(content) => {
                    let dir = parent_dir(ncx_path);
                    match ncx::parse_ncx(&content, dir) {
                        Ok(points) if !points.is_empty() => return points,
                        Ok(_) => debug!("NCX {} has no nav points", ncx_path),
                        Err(e) => note(warnings, Stage::Ncx, format!(
                            "cannot parse NCX {}: {}",
                            ncx_path, e
                        )),
                    }
                }
                Err(e) => note(warnings, Stage::Ncx, format!(
                    "cannot read NCX {}: {}",
                    ncx_path, e
                )),
            }
        }
        // EPUB 3 fallback: the nav document
        if let Some(nav_path) = &pkg.nav_path {
            match archive.read(nav_path) {
                Ok(content) => {
                    let points = ncx::parse_nav_doc(&content, parent_dir(nav_path));
                    if !points.is_empty() {
                        return points;
                    }
                }
                Err(e) => note(warnings, Stage::Ncx, format!(
                    "cannot read nav document {}: {}",
                    nav_path, e
                )),
            }
        }
        debug!("no navigation document found");
        Vec::new()
    }
}

/// Convert one EPUB file to one AZW3 file.
///
/// The output is written before strict mode is applied, so a strict
/// failure still leaves the converted file on disk.
pub fn convert_file(input: &Path, output: &Path, options: ConvertOptions) -> Result<Vec<Warning>> {
    let strict = options.strict;
    let pipeline = Pipeline::new(options);
    let conversion = pipeline.convert(File::open(input)?)?;
    std::fs::write(output, &conversion.azw3)?;
    if strict && !conversion.warnings.is_empty() {
        return Err(Error::StrictMode(conversion.warnings.len()));
    }
    Ok(conversion.warnings)
}

fn validate_metadata(pkg: &Package) -> Result<()> {
    if pkg.metadata.title.trim().is_empty() {
        return Err(Error::MissingMetadata("title"));
    }
    if pkg.metadata.language.trim().is_empty() {
        return Err(Error::MissingMetadata("language"));
    }
    if pkg.metadata.identifier.trim().is_empty() {
        return Err(Error::MissingMetadata("identifier"));
    }
    Ok(())
}

/// Log a recoverable problem and keep it for strict mode.
fn note(warnings: &mut Vec<Warning>, stage: Stage, message: String) {
    warn!("[{}] {}", stage, message);
    warnings.push(Warning::new(stage, message));
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}
