//! EPUB container access.
//!
//! Opens the ZIP archive, validates the `mimetype` sentinel, resolves the
//! package document path from `META-INF/container.xml`, and serves raw
//! bytes for normalised archive paths.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use zip::{CompressionMethod, ZipArchive};

use crate::error::{Error, Result};

const MIMETYPE: &[u8] = b"application/epub+zip";
const PACKAGE_MEDIA_TYPE: &str = "application/oebps-package+xml";

/// An opened EPUB archive with a resolved package document path.
///
/// All content access goes through [`EpubArchive::read`]; the ZIP handle is
/// released when the value is dropped.
pub struct EpubArchive<R: Read + Seek> {
    archive: ZipArchive<R>,
    opf_path: String,
}

impl EpubArchive<File> {
    /// Open an EPUB file from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }
}

impl<R: Read + Seek> EpubArchive<R> {
    /// Open an EPUB from any `Read + Seek` source.
    ///
    /// Validates the stored `mimetype` entry and locates the first rootfile
    /// with the OPF media type (falling back to the first rootfile).
    pub fn from_reader(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader)?;
        validate_mimetype(&mut archive)?;

        let container = read_entry(&mut archive, "META-INF/container.xml")
            .map_err(|_| Error::InvalidEpub("missing META-INF/container.xml".into()))?;
        let container = String::from_utf8(strip_bom(&container).to_vec())?;
        let opf_path = find_opf_path(&container)?;

        Ok(Self { archive, opf_path })
    }

    /// Archive path of the package document.
    pub fn opf_path(&self) -> &str {
        &self.opf_path
    }

    /// Directory of the package document, `""` when it sits at the root.
    pub fn opf_dir(&self) -> String {
        match self.opf_path.rfind('/') {
            Some(idx) => self.opf_path[..idx].to_string(),
            None => String::new(),
        }
    }

    /// List all entry names in the archive.
    pub fn names(&self) -> Vec<String> {
        self.archive
            .file_names()
            .map(|n| normalize_path(n).into_owned())
            .collect()
    }

    /// Whether a normalised path resolves to an entry.
    pub fn contains(&mut self, path: &str) -> bool {
        let path = normalize_path(path);
        self.archive.index_for_name(&path).is_some()
    }

    /// Read the raw bytes of an archive entry by normalised path.
    pub fn read(&mut self, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path);
        match self.archive.by_name(&path) {
            Ok(mut file) => {
                let mut contents = Vec::new();
                file.read_to_end(&mut contents)?;
                return Ok(contents);
            }
            Err(zip::result::ZipError::FileNotFound) => {}
            Err(e) => return Err(e.into()),
        }

        // Fallback: percent-decoded path (handles malformed EPUBs)
        let decoded = percent_encoding::percent_decode_str(&path)
            .decode_utf8()
            .map_err(|_| Error::InvalidEpub(format!("invalid UTF-8 in path: {}", path)))?;
        match self.archive.by_name(&decoded) {
            Ok(mut file) => {
                let mut contents = Vec::new();
                file.read_to_end(&mut contents)?;
                Ok(contents)
            }
            Err(zip::result::ZipError::FileNotFound) => {
                Err(Error::FileNotFound(path.into_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read an entry as UTF-8 text with the BOM stripped.
    pub fn read_text(&mut self, path: &str) -> Result<String> {
        let bytes = self.read(path)?;
        Ok(String::from_utf8_lossy(strip_bom(&bytes)).into_owned())
    }
}

fn validate_mimetype<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<()> {
    let mut entry = archive
        .by_name("mimetype")
        .map_err(|_| Error::InvalidEpub("missing mimetype entry".into()))?;
    if entry.compression() != CompressionMethod::Stored {
        return Err(Error::InvalidEpub("mimetype entry must be stored".into()));
    }
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents)?;
    if contents != MIMETYPE {
        return Err(Error::InvalidEpub(format!(
            "unexpected mimetype: {:?}",
            String::from_utf8_lossy(&contents)
        )));
    }
    Ok(())
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, path: &str) -> Result<Vec<u8>> {
    let mut file = archive.by_name(path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    Ok(contents)
}

fn find_opf_path(container: &str) -> Result<String> {
    let mut reader = Reader::from_str(container);
    reader.config_mut().trim_text(true);

    let mut first: Option<String> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e))
                if e.name().as_ref().ends_with(b"rootfile") =>
            {
                let mut full_path = None;
                let mut media_type = None;
                for attr in e.attributes().flatten() {
                    match attr.key.as_ref() {
                        b"full-path" => {
                            full_path = Some(String::from_utf8(attr.value.to_vec())?)
                        }
                        b"media-type" => {
                            media_type = Some(String::from_utf8(attr.value.to_vec())?)
                        }
                        _ => {}
                    }
                }
                if let Some(path) = full_path {
                    let path = normalize_path(&path).into_owned();
                    if media_type.as_deref() == Some(PACKAGE_MEDIA_TYPE) {
                        return Ok(path);
                    }
                    if first.is_none() {
                        first = Some(path);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(e)),
            _ => {}
        }
    }

    first.ok_or_else(|| Error::InvalidEpub("no rootfile found in container.xml".into()))
}

/// Normalise an archive path: forward slashes, no leading `./`.
pub fn normalize_path(path: &str) -> std::borrow::Cow<'_, str> {
    let path = path.trim_start_matches("./");
    if path.contains('\\') {
        std::borrow::Cow::Owned(path.replace('\\', "/"))
    } else {
        std::borrow::Cow::Borrowed(path)
    }
}

/// Strip a UTF-8 BOM (byte order mark) if present.
pub fn strip_bom(data: &[u8]) -> &[u8] {
    if data.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &data[3..]
    } else {
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn minimal_epub(mimetype: &[u8], stored: bool) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let opts = if stored {
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
        } else {
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
        };
        zip.start_file("mimetype", opts).unwrap();
        zip.write_all(mimetype).unwrap();
        zip.start_file("META-INF/container.xml", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(
            br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
        )
        .unwrap();
        zip.start_file("OEBPS/content.opf", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"<package/>").unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_open_and_resolve_opf() {
        let bytes = minimal_epub(b"application/epub+zip", true);
        let mut epub = EpubArchive::from_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(epub.opf_path(), "OEBPS/content.opf");
        assert_eq!(epub.opf_dir(), "OEBPS");
        assert_eq!(epub.read("OEBPS/content.opf").unwrap(), b"<package/>");
    }

    #[test]
    fn test_rejects_wrong_mimetype() {
        let bytes = minimal_epub(b"text/plain", true);
        assert!(matches!(
            EpubArchive::from_reader(Cursor::new(bytes)),
            Err(Error::InvalidEpub(_))
        ));
    }

    #[test]
    fn test_rejects_deflated_mimetype() {
        let bytes = minimal_epub(b"application/epub+zip", false);
        assert!(matches!(
            EpubArchive::from_reader(Cursor::new(bytes)),
            Err(Error::InvalidEpub(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let bytes = minimal_epub(b"application/epub+zip", true);
        let mut epub = EpubArchive::from_reader(Cursor::new(bytes)).unwrap();
        assert!(matches!(
            epub.read("OEBPS/none.xhtml"),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./OEBPS/ch1.xhtml"), "OEBPS/ch1.xhtml");
        assert_eq!(normalize_path("a\\b.css"), "a/b.css");
    }

    #[test]
    fn test_strip_bom() {
        assert_eq!(strip_bom(&[0xEF, 0xBB, 0xBF, b'a']), b"a");
        assert_eq!(strip_bom(b"abc"), b"abc");
    }
}
