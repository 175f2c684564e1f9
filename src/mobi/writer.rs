//! AZW3 (KF8) binary assembly.
//!
//! Plans the PDB record layout up front, then emits Record 0 (PalmDOC +
//! MOBI header + EXTH + title), compressed text records, image records,
//! the optional NCX record, FDST/FLIS/FCIS/EOF, and finally the PDB
//! header and record list. All record-number cross-references come from
//! the plan; nothing is renumbered after planning.

use std::io::Write;

use log::debug;

use crate::epub::package::Metadata;
use crate::error::{Error, Result};
use crate::images::ImageMap;

use super::exth::build_exth;
use super::lang::windows_lcid;
use super::palmdoc;

/// Uncompressed text record chunk size.
pub const TEXT_RECORD_SIZE: usize = 4096;
pub const NULL_INDEX: u32 = 0xFFFF_FFFF;

/// Seconds between the PDB epoch (1904-01-01) and the Unix epoch.
const PDB_EPOCH_OFFSET: u32 = 2_082_844_800;
const MOBI_HEADER_LEN: u32 = 248;

/// Injectable sources of non-determinism.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeParams {
    /// MOBI header unique id; random when absent.
    pub uid: Option<u32>,
    /// PDB creation/modification time as Unix seconds; now when absent.
    pub timestamp: Option<u32>,
}

/// Logical record numbering, fixed before any bytes are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPlan {
    pub text_records: u32,
    pub image_records: u32,
    /// Record number of the first image record, or [`NULL_INDEX`].
    pub first_image_index: u32,
    pub ncx_record: Option<u32>,
    pub fdst_record: u32,
    pub flis_record: u32,
    pub fcis_record: u32,
    pub eof_record: u32,
    pub total_records: u32,
    pub first_content_record: u16,
    pub last_content_record: u16,
}

impl RecordPlan {
    pub fn new(text_len: usize, image_count: usize, has_ncx: bool) -> Self {
        let text_records = text_len.div_ceil(TEXT_RECORD_SIZE).max(1) as u32;
        let mut next = 1 + text_records;
        let first_image_index = if image_count > 0 { next } else { NULL_INDEX };
        next += image_count as u32;
        let ncx_record = if has_ncx {
            let record = next;
            next += 1;
            Some(record)
        } else {
            None
        };
        Self {
            text_records,
            image_records: image_count as u32,
            first_image_index,
            ncx_record,
            fdst_record: next,
            flis_record: next + 1,
            fcis_record: next + 2,
            eof_record: next + 3,
            total_records: next + 4,
            first_content_record: 1,
            last_content_record: text_records as u16,
        }
    }
}

/// Assembles the final AZW3 byte stream.
pub struct MobiEncoder<'a> {
    pub metadata: &'a Metadata,
    /// Final integrated HTML, byte-frozen.
    pub html: &'a [u8],
    pub images: &'a ImageMap,
    pub ncx_record: Option<&'a [u8]>,
    /// 0-based index of the cover in the image table, for EXTH 131.
    pub cover_index: Option<u32>,
    pub params: EncodeParams,
}

impl<'a> MobiEncoder<'a> {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let plan = RecordPlan::new(self.html.len(), self.images.len(), self.ncx_record.is_some());
        if plan.total_records > u16::MAX as u32 {
            return Err(Error::Assembly(format!(
                "record count {} exceeds the PDB limit",
                plan.total_records
            )));
        }

        let exth = build_exth(self.metadata, plan.total_records, self.cover_index);
        if &exth[0..4] != b"EXTH" {
            return Err(Error::Assembly("EXTH magic validation failed".into()));
        }

        let mut records: Vec<Vec<u8>> = Vec::with_capacity(plan.total_records as usize);
        records.push(self.build_record0(&plan, &exth));

        for chunk in self.html.chunks(TEXT_RECORD_SIZE) {
            records.push(palmdoc::compress(chunk));
        }
        if self.html.is_empty() {
            records.push(Vec::new());
        }

        for image in self.images.records() {
            records.push(image.data.clone());
        }
        if let Some(ncx) = self.ncx_record {
            records.push(ncx.to_vec());
        }
        records.push(self.build_fdst());
        records.push(build_flis());
        records.push(build_fcis(self.html.len() as u32));
        records.push(vec![0xE9, 0x8E, 0x0D, 0x0A]);

        debug_assert_eq!(records.len() as u32, plan.total_records);
        debug!(
            "encoding {} records ({} text, {} image, ncx: {})",
            plan.total_records,
            plan.text_records,
            plan.image_records,
            plan.ncx_record.is_some()
        );

        let mut out = Vec::new();
        self.write_pdb(&records, &mut out)?;
        Ok(out)
    }

    /// Record 0: PalmDOC header, MOBI header, EXTH, title, 4-byte aligned.
    fn build_record0(&self, plan: &RecordPlan, exth: &[u8]) -> Vec<u8> {
        let title_bytes = self.metadata.title.as_bytes();
        let uid = self.params.uid.unwrap_or_else(rand_uid);
        let lcid = windows_lcid(&self.metadata.language);
        let full_name_offset = MOBI_HEADER_LEN + exth.len() as u32;

        let mut r0 = Vec::with_capacity(16 + MOBI_HEADER_LEN as usize + exth.len() + title_bytes.len() + 4);

        // PalmDOC header (16 bytes)
        r0.extend_from_slice(&2u16.to_be_bytes()); // PalmDoc compression
        r0.extend_from_slice(&0u16.to_be_bytes());
        r0.extend_from_slice(&(self.html.len() as u32).to_be_bytes());
        r0.extend_from_slice(&(plan.text_records as u16).to_be_bytes());
        r0.extend_from_slice(&(TEXT_RECORD_SIZE as u16).to_be_bytes());
        r0.extend_from_slice(&0u16.to_be_bytes()); // no encryption
        r0.extend_from_slice(&0u16.to_be_bytes());

        // MOBI header (248 bytes, offsets relative to its start)
        let mobi_start = r0.len();
        r0.extend_from_slice(b"MOBI");
        r0.extend_from_slice(&MOBI_HEADER_LEN.to_be_bytes());
        r0.extend_from_slice(&MOBI_HEADER_LEN.to_be_bytes()); // MOBI type
        r0.extend_from_slice(&65001u32.to_be_bytes()); // UTF-8
        r0.extend_from_slice(&uid.to_be_bytes());
        r0.extend_from_slice(&8u32.to_be_bytes()); // KF8 file version
        for _ in 0..11 {
            r0.extend_from_slice(&NULL_INDEX.to_be_bytes()); // index slots
        }
        r0.extend_from_slice(&full_name_offset.to_be_bytes());
        r0.extend_from_slice(&(title_bytes.len() as u32).to_be_bytes());
        r0.extend_from_slice(&lcid.to_be_bytes());
        r0.extend_from_slice(&plan.first_image_index.to_be_bytes());
        // HUFF slots
        r0.extend_from_slice(&NULL_INDEX.to_be_bytes());
        r0.extend_from_slice(&0u32.to_be_bytes());
        r0.extend_from_slice(&NULL_INDEX.to_be_bytes());
        r0.extend_from_slice(&0u32.to_be_bytes());
        r0.extend_from_slice(&0x40u32.to_be_bytes()); // EXTH present
        r0.extend_from_slice(&[0u8; 32]);
        // DRM slots
        r0.extend_from_slice(&NULL_INDEX.to_be_bytes());
        r0.extend_from_slice(&0u32.to_be_bytes());
        r0.extend_from_slice(&0u32.to_be_bytes());
        r0.extend_from_slice(&0u32.to_be_bytes());
        r0.extend_from_slice(&[0u8; 8]);
        r0.extend_from_slice(&plan.first_content_record.to_be_bytes());
        r0.extend_from_slice(&plan.last_content_record.to_be_bytes());
        r0.extend_from_slice(&1u32.to_be_bytes());
        r0.extend_from_slice(&plan.fcis_record.to_be_bytes());
        r0.extend_from_slice(&1u32.to_be_bytes());
        r0.extend_from_slice(&plan.flis_record.to_be_bytes());
        r0.extend_from_slice(&1u32.to_be_bytes());
        r0.extend_from_slice(&[0u8; 8]);
        r0.extend_from_slice(&NULL_INDEX.to_be_bytes());
        r0.extend_from_slice(&0u32.to_be_bytes());
        r0.extend_from_slice(&NULL_INDEX.to_be_bytes());
        r0.extend_from_slice(&NULL_INDEX.to_be_bytes());
        r0.extend_from_slice(&0u32.to_be_bytes()); // extra record data flags
        r0.extend_from_slice(&NULL_INDEX.to_be_bytes()); // INDX
        for _ in 0..5 {
            r0.extend_from_slice(&NULL_INDEX.to_be_bytes()); // KF8 reserved
        }
        r0.extend_from_slice(&1u32.to_be_bytes()); // FDST flow count
        r0.extend_from_slice(&NULL_INDEX.to_be_bytes()); // FDST is standalone
        r0.extend_from_slice(&0u32.to_be_bytes());
        debug_assert_eq!(r0.len() - mobi_start, MOBI_HEADER_LEN as usize);

        r0.extend_from_slice(exth);
        r0.extend_from_slice(title_bytes);
        while r0.len() % 4 != 0 {
            r0.push(0);
        }
        r0
    }

    /// FDST: the single text flow `[0, L)`.
    fn build_fdst(&self) -> Vec<u8> {
        let mut fdst = Vec::with_capacity(20);
        fdst.extend_from_slice(b"FDST");
        fdst.extend_from_slice(&1u32.to_be_bytes()); // entry count
        fdst.extend_from_slice(&12u32.to_be_bytes()); // table start
        fdst.extend_from_slice(&0u32.to_be_bytes());
        fdst.extend_from_slice(&(self.html.len() as u32).to_be_bytes());
        fdst
    }

    fn write_pdb<W: Write>(&self, records: &[Vec<u8>], writer: &mut W) -> Result<()> {
        let timestamp = self
            .params
            .timestamp
            .unwrap_or_else(now_unix_secs)
            .wrapping_add(PDB_EPOCH_OFFSET);

        writer.write_all(&pdb_name(&self.metadata.title))?;
        writer.write_all(&0u16.to_be_bytes())?; // attributes
        writer.write_all(&0u16.to_be_bytes())?; // version
        writer.write_all(&timestamp.to_be_bytes())?; // created
        writer.write_all(&timestamp.to_be_bytes())?; // modified
        writer.write_all(&0u32.to_be_bytes())?; // last backup
        writer.write_all(&0u32.to_be_bytes())?; // modification number
        writer.write_all(&0u32.to_be_bytes())?; // app info
        writer.write_all(&0u32.to_be_bytes())?; // sort info
        writer.write_all(b"BOOK")?;
        writer.write_all(b"MOBI")?;
        writer.write_all(&0u32.to_be_bytes())?; // unique id seed
        writer.write_all(&0u32.to_be_bytes())?; // next record list
        writer.write_all(&(records.len() as u16).to_be_bytes())?;

        // Record list: offsets computed from sizes, 3-byte uid = index
        let mut offset = 78 + 8 * records.len() + 2;
        for (index, record) in records.iter().enumerate() {
            writer.write_all(&(offset as u32).to_be_bytes())?;
            let uid = index as u32;
            writer.write_all(&[0, (uid >> 16) as u8, (uid >> 8) as u8, uid as u8])?;
            offset += record.len();
        }
        writer.write_all(&[0, 0])?;

        for record in records {
            writer.write_all(record)?;
        }
        Ok(())
    }
}

/// FLIS: 36-byte constant.
fn build_flis() -> Vec<u8> {
    let mut flis = Vec::with_capacity(36);
    flis.extend_from_slice(b"FLIS");
    flis.extend_from_slice(&8u32.to_be_bytes());
    flis.extend_from_slice(&0x41u16.to_be_bytes());
    flis.extend_from_slice(&0u16.to_be_bytes());
    flis.extend_from_slice(&0u32.to_be_bytes());
    flis.extend_from_slice(&NULL_INDEX.to_be_bytes());
    flis.extend_from_slice(&1u16.to_be_bytes());
    flis.extend_from_slice(&3u16.to_be_bytes());
    flis.extend_from_slice(&3u32.to_be_bytes());
    flis.extend_from_slice(&1u32.to_be_bytes());
    flis.extend_from_slice(&NULL_INDEX.to_be_bytes());
    flis
}

/// FCIS: 44-byte record keyed on the uncompressed text length.
fn build_fcis(text_length: u32) -> Vec<u8> {
    let mut fcis = Vec::with_capacity(44);
    fcis.extend_from_slice(b"FCIS");
    fcis.extend_from_slice(&0x14u32.to_be_bytes());
    fcis.extend_from_slice(&0x10u32.to_be_bytes());
    fcis.extend_from_slice(&1u32.to_be_bytes());
    fcis.extend_from_slice(&0u32.to_be_bytes());
    fcis.extend_from_slice(&text_length.to_be_bytes());
    fcis.extend_from_slice(&0u32.to_be_bytes());
    fcis.extend_from_slice(&0x20u32.to_be_bytes());
    fcis.extend_from_slice(&8u32.to_be_bytes());
    fcis.extend_from_slice(&1u16.to_be_bytes());
    fcis.extend_from_slice(&1u16.to_be_bytes());
    fcis.extend_from_slice(&0u32.to_be_bytes());
    fcis
}

/// PDB database name: title truncated to 31 bytes on a char boundary,
/// NUL-padded to 32.
fn pdb_name(title: &str) -> [u8; 32] {
    let mut buf = [0u8; 32];
    let mut end = title.len().min(31);
    while !title.is_char_boundary(end) {
        end -= 1;
    }
    buf[..end].copy_from_slice(&title.as_bytes()[..end]);
    buf
}

fn now_unix_secs() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn rand_uid() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u32)
        .unwrap_or(12345);
    // Simple LCG
    seed.wrapping_mul(1103515245).wrapping_add(12345)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epub::package::Metadata;

    fn metadata() -> Metadata {
        Metadata {
            title: "Test Book".into(),
            language: "en".into(),
            identifier: "urn:uuid:12345".into(),
            ..Default::default()
        }
    }

    fn encode(html: &[u8], images: &ImageMap, ncx: Option<&[u8]>) -> Vec<u8> {
        MobiEncoder {
            metadata: &metadata(),
            html,
            images,
            ncx_record: ncx,
            cover_index: None,
            params: EncodeParams {
                uid: Some(7),
                timestamp: Some(0),
            },
        }
        .encode()
        .unwrap()
    }

    fn record_offsets(bytes: &[u8]) -> Vec<usize> {
        let count = u16::from_be_bytes([bytes[76], bytes[77]]) as usize;
        (0..count)
            .map(|i| {
                let at = 78 + 8 * i;
                u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
                    as usize
            })
            .collect()
    }

    #[test]
    fn test_plan_minimal() {
        let plan = RecordPlan::new(100, 0, false);
        assert_eq!(plan.text_records, 1);
        assert_eq!(plan.first_image_index, NULL_INDEX);
        assert_eq!(plan.ncx_record, None);
        assert_eq!(plan.fdst_record, 2);
        assert_eq!(plan.flis_record, 3);
        assert_eq!(plan.fcis_record, 4);
        assert_eq!(plan.eof_record, 5);
        assert_eq!(plan.total_records, 6);
    }

    #[test]
    fn test_plan_with_images_and_ncx() {
        let plan = RecordPlan::new(TEXT_RECORD_SIZE * 2 + 1, 3, true);
        assert_eq!(plan.text_records, 3);
        assert_eq!(plan.first_image_index, 4);
        assert_eq!(plan.ncx_record, Some(7));
        assert_eq!(plan.fdst_record, 8);
        assert_eq!(plan.total_records, 12);
        assert_eq!(plan.last_content_record, 3);
    }

    #[test]
    fn test_minimal_book_layout() {
        let bytes = encode(b"<html><body><p>Hello World</p></body></html>", &ImageMap::new(), None);
        assert_eq!(&bytes[60..64], b"BOOK");
        assert_eq!(&bytes[64..68], b"MOBI");
        assert_eq!(u16::from_be_bytes([bytes[76], bytes[77]]), 6);

        let offsets = record_offsets(&bytes);
        assert_eq!(offsets[0], 78 + 8 * 6 + 2);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));

        let r0 = &bytes[offsets[0]..offsets[1]];
        assert_eq!(&r0[16..20], b"MOBI");
        // Text encoding field: UTF-8
        assert_eq!(u32::from_be_bytes([r0[28], r0[29], r0[30], r0[31]]), 65001);
        assert_eq!(r0.len() % 4, 0);
    }

    #[test]
    fn test_text_roundtrip_through_records() {
        let html: Vec<u8> = "<html><body>"
            .bytes()
            .chain("lorem ipsum dolor sit amet ".bytes().cycle().take(10_000))
            .chain("</body></html>".bytes())
            .collect();
        let bytes = encode(&html, &ImageMap::new(), None);
        let offsets = record_offsets(&bytes);
        let plan = RecordPlan::new(html.len(), 0, false);

        let mut recovered = Vec::new();
        for i in 1..=plan.text_records as usize {
            let end = if i + 1 < offsets.len() {
                offsets[i + 1]
            } else {
                bytes.len()
            };
            recovered.extend(palmdoc::decompress(&bytes[offsets[i]..end]).unwrap());
        }
        assert_eq!(recovered, html);
    }

    #[test]
    fn test_image_and_ncx_records_in_place() {
        let mut images = ImageMap::new();
        images.insert("a.jpg", vec![0xFF, 0xD8, 1, 2, 3], "image/jpeg");
        let ncx = b"<html><body><ul></ul></body></html>";
        let bytes = encode(b"<html/>", &images, Some(ncx));

        let plan = RecordPlan::new(7, 1, true);
        let offsets = record_offsets(&bytes);
        assert_eq!(offsets.len(), plan.total_records as usize);

        let image_at = plan.first_image_index as usize;
        assert_eq!(
            &bytes[offsets[image_at]..offsets[image_at] + 5],
            &[0xFF, 0xD8, 1, 2, 3]
        );
        let ncx_at = plan.ncx_record.unwrap() as usize;
        assert_eq!(&bytes[offsets[ncx_at]..offsets[ncx_at] + ncx.len()], ncx);
        let fdst_at = plan.fdst_record as usize;
        assert_eq!(&bytes[offsets[fdst_at]..offsets[fdst_at] + 4], b"FDST");
        let flis_at = plan.flis_record as usize;
        assert_eq!(&bytes[offsets[flis_at]..offsets[flis_at] + 4], b"FLIS");
        assert_eq!(offsets[flis_at + 1] - offsets[flis_at], 36);
        let fcis_at = plan.fcis_record as usize;
        assert_eq!(&bytes[offsets[fcis_at]..offsets[fcis_at] + 4], b"FCIS");
        assert_eq!(offsets[fcis_at + 1] - offsets[fcis_at], 44);
        assert_eq!(&bytes[bytes.len() - 4..], &[0xE9, 0x8E, 0x0D, 0x0A]);
    }

    #[test]
    fn test_deterministic_output() {
        let a = encode(b"<html><body>same</body></html>", &ImageMap::new(), None);
        let b = encode(b"<html><body>same</body></html>", &ImageMap::new(), None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_pdb_name_truncation() {
        let name = pdb_name("short");
        assert_eq!(&name[..5], b"short");
        assert_eq!(name[5], 0);

        // Multi-byte boundary: must not split a rune
        let long = "あ".repeat(20); // 60 bytes
        let name = pdb_name(&long);
        assert_eq!(&name[..30], "あ".repeat(10).as_bytes());
        assert_eq!(name[30], 0);
    }
}
