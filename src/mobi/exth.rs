//! EXTH extended metadata block.
//!
//! Big-endian `EXTH` block embedded in Record 0: magic, padded header
//! length, record count, then `{type, length, data}` records. KF8 output
//! always carries type 121 (boundary offset) and 125 (total record count)
//! first; the cover, when present, is type 131 with its 0-based index in
//! the image table.

use chrono::{DateTime, NaiveDate};

use crate::epub::package::Metadata;

const EXTH_AUTHOR: u32 = 100;
const EXTH_PUBLISHER: u32 = 101;
const EXTH_DESCRIPTION: u32 = 103;
const EXTH_ISBN: u32 = 104;
const EXTH_SUBJECT: u32 = 105;
const EXTH_PUBDATE: u32 = 106;
const EXTH_RIGHTS: u32 = 109;
const EXTH_KF8_BOUNDARY: u32 = 121;
const EXTH_RECORD_COUNT: u32 = 125;
const EXTH_COVER_INDEX: u32 = 131;
const EXTH_UPDATED_TITLE: u32 = 503;
const EXTH_LANGUAGE: u32 = 524;

/// Build the EXTH block. `total_records` is the final PDB record count,
/// `cover_index` the 0-based index into the image record table.
pub fn build_exth(metadata: &Metadata, total_records: u32, cover_index: Option<u32>) -> Vec<u8> {
    let mut records: Vec<(u32, Vec<u8>)> = Vec::new();

    // Mandatory KF8 records first: boundary (0 for single-format) and
    // total record count
    records.push((EXTH_KF8_BOUNDARY, 0u32.to_be_bytes().to_vec()));
    records.push((EXTH_RECORD_COUNT, total_records.to_be_bytes().to_vec()));

    let authors = metadata
        .creators
        .iter()
        .filter(|c| c.role.is_empty() || c.role == "aut")
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(" & ");
    if !authors.is_empty() {
        records.push((EXTH_AUTHOR, authors.into_bytes()));
    }

    if let Some(publisher) = &metadata.publisher {
        records.push((EXTH_PUBLISHER, publisher.clone().into_bytes()));
    }
    if let Some(description) = &metadata.description {
        records.push((EXTH_DESCRIPTION, description.clone().into_bytes()));
    }
    if !metadata.identifier.is_empty() {
        let ident = metadata.identifier.replace('-', "");
        records.push((EXTH_ISBN, ident.into_bytes()));
    }
    if !metadata.subjects.is_empty() {
        let subjects = metadata.subjects.join("; ");
        records.push((EXTH_SUBJECT, subjects.into_bytes()));
    }
    if let Some(date) = &metadata.date {
        records.push((EXTH_PUBDATE, normalize_date(date).into_bytes()));
    }
    if let Some(rights) = &metadata.rights {
        records.push((EXTH_RIGHTS, rights.clone().into_bytes()));
    }
    if let Some(index) = cover_index {
        records.push((EXTH_COVER_INDEX, index.to_be_bytes().to_vec()));
    }
    records.push((EXTH_UPDATED_TITLE, metadata.title.clone().into_bytes()));
    if !metadata.language.is_empty() {
        records.push((EXTH_LANGUAGE, metadata.language.clone().into_bytes()));
    }

    let mut body = Vec::new();
    for (record_type, data) in &records {
        body.extend_from_slice(&record_type.to_be_bytes());
        body.extend_from_slice(&((8 + data.len()) as u32).to_be_bytes());
        body.extend_from_slice(data);
    }

    // Pad the whole block to a 4-byte boundary; the length field covers
    // the padding
    let unpadded = 12 + body.len();
    let padding = (4 - unpadded % 4) % 4;
    let total = unpadded + padding;

    let mut exth = Vec::with_capacity(total);
    exth.extend_from_slice(b"EXTH");
    exth.extend_from_slice(&(total as u32).to_be_bytes());
    exth.extend_from_slice(&(records.len() as u32).to_be_bytes());
    exth.extend_from_slice(&body);
    exth.resize(total, 0);
    exth
}

/// Normalise a publication date to `YYYY-MM-DD`, accepting RFC 3339
/// variants; the original string survives parse failure.
fn normalize_date(date: &str) -> String {
    let trimmed = date.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return parsed.date_naive().format("%Y-%m-%d").to_string();
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d", "%Y-%m", "%Y"] {
        if let Ok(parsed) = parse_partial(trimmed, format) {
            return parsed.format("%Y-%m-%d").to_string();
        }
    }
    trimmed.to_string()
}

fn parse_partial(value: &str, format: &str) -> Result<NaiveDate, chrono::ParseError> {
    match format {
        "%Y" => NaiveDate::parse_from_str(&format!("{}-01-01", value), "%Y-%m-%d"),
        "%Y-%m" => NaiveDate::parse_from_str(&format!("{}-01", value), "%Y-%m-%d"),
        "%Y-%m-%dT%H:%M:%S" => {
            chrono::NaiveDateTime::parse_from_str(value, format).map(|dt| dt.date())
        }
        _ => NaiveDate::parse_from_str(value, format),
    }
}

/// Parse one EXTH record's data back out of a built block. Test support.
#[cfg(test)]
pub fn find_record(exth: &[u8], wanted: u32) -> Option<Vec<u8>> {
    let count = u32::from_be_bytes(exth[8..12].try_into().ok()?) as usize;
    let mut pos = 12;
    for _ in 0..count {
        let record_type = u32::from_be_bytes(exth[pos..pos + 4].try_into().ok()?);
        let length = u32::from_be_bytes(exth[pos + 4..pos + 8].try_into().ok()?) as usize;
        if record_type == wanted {
            return Some(exth[pos + 8..pos + length].to_vec());
        }
        pos += length;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epub::package::Creator;

    fn metadata() -> Metadata {
        Metadata {
            title: "Test Book".into(),
            language: "en".into(),
            identifier: "978-1-23456-789-7".into(),
            creators: vec![
                Creator { name: "A. Author".into(), role: "aut".into() },
                Creator { name: "B. Builder".into(), role: String::new() },
                Creator { name: "C. Cutter".into(), role: "edt".into() },
            ],
            date: Some("2021-03-04T05:06:07Z".into()),
            publisher: Some("Pub".into()),
            description: None,
            subjects: vec!["One".into(), "Two".into()],
            rights: None,
            cover_id: None,
        }
    }

    #[test]
    fn test_block_shape() {
        let exth = build_exth(&metadata(), 42, Some(0));
        assert_eq!(&exth[0..4], b"EXTH");
        let len = u32::from_be_bytes(exth[4..8].try_into().unwrap()) as usize;
        assert_eq!(len, exth.len());
        assert_eq!(exth.len() % 4, 0);
    }

    #[test]
    fn test_mandatory_records_first() {
        let exth = build_exth(&metadata(), 42, None);
        let first_type = u32::from_be_bytes(exth[12..16].try_into().unwrap());
        assert_eq!(first_type, EXTH_KF8_BOUNDARY);
        assert_eq!(
            find_record(&exth, EXTH_RECORD_COUNT).unwrap(),
            42u32.to_be_bytes().to_vec()
        );
    }

    #[test]
    fn test_metadata_mapping() {
        let exth = build_exth(&metadata(), 10, Some(3));
        assert_eq!(
            find_record(&exth, EXTH_AUTHOR).unwrap(),
            b"A. Author & B. Builder".to_vec()
        );
        assert_eq!(find_record(&exth, EXTH_ISBN).unwrap(), b"9781234567897".to_vec());
        assert_eq!(find_record(&exth, EXTH_SUBJECT).unwrap(), b"One; Two".to_vec());
        assert_eq!(find_record(&exth, EXTH_PUBDATE).unwrap(), b"2021-03-04".to_vec());
        assert_eq!(
            find_record(&exth, EXTH_COVER_INDEX).unwrap(),
            3u32.to_be_bytes().to_vec()
        );
        assert_eq!(find_record(&exth, EXTH_UPDATED_TITLE).unwrap(), b"Test Book".to_vec());
        assert_eq!(find_record(&exth, EXTH_LANGUAGE).unwrap(), b"en".to_vec());
    }

    #[test]
    fn test_no_cover_record_when_absent() {
        let exth = build_exth(&metadata(), 10, None);
        assert!(find_record(&exth, EXTH_COVER_INDEX).is_none());
    }

    #[test]
    fn test_date_normalisation() {
        assert_eq!(normalize_date("2020-05-06"), "2020-05-06");
        assert_eq!(normalize_date("2020-05-06T07:08:09+02:00"), "2020-05-06");
        assert_eq!(normalize_date("2020"), "2020-01-01");
        assert_eq!(normalize_date("circa 1900"), "circa 1900");
    }
}
