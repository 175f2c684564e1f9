//! BCP 47 language tag to Windows LCID mapping for the MOBI header.

/// Default locale when the tag is unknown: en-US.
pub const DEFAULT_LCID: u32 = 0x0409;

/// Map a BCP 47 tag to a Windows LCID. Falls back to the primary
/// subtag, then to [`DEFAULT_LCID`].
pub fn windows_lcid(tag: &str) -> u32 {
    let tag = tag.trim().to_ascii_lowercase().replace('_', "-");
    if tag.is_empty() {
        return DEFAULT_LCID;
    }
    if let Some(lcid) = lookup(&tag) {
        return lcid;
    }
    let primary = tag.split('-').next().unwrap_or(&tag);
    lookup(primary).unwrap_or(DEFAULT_LCID)
}

fn lookup(tag: &str) -> Option<u32> {
    let lcid = match tag {
        "en" | "en-us" => 0x0409,
        "en-gb" => 0x0809,
        "en-au" => 0x0C09,
        "en-ca" => 0x1009,
        "de" | "de-de" => 0x0407,
        "fr" | "fr-fr" => 0x040C,
        "fr-ca" => 0x0C0C,
        "es" | "es-es" => 0x040A,
        "it" | "it-it" => 0x0410,
        "pt" | "pt-pt" => 0x0816,
        "pt-br" => 0x0416,
        "nl" | "nl-nl" => 0x0413,
        "ja" | "ja-jp" => 0x0411,
        "ko" | "ko-kr" => 0x0412,
        "zh" | "zh-cn" | "zh-hans" => 0x0804,
        "zh-tw" | "zh-hant" => 0x0404,
        "zh-hk" => 0x0C04,
        "ru" | "ru-ru" => 0x0419,
        "pl" => 0x0415,
        "sv" => 0x041D,
        "da" => 0x0406,
        "fi" => 0x040B,
        "no" | "nb" => 0x0414,
        "nn" => 0x0814,
        "cs" => 0x0405,
        "sk" => 0x041B,
        "el" => 0x0408,
        "he" => 0x040D,
        "ar" => 0x0401,
        "tr" => 0x041F,
        "th" => 0x041E,
        "hi" => 0x0439,
        "uk" => 0x0422,
        "hu" => 0x040E,
        "ro" => 0x0418,
        "ca" => 0x0403,
        "eu" => 0x042D,
        "hr" => 0x041A,
        "sr" => 0x0C1A,
        "bg" => 0x0402,
        "lt" => 0x0427,
        "lv" => 0x0426,
        "et" => 0x0425,
        "sl" => 0x0424,
        "vi" => 0x042A,
        "id" => 0x0421,
        "ms" => 0x043E,
        "fa" => 0x0429,
        _ => return None,
    };
    Some(lcid)
}
