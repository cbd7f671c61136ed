//! Fixed 58-byte FCS header.
//!
//! Layout (byte ranges, ASCII):
//!
//! | bytes  | field            |
//! |--------|------------------|
//! | 0..6   | version (`FCS3.1`) |
//! | 6..10  | spaces           |
//! | 10..18 | TEXT start       |
//! | 18..26 | TEXT end         |
//! | 26..34 | DATA start       |
//! | 34..42 | DATA end         |
//! | 42..50 | ANALYSIS start   |
//! | 50..58 | ANALYSIS end     |
//!
//! Offsets are right-justified decimal integers, inclusive, relative to the
//! start of the file.

use crate::{Error, Result};

/// Size of the fixed header region.
pub const HEADER_LEN: usize = 58;

/// Prefix every version string starts with.
pub const MAGIC: &str = "FCS";

/// Decoded header offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcsHeader {
    pub version: String,
    pub text_start: u64,
    pub text_end: u64,
    /// 0 when the header leaves it blank (large files defer to `$BEGINDATA`).
    pub data_start: u64,
    /// 0 when the header leaves it blank (large files defer to `$ENDDATA`).
    pub data_end: u64,
    pub analysis: Option<(u64, u64)>,
}

fn field(header: &[u8], start: usize) -> &str {
    // Header bytes outside ASCII cannot form a number; an empty field is
    // handled like a blank one by the callers.
    std::str::from_utf8(&header[start..start + 8])
        .unwrap_or("")
        .trim()
}

fn required_offset(header: &[u8], start: usize, name: &str) -> Result<u64> {
    let raw = field(header, start);
    raw.parse::<u64>()
        .map_err(|_| Error::MalformedHeader(format!("{name} offset {raw:?} is not an integer")))
}

/// Blank or unparsable offsets read as 0; callers resolve them against TEXT keywords.
fn optional_offset(header: &[u8], start: usize) -> u64 {
    field(header, start).parse::<u64>().unwrap_or(0)
}

/// Parses the fixed header at the start of `bytes`.
///
/// # Errors
/// Returns [`Error::MalformedHeader`] if the buffer is shorter than 58 bytes,
/// the version lacks the `FCS` magic, a TEXT offset is not an integer, or
/// the TEXT end is not past its start.
pub fn parse_header(bytes: &[u8]) -> Result<FcsHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::MalformedHeader(format!(
            "header needs {HEADER_LEN} bytes, file has {}",
            bytes.len()
        )));
    }
    let header = &bytes[..HEADER_LEN];
    let version: String = header[..6].iter().map(|&b| char::from(b)).collect();
    let version = version.trim().to_string();
    if !version.starts_with(MAGIC) {
        return Err(Error::MalformedHeader(format!(
            "missing '{MAGIC}' magic (found {version:?})"
        )));
    }

    let text_start = required_offset(header, 10, "TEXT start")?;
    let text_end = required_offset(header, 18, "TEXT end")?;
    if text_end <= text_start {
        return Err(Error::MalformedHeader(format!(
            "TEXT end {text_end} is not past start {text_start}"
        )));
    }

    let analysis_start = optional_offset(header, 42);
    let analysis_end = optional_offset(header, 50);
    let analysis = (analysis_end > analysis_start).then_some((analysis_start, analysis_end));

    Ok(FcsHeader {
        version,
        text_start,
        text_end,
        data_start: optional_offset(header, 26),
        data_end: optional_offset(header, 34),
        analysis,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(fields: [u64; 6]) -> Vec<u8> {
        let mut s = String::from("FCS3.0    ");
        for f in fields {
            s.push_str(&format!("{f:>8}"));
        }
        s.into_bytes()
    }

    #[test]
    fn test_reads_segment_offsets() {
        let bytes = header([58, 80, 81, 88, 0, 0]);
        assert_eq!(bytes.len(), HEADER_LEN);
        let h = parse_header(&bytes).unwrap();
        assert_eq!(h.version, "FCS3.0");
        assert_eq!((h.text_start, h.text_end), (58, 80));
        assert_eq!((h.data_start, h.data_end), (81, 88));
        assert_eq!(h.analysis, None);
    }

    #[test]
    fn test_analysis_pair() {
        let h = parse_header(&header([58, 80, 81, 88, 89, 120])).unwrap();
        assert_eq!(h.analysis, Some((89, 120)));
    }

    #[test]
    fn test_short_buffer() {
        let bytes = header([58, 80, 81, 88, 0, 0]);
        assert!(matches!(
            parse_header(&bytes[..57]),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = header([58, 80, 81, 88, 0, 0]);
        bytes[..3].copy_from_slice(b"XYZ");
        assert!(matches!(parse_header(&bytes), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_text_range_must_be_ordered() {
        let bytes = header([80, 80, 81, 88, 0, 0]);
        assert!(matches!(parse_header(&bytes), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_blank_data_offsets_read_as_zero() {
        let mut s = String::from("FCS3.1    ");
        s.push_str(&format!("{:>8}{:>8}", 58, 200));
        s.push_str(&" ".repeat(32));
        let h = parse_header(s.as_bytes()).unwrap();
        assert_eq!((h.data_start, h.data_end), (0, 0));
    }

    #[test]
    fn test_non_numeric_text_offset() {
        let mut bytes = header([58, 80, 81, 88, 0, 0]);
        bytes[12] = b'x';
        assert!(matches!(parse_header(&bytes), Err(Error::MalformedHeader(_))));
    }
}
