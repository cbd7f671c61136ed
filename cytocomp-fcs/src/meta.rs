//! Dataset metadata resolved from the header and TEXT keywords.

use crate::header::{parse_header, FcsHeader};
use crate::spill::parse_spillover;
use crate::text::{parse_text_segment, TextSegment};
use crate::{Error, Result};
use std::ops::RangeInclusive;

/// Bit width assumed for integer parameters without a usable `$PnB`.
const DEFAULT_INTEGER_BITS: u64 = 16;

/// Numeric encoding of the DATA segment (`$DATATYPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// `I`: unsigned integers, width per parameter.
    Integer,
    /// `F`: 32-bit IEEE floats.
    Float32,
    /// `D`: 64-bit IEEE floats.
    Float64,
}

impl DataType {
    /// Parses a `$DATATYPE` value. Absent means integer.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedDataType`] for anything but `I`, `F` or `D`.
    pub fn from_keyword(value: Option<&str>) -> Result<Self> {
        match value.map(|v| v.trim().to_ascii_uppercase()).as_deref() {
            None | Some("I") => Ok(Self::Integer),
            Some("F") => Ok(Self::Float32),
            Some("D") => Ok(Self::Float64),
            Some(other) => Err(Error::UnsupportedDataType(format!("$DATATYPE {other:?}"))),
        }
    }

    /// Bytes used by one value of a parameter with `bits` (`$PnB`).
    ///
    /// Integers round up to the narrowest of 1, 2 or 4 bytes.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedDataType`] for integer widths above 32 bits.
    pub fn byte_width(self, bits: Option<u64>) -> Result<usize> {
        match self {
            Self::Float32 => Ok(4),
            Self::Float64 => Ok(8),
            Self::Integer => match bits.unwrap_or(DEFAULT_INTEGER_BITS) {
                0..=8 => Ok(1),
                9..=16 => Ok(2),
                17..=32 => Ok(4),
                b => Err(Error::UnsupportedDataType(format!(
                    "{b}-bit integers are not supported"
                ))),
            },
        }
    }

    /// Smallest possible byte width of one value.
    fn min_byte_width(self) -> usize {
        match self {
            Self::Integer => 1,
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

/// Byte order of multi-byte values (`$BYTEORD`).
///
/// Convention: the ascending marker (`1,2,3,4` or `1,2`) means the least
/// significant byte comes first, i.e. little-endian; the descending marker
/// (`4,3,2,1` or `2,1`) means big-endian. This follows the FCS 3.x standard
/// text. A missing keyword reads as little-endian. Any other permutation is
/// logged and read as big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    #[must_use]
    pub fn from_keyword(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::LittleEndian;
        };
        let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        match compact.as_str() {
            "1,2,3,4" | "1,2" | "" => Self::LittleEndian,
            "4,3,2,1" | "2,1" => Self::BigEndian,
            other => {
                log::warn!("unrecognized $BYTEORD {other:?}, reading as big-endian");
                Self::BigEndian
            }
        }
    }

    #[must_use]
    pub fn is_little_endian(self) -> bool {
        self == Self::LittleEndian
    }
}

/// One channel of the DATA segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescriptor {
    /// 0-based column position.
    pub index: usize,
    /// Display label: `$PnS`, else `$PnN`, else `P{n}`.
    pub label: String,
    /// Raw `$PnN`.
    pub name: Option<String>,
    /// Raw `$PnS`.
    pub stain: Option<String>,
    /// `$PnB`, when present and numeric.
    pub bit_width: Option<u32>,
    /// `$PnR`, when present and numeric.
    pub range: Option<f64>,
    /// Bytes per value in the DATA segment.
    pub byte_width: usize,
}

/// Everything needed to read events, resolved from header and TEXT.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetMeta {
    pub version: String,
    pub n_events: usize,
    pub params: Vec<ParameterDescriptor>,
    pub data_type: DataType,
    pub byte_order: ByteOrder,
    /// Inclusive absolute byte offsets of the DATA segment.
    pub data_range: RangeInclusive<u64>,
    /// `n_params²` spillover block, `[to * n + from]`, diagonal zero.
    pub spillover: Option<Vec<f64>>,
}

fn required_count(text: &TextSegment, key: &'static str) -> Result<usize> {
    text.get_u64(key)
        .and_then(|v| usize::try_from(v).ok())
        .filter(|&v| v > 0)
        .ok_or(Error::MissingRequiredField(key))
}

/// Bytes of `range` that exist in a file of `file_len` bytes.
fn available_bytes(range: &RangeInclusive<u64>, file_len: usize) -> u64 {
    let end = (*range.end()).min((file_len as u64).saturating_sub(1));
    (end + 1).saturating_sub(*range.start())
}

/// `n_events` records of `bytes_per_event`; saturates on overflow so the
/// size check always fails for absurd counts.
pub(crate) fn required_data_bytes(bytes_per_event: usize, n_events: usize) -> u64 {
    (bytes_per_event as u64)
        .checked_mul(n_events as u64)
        .unwrap_or(u64::MAX)
}

/// `$BEGINDATA`/`$ENDDATA` win when present and non-zero.
fn data_offset(text: &TextSegment, key: &str, header_value: u64) -> u64 {
    text.get_u64(key).filter(|&v| v != 0).unwrap_or(header_value)
}

impl DatasetMeta {
    /// Parses header and TEXT from a whole file.
    ///
    /// # Errors
    /// Any header, TEXT, keyword, range, type or size error.
    pub fn decode(bytes: &[u8]) -> Result<(Self, TextSegment)> {
        let header = parse_header(bytes)?;
        let text = parse_text_segment(bytes, header.text_start, header.text_end)?;
        let meta = Self::from_text(&header, &text, bytes.len())?;
        Ok((meta, text))
    }

    /// Resolves metadata from an already parsed header and TEXT segment.
    ///
    /// `file_len` bounds the DATA segment: bytes past the end of the file are
    /// not counted as available.
    ///
    /// # Errors
    /// Returns [`Error::MissingRequiredField`], [`Error::InvalidDataRange`],
    /// [`Error::UnsupportedDataType`] or [`Error::DataSegmentTooSmall`].
    pub fn from_text(header: &FcsHeader, text: &TextSegment, file_len: usize) -> Result<Self> {
        let n_events = required_count(text, "$TOT")?;
        let n_params = required_count(text, "$PAR")?;

        let start = data_offset(text, "$BEGINDATA", header.data_start);
        let end = data_offset(text, "$ENDDATA", header.data_end);
        if end <= start || start >= file_len as u64 {
            return Err(Error::InvalidDataRange { start, end });
        }

        let data_type = DataType::from_keyword(text.get("$DATATYPE"))?;
        let byte_order = ByteOrder::from_keyword(text.get("$BYTEORD"));

        // Lower bound: every value takes at least the minimum width.
        let actual = available_bytes(&(start..=end), file_len);
        let at_least = required_data_bytes(
            data_type.min_byte_width().saturating_mul(n_params),
            n_events,
        );
        if actual < at_least {
            return Err(Error::DataSegmentTooSmall {
                required: at_least,
                actual,
            });
        }

        let params = (1..=n_params)
            .map(|n| {
                let name = text.get_trimmed(&format!("$P{n}N")).map(str::to_string);
                let stain = text.get_trimmed(&format!("$P{n}S")).map(str::to_string);
                let bits = text.get_u64(&format!("$P{n}B"));
                let bit_width = bits.and_then(|b| u32::try_from(b).ok());
                let range = text
                    .get_trimmed(&format!("$P{n}R"))
                    .and_then(|r| r.parse::<f64>().ok());
                let label = stain
                    .clone()
                    .or_else(|| name.clone())
                    .unwrap_or_else(|| format!("P{n}"));
                Ok(ParameterDescriptor {
                    index: n - 1,
                    label,
                    name,
                    stain,
                    bit_width,
                    range,
                    byte_width: data_type.byte_width(bits)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let bytes_per_event: usize = params.iter().map(|p| p.byte_width).sum();
        let required = required_data_bytes(bytes_per_event, n_events);
        if actual < required {
            return Err(Error::DataSegmentTooSmall { required, actual });
        }

        let meta = Self {
            version: header.version.clone(),
            n_events,
            params,
            data_type,
            byte_order,
            data_range: start..=end,
            spillover: parse_spillover(text, n_params),
        };
        log::debug!(
            "{}: {n_events} events x {n_params} params, {:?} {:?}, DATA {start}..={end}",
            meta.version,
            data_type,
            byte_order
        );
        Ok(meta)
    }

    #[must_use]
    pub fn n_params(&self) -> usize {
        self.params.len()
    }

    /// Sum of per-parameter byte widths.
    #[must_use]
    pub fn bytes_per_event(&self) -> usize {
        self.params.iter().map(|p| p.byte_width).sum()
    }

    /// Bytes of the declared DATA range that exist in a file of `file_len` bytes.
    #[must_use]
    pub fn available_data_bytes(&self, file_len: usize) -> u64 {
        available_bytes(&self.data_range, file_len)
    }

    /// Parameter labels in column order.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.label.as_str()).collect()
    }

    /// Index of the parameter with this label (exact match), if any.
    #[must_use]
    pub fn find_param(&self, label: &str) -> Option<usize> {
        self.params.iter().position(|p| p.label == label || p.name.as_deref() == Some(label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(pairs: &[(&str, &str)]) -> TextSegment {
        let mut t = TextSegment::default();
        for (k, v) in pairs {
            t.insert(k, (*v).to_string());
        }
        t
    }

    fn header(data_start: u64, data_end: u64) -> FcsHeader {
        FcsHeader {
            version: "FCS3.1".into(),
            text_start: 58,
            text_end: 100,
            data_start,
            data_end,
            analysis: None,
        }
    }

    #[test]
    fn test_integer_byte_widths() {
        let i = DataType::Integer;
        assert_eq!(i.byte_width(Some(8)).unwrap(), 1);
        assert_eq!(i.byte_width(Some(10)).unwrap(), 2);
        assert_eq!(i.byte_width(Some(16)).unwrap(), 2);
        assert_eq!(i.byte_width(Some(24)).unwrap(), 4);
        assert_eq!(i.byte_width(None).unwrap(), 2);
        assert!(matches!(i.byte_width(Some(64)), Err(Error::UnsupportedDataType(_))));
        assert!(matches!(
            i.byte_width(Some(4_294_967_296)),
            Err(Error::UnsupportedDataType(_))
        ));
        assert_eq!(DataType::Float64.byte_width(Some(64)).unwrap(), 8);
    }

    #[test]
    fn test_datatype_keyword() {
        assert_eq!(DataType::from_keyword(None).unwrap(), DataType::Integer);
        assert_eq!(DataType::from_keyword(Some("f")).unwrap(), DataType::Float32);
        assert!(DataType::from_keyword(Some("A")).is_err());
    }

    #[test]
    fn test_byte_order_convention() {
        assert_eq!(ByteOrder::from_keyword(Some("1,2,3,4")), ByteOrder::LittleEndian);
        assert_eq!(ByteOrder::from_keyword(Some(" 1, 2 ")), ByteOrder::LittleEndian);
        assert_eq!(ByteOrder::from_keyword(Some("4,3,2,1")), ByteOrder::BigEndian);
        assert_eq!(ByteOrder::from_keyword(None), ByteOrder::LittleEndian);
        assert_eq!(ByteOrder::from_keyword(Some("3,4,1,2")), ByteOrder::BigEndian);
    }

    #[test]
    fn test_required_fields() {
        let t = text(&[("$TOT", "10")]);
        assert!(matches!(
            DatasetMeta::from_text(&header(200, 300), &t, 400),
            Err(Error::MissingRequiredField("$PAR"))
        ));
        let t = text(&[("$TOT", "0"), ("$PAR", "1")]);
        assert!(matches!(
            DatasetMeta::from_text(&header(200, 300), &t, 400),
            Err(Error::MissingRequiredField("$TOT"))
        ));
    }

    #[test]
    fn test_keyword_offsets_take_precedence() {
        let t = text(&[
            ("$TOT", "2"),
            ("$PAR", "1"),
            ("$BEGINDATA", "300"),
            ("$ENDDATA", "303"),
        ]);
        let meta = DatasetMeta::from_text(&header(200, 201), &t, 400).unwrap();
        assert_eq!(meta.data_range, 300..=303);

        let t = text(&[("$TOT", "2"), ("$PAR", "1"), ("$BEGINDATA", "0"), ("$ENDDATA", "0")]);
        let meta = DatasetMeta::from_text(&header(200, 203), &t, 400).unwrap();
        assert_eq!(meta.data_range, 200..=203);
    }

    #[test]
    fn test_invalid_range() {
        let t = text(&[("$TOT", "2"), ("$PAR", "1")]);
        assert!(matches!(
            DatasetMeta::from_text(&header(0, 0), &t, 400),
            Err(Error::InvalidDataRange { .. })
        ));
        assert!(matches!(
            DatasetMeta::from_text(&header(500, 600), &t, 400),
            Err(Error::InvalidDataRange { .. })
        ));
    }

    #[test]
    fn test_too_small_reports_sizes() {
        let t = text(&[("$TOT", "3"), ("$PAR", "2"), ("$P1B", "16"), ("$P2B", "16")]);
        match DatasetMeta::from_text(&header(200, 209), &t, 400) {
            Err(Error::DataSegmentTooSmall { required, actual }) => {
                assert_eq!(required, 12);
                assert_eq!(actual, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
        // A range running past the end of the file only counts existing bytes.
        let t = text(&[("$TOT", "1"), ("$PAR", "2")]);
        assert!(matches!(
            DatasetMeta::from_text(&header(398, 500), &t, 400),
            Err(Error::DataSegmentTooSmall { required: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_bit_width_beyond_u32_is_unsupported() {
        let t = text(&[("$TOT", "1"), ("$PAR", "1"), ("$P1B", "4294967296")]);
        assert!(matches!(
            DatasetMeta::from_text(&header(200, 209), &t, 400),
            Err(Error::UnsupportedDataType(_))
        ));
        // Non-numeric widths still get the default.
        let t = text(&[("$TOT", "1"), ("$PAR", "1"), ("$P1B", "*")]);
        let meta = DatasetMeta::from_text(&header(200, 209), &t, 400).unwrap();
        assert_eq!(meta.params[0].byte_width, 2);
        assert_eq!(meta.params[0].bit_width, None);
    }

    #[test]
    fn test_huge_counts_fail_size_check() {
        let t = text(&[("$TOT", "9223372036854775808"), ("$PAR", "1"), ("$P1B", "16")]);
        assert!(matches!(
            DatasetMeta::from_text(&header(200, 203), &t, 400),
            Err(Error::DataSegmentTooSmall { actual: 4, .. })
        ));
        let t = text(&[("$TOT", "1"), ("$PAR", "3000000"), ("SPILL", "1,A,1")]);
        assert!(matches!(
            DatasetMeta::from_text(&header(200, 203), &t, 400),
            Err(Error::DataSegmentTooSmall {
                required: 3_000_000,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_labels_and_lookup() {
        let t = text(&[
            ("$TOT", "1"),
            ("$PAR", "3"),
            ("$P1N", "FSC-A"),
            ("$P2N", "FL1-A"),
            ("$P2S", "CD3 FITC"),
            ("$P3R", "262144"),
        ]);
        let meta = DatasetMeta::from_text(&header(200, 205), &t, 400).unwrap();
        assert_eq!(meta.labels(), ["FSC-A", "CD3 FITC", "P3"]);
        assert_eq!(meta.params[2].range, Some(262_144.0));
        assert_eq!(meta.find_param("FL1-A"), Some(1));
        assert_eq!(meta.bytes_per_event(), 6);
        assert!(meta.spillover.is_none());
    }
}
