//! cytocomp-fcs: FCS container decoder and event record reader.
//!
//! # Key Components
//!
//! - [`parse_header`] - Fixed 58-byte header with segment offsets
//! - [`parse_text_segment`] - Delimited keyword/value TEXT segment
//! - [`DatasetMeta`] - Event count, parameters, encoding and DATA range
//! - [`EventReader`] - Fixed-width event records, preview sampling
//!
//! # Decoding
//!
//! [`parse_fcs`] decodes the metadata of a whole file and samples at most
//! [`PREVIEW_CAP`] events for interactive use. The full event set is read on
//! demand through [`FcsFile::reader`].

mod error;
pub mod header;
pub mod meta;
pub mod reader;
pub mod spill;
pub mod text;

pub use error::{Error, Result};
pub use header::{parse_header, FcsHeader, HEADER_LEN};
pub use meta::{ByteOrder, DataType, DatasetMeta, ParameterDescriptor};
pub use reader::{decode_scalar, preview_indices, EventReader, PreviewSample, PREVIEW_CAP};
pub use spill::{parse_spillover, SPILLOVER_KEYS};
pub use text::{parse_text_segment, TextSegment};

/// A decoded file: keywords, metadata and a preview sample.
///
/// The raw bytes are not retained.
#[derive(Debug, Clone)]
pub struct FcsFile {
    pub header: FcsHeader,
    pub text: TextSegment,
    pub meta: DatasetMeta,
    pub preview: PreviewSample,
}

impl FcsFile {
    /// Reader over `bytes`, which must be the file this was decoded from.
    ///
    /// # Errors
    /// Returns [`Error::DataSegmentTooSmall`] if `bytes` is too short.
    pub fn reader<'a>(&'a self, bytes: &'a [u8]) -> Result<EventReader<'a>> {
        EventReader::new(bytes, &self.meta)
    }

    /// Embedded spillover block, `n_params²`, if the file carries one.
    #[must_use]
    pub fn spillover(&self) -> Option<&[f64]> {
        self.meta.spillover.as_deref()
    }
}

/// Decodes a whole file with the default preview size.
///
/// # Errors
/// Any decode error; a failed decode yields no partial result.
pub fn parse_fcs(bytes: &[u8]) -> Result<FcsFile> {
    parse_fcs_with_preview(bytes, PREVIEW_CAP)
}

/// Decodes a whole file, sampling at most `preview_cap` events.
///
/// # Errors
/// Any decode error; a failed decode yields no partial result.
pub fn parse_fcs_with_preview(bytes: &[u8], preview_cap: usize) -> Result<FcsFile> {
    let header = parse_header(bytes)?;
    let text = parse_text_segment(bytes, header.text_start, header.text_end)?;
    let meta = DatasetMeta::from_text(&header, &text, bytes.len())?;
    let preview = EventReader::new(bytes, &meta)?.read_preview(preview_cap);
    log::info!(
        "decoded {}: {} events, {} parameters, preview {}",
        meta.version,
        meta.n_events,
        meta.n_params(),
        preview.len()
    );
    Ok(FcsFile {
        header,
        text,
        meta,
        preview,
    })
}
