//! Event record reader over the DATA segment.
//!
//! Events are fixed-width records laid out back to back; each record holds
//! one value per parameter in column order, with per-parameter byte widths.

use crate::meta::{required_data_bytes, ByteOrder, DataType, DatasetMeta};
use crate::{Error, Result};
use cytocomp_core::ChannelTable;

/// Largest number of events kept in a preview sample.
pub const PREVIEW_CAP: usize = 10_000;

/// Evenly spaced, non-decreasing event indices: `min(n - 1, floor(i * n / preview_n))`.
///
/// Every index is returned when `preview_n >= n_events`.
#[must_use]
pub fn preview_indices(n_events: usize, preview_n: usize) -> Vec<usize> {
    if preview_n >= n_events {
        return (0..n_events).collect();
    }
    let n = n_events as u128;
    let k = preview_n as u128;
    (0..preview_n)
        .map(|i| {
            #[allow(clippy::cast_possible_truncation)]
            let idx = ((i as u128 * n) / k) as usize;
            idx.min(n_events - 1)
        })
        .collect()
}

fn array<const N: usize>(raw: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&raw[..N]);
    out
}

/// Decodes one value of `raw.len()` bytes.
///
/// Integers are unsigned; 1, 2 and 4 byte widths are read, anything wider
/// reads its first 4 bytes.
#[must_use]
pub fn decode_scalar(raw: &[u8], data_type: DataType, order: ByteOrder) -> f64 {
    let le = order.is_little_endian();
    match data_type {
        DataType::Float32 => {
            let a = array::<4>(raw);
            f64::from(if le { f32::from_le_bytes(a) } else { f32::from_be_bytes(a) })
        }
        DataType::Float64 => {
            let a = array::<8>(raw);
            if le {
                f64::from_le_bytes(a)
            } else {
                f64::from_be_bytes(a)
            }
        }
        DataType::Integer => match raw.len() {
            1 => f64::from(raw[0]),
            2 => {
                let a = array::<2>(raw);
                f64::from(if le { u16::from_le_bytes(a) } else { u16::from_be_bytes(a) })
            }
            _ => {
                let a = array::<4>(raw);
                f64::from(if le { u32::from_le_bytes(a) } else { u32::from_be_bytes(a) })
            }
        },
    }
}

/// Subsampled events plus the source indices they came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviewSample {
    pub indices: Vec<usize>,
    pub table: ChannelTable,
}

impl PreviewSample {
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Random access to event records of a decoded file.
pub struct EventReader<'a> {
    data: &'a [u8],
    meta: &'a DatasetMeta,
    offsets: Vec<usize>,
    stride: usize,
}

impl<'a> EventReader<'a> {
    /// Binds `meta` to the file bytes it was decoded from.
    ///
    /// # Errors
    /// Returns [`Error::DataSegmentTooSmall`] if `bytes` does not hold
    /// `n_events` full records starting at the DATA offset.
    pub fn new(bytes: &'a [u8], meta: &'a DatasetMeta) -> Result<Self> {
        let stride = meta.bytes_per_event();
        let required = required_data_bytes(stride, meta.n_events);
        let too_small = || Error::DataSegmentTooSmall {
            required,
            actual: meta.available_data_bytes(bytes.len()),
        };
        let start = usize::try_from(*meta.data_range.start()).map_err(|_| too_small())?;
        let len = usize::try_from(required).map_err(|_| too_small())?;
        let data = start
            .checked_add(len)
            .and_then(|end| bytes.get(start..end))
            .ok_or_else(too_small)?;

        let offsets = meta
            .params
            .iter()
            .scan(0, |acc, p| {
                let at = *acc;
                *acc += p.byte_width;
                Some(at)
            })
            .collect();

        Ok(Self {
            data,
            meta,
            offsets,
            stride,
        })
    }

    #[must_use]
    pub fn meta(&self) -> &DatasetMeta {
        self.meta
    }

    #[must_use]
    pub fn n_events(&self) -> usize {
        self.meta.n_events
    }

    #[must_use]
    pub fn n_params(&self) -> usize {
        self.offsets.len()
    }

    /// Value of parameter `param` for event `event`.
    ///
    /// # Panics
    /// Panics if either index is out of range.
    #[must_use]
    pub fn value(&self, event: usize, param: usize) -> f64 {
        let width = self.meta.params[param].byte_width;
        let at = event * self.stride + self.offsets[param];
        decode_scalar(
            &self.data[at..at + width],
            self.meta.data_type,
            self.meta.byte_order,
        )
    }

    /// Decodes every parameter of `event` into `out`.
    ///
    /// # Panics
    /// Panics if `event` is out of range or `out` is shorter than the parameter count.
    pub fn read_event_into(&self, event: usize, out: &mut [f64]) {
        let record = &self.data[event * self.stride..(event + 1) * self.stride];
        for ((slot, &offset), p) in out.iter_mut().zip(&self.offsets).zip(&self.meta.params) {
            *slot = decode_scalar(
                &record[offset..offset + p.byte_width],
                self.meta.data_type,
                self.meta.byte_order,
            );
        }
    }

    /// Reads at most `cap` evenly spaced events.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_preview(&self, cap: usize) -> PreviewSample {
        let indices = preview_indices(self.n_events(), cap.min(self.n_events()));
        let mut table = ChannelTable::with_capacity(self.n_params(), indices.len());
        let mut raw = vec![0.0f64; self.n_params()];
        let mut row = vec![0.0f32; self.n_params()];
        for &i in &indices {
            self.read_event_into(i, &mut raw);
            for (dst, &src) in row.iter_mut().zip(&raw) {
                *dst = src as f32;
            }
            table.push_event(&row);
        }
        log::debug!(
            "preview: {} of {} events sampled",
            indices.len(),
            self.n_events()
        );
        PreviewSample { indices, table }
    }

    /// Reads every event, uncorrected.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_all(&self) -> ChannelTable {
        let mut table = ChannelTable::zeroed(self.n_params(), self.n_events());
        let mut raw = vec![0.0f64; self.n_params()];
        for i in 0..self.n_events() {
            self.read_event_into(i, &mut raw);
            for (p, &v) in raw.iter().enumerate() {
                if let Some(column) = table.column_mut(p) {
                    column[i] = v as f32;
                }
            }
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_indices_cover_small_sets() {
        assert_eq!(preview_indices(5, 10), vec![0, 1, 2, 3, 4]);
        assert_eq!(preview_indices(0, 0), Vec::<usize>::new());
    }

    #[test]
    fn test_preview_indices_are_spread() {
        let idx = preview_indices(100, 4);
        assert_eq!(idx, vec![0, 25, 50, 75]);
        let idx = preview_indices(10, 3);
        assert_eq!(idx, vec![0, 3, 6]);
        let idx = preview_indices(1_000_003, PREVIEW_CAP);
        assert_eq!(idx.len(), PREVIEW_CAP);
        assert!(idx.windows(2).all(|w| w[0] <= w[1]));
        assert!(*idx.last().unwrap() < 1_000_003);
    }

    #[test]
    fn test_decode_scalar_widths_and_order() {
        let le = ByteOrder::LittleEndian;
        let be = ByteOrder::BigEndian;
        assert_eq!(decode_scalar(&[7], DataType::Integer, be), 7.0);
        assert_eq!(decode_scalar(&[0xE8, 0x03], DataType::Integer, le), 1000.0);
        assert_eq!(decode_scalar(&[0x03, 0xE8], DataType::Integer, be), 1000.0);
        assert_eq!(
            decode_scalar(&70_000u32.to_be_bytes(), DataType::Integer, be),
            70_000.0
        );
        assert_eq!(
            decode_scalar(&1.5f32.to_le_bytes(), DataType::Float32, le),
            1.5
        );
        assert_eq!(
            decode_scalar(&(-2.25f64).to_be_bytes(), DataType::Float64, be),
            -2.25
        );
    }

    #[test]
    fn test_reader_rejects_overflowing_event_count() {
        let meta = DatasetMeta {
            version: "FCS3.1".into(),
            n_events: usize::MAX,
            params: vec![crate::ParameterDescriptor {
                index: 0,
                label: "P1".into(),
                name: None,
                stain: None,
                bit_width: Some(16),
                range: None,
                byte_width: 2,
            }],
            data_type: DataType::Integer,
            byte_order: ByteOrder::LittleEndian,
            data_range: 0..=3,
            spillover: None,
        };
        match EventReader::new(&[0u8; 4], &meta) {
            Err(Error::DataSegmentTooSmall { required, actual }) => {
                assert_eq!(required, u64::MAX);
                assert_eq!(actual, 4);
            }
            other => panic!("unexpected {:?}", other.map(|r| r.n_events())),
        }
    }
}
