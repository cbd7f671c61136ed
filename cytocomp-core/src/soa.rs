//! Structure of Arrays (`SoA`) storage for per-channel event values.
//!
//! `ChannelTable` keeps one dense column per channel rather than one record
//! per event. Density scans and gate checks walk a handful of columns over
//! millions of events, which this layout keeps cache friendly.

use serde::{Deserialize, Serialize};

/// Read access to one event's values by channel index.
pub trait RawEvent {
    /// Value of `channel` for this event.
    fn raw(&self, channel: usize) -> f64;
}

impl RawEvent for [f64] {
    #[inline]
    fn raw(&self, channel: usize) -> f64 {
        self[channel]
    }
}

impl RawEvent for [f32] {
    #[inline]
    fn raw(&self, channel: usize) -> f64 {
        f64::from(self[channel])
    }
}

/// Per-channel columns of equal length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelTable {
    columns: Vec<Vec<f32>>,
    len: usize,
}

impl ChannelTable {
    /// Creates an empty table with `n_channels` columns, each with `capacity`.
    #[must_use]
    pub fn with_capacity(n_channels: usize, capacity: usize) -> Self {
        Self {
            columns: (0..n_channels).map(|_| Vec::with_capacity(capacity)).collect(),
            len: 0,
        }
    }

    /// Creates a table of `n_events` zeroed rows.
    #[must_use]
    pub fn zeroed(n_channels: usize, n_events: usize) -> Self {
        Self {
            columns: vec![vec![0.0; n_events]; n_channels],
            len: n_events,
        }
    }

    /// Builds a table from existing columns.
    ///
    /// # Panics
    /// Panics if the columns differ in length.
    #[must_use]
    pub fn from_columns(columns: Vec<Vec<f32>>) -> Self {
        let len = columns.first().map_or(0, Vec::len);
        assert!(
            columns.iter().all(|c| c.len() == len),
            "channel columns must have equal length"
        );
        Self { columns, len }
    }

    /// Number of events (rows).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of channels (columns).
    #[must_use]
    pub fn n_channels(&self) -> usize {
        self.columns.len()
    }

    /// Column for `channel`, if it exists.
    #[must_use]
    pub fn column(&self, channel: usize) -> Option<&[f32]> {
        self.columns.get(channel).map(Vec::as_slice)
    }

    /// All columns in channel order.
    #[must_use]
    pub fn columns(&self) -> &[Vec<f32>] {
        &self.columns
    }

    /// Mutable column access for in-place fills.
    pub fn column_mut(&mut self, channel: usize) -> Option<&mut [f32]> {
        self.columns.get_mut(channel).map(Vec::as_mut_slice)
    }

    /// Appends one event.
    ///
    /// # Panics
    /// Panics if `values` does not have one entry per channel.
    pub fn push_event(&mut self, values: &[f32]) {
        assert_eq!(values.len(), self.columns.len(), "one value per channel");
        for (column, &v) in self.columns.iter_mut().zip(values) {
            column.push(v);
        }
        self.len += 1;
    }

    /// Borrowed view of a single event.
    #[must_use]
    pub fn event(&self, index: usize) -> EventView<'_> {
        EventView { table: self, index }
    }

    /// Clears all columns, keeping the channel count.
    pub fn clear(&mut self) {
        for column in &mut self.columns {
            column.clear();
        }
        self.len = 0;
    }
}

/// One row of a [`ChannelTable`].
#[derive(Clone, Copy)]
pub struct EventView<'a> {
    table: &'a ChannelTable,
    index: usize,
}

impl EventView<'_> {
    /// Row index within the table.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl RawEvent for EventView<'_> {
    #[inline]
    fn raw(&self, channel: usize) -> f64 {
        f64::from(self.table.columns[channel][self.index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_table_operations() {
        let mut table = ChannelTable::with_capacity(2, 4);
        assert!(table.is_empty());
        assert_eq!(table.n_channels(), 2);

        table.push_event(&[1000.0, 2000.0]);
        table.push_event(&[1500.0, 2500.0]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.column(0).unwrap(), &[1000.0, 1500.0]);
        assert_eq!(table.column(1).unwrap(), &[2000.0, 2500.0]);
        assert!(table.column(2).is_none());

        let ev = table.event(1);
        assert_eq!(ev.index(), 1);
        assert_eq!(ev.raw(1), 2500.0);

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.n_channels(), 2);
    }

    #[test]
    fn test_zeroed_and_from_columns() {
        let mut table = ChannelTable::zeroed(3, 5);
        assert_eq!(table.len(), 5);
        table.column_mut(2).unwrap()[4] = 7.5;
        assert_eq!(table.event(4).raw(2), 7.5);

        let table = ChannelTable::from_columns(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(table.len(), 2);
        assert_eq!([1.0f32, 3.0].as_slice().raw(1), 3.0);
    }
}
