//! Columnar representation of decoded events.

use crate::error::{AppResult, DaqError};
use std::collections::HashSet;

/// Raw channel index of the calibration channel in each half.
pub const CALIBRATION_CHANNEL: u64 = 36;

/// Element type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// Unsigned 8-bit
    U8,
    /// Unsigned 16-bit
    U16,
    /// Unsigned 32-bit
    U32,
    /// Unsigned 64-bit
    U64,
}

impl DType {
    /// Type code used in the raw record format.
    pub fn code(self) -> u8 {
        match self {
            DType::U8 => 1,
            DType::U16 => 2,
            DType::U32 => 3,
            DType::U64 => 4,
        }
    }

    /// Inverse of [`DType::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DType::U8),
            2 => Some(DType::U16),
            3 => Some(DType::U32),
            4 => Some(DType::U64),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U16 => 2,
            DType::U32 => 4,
            DType::U64 => 8,
        }
    }
}

/// Flat, typed element buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnData {
    /// `u8` elements
    U8(Vec<u8>),
    /// `u16` elements
    U16(Vec<u16>),
    /// `u32` elements
    U32(Vec<u32>),
    /// `u64` elements
    U64(Vec<u64>),
}

impl ColumnData {
    /// Element type.
    pub fn dtype(&self) -> DType {
        match self {
            ColumnData::U8(_) => DType::U8,
            ColumnData::U16(_) => DType::U16,
            ColumnData::U32(_) => DType::U32,
            ColumnData::U64(_) => DType::U64,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            ColumnData::U8(v) => v.len(),
            ColumnData::U16(v) => v.len(),
            ColumnData::U32(v) => v.len(),
            ColumnData::U64(v) => v.len(),
        }
    }

    /// True when there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `index` widened to `u64`.
    pub fn get(&self, index: usize) -> Option<u64> {
        match self {
            ColumnData::U8(v) => v.get(index).map(|&x| u64::from(x)),
            ColumnData::U16(v) => v.get(index).map(|&x| u64::from(x)),
            ColumnData::U32(v) => v.get(index).map(|&x| u64::from(x)),
            ColumnData::U64(v) => v.get(index).copied(),
        }
    }

    /// Largest element.
    pub fn max(&self) -> Option<u64> {
        match self {
            ColumnData::U8(v) => v.iter().max().map(|&x| u64::from(x)),
            ColumnData::U16(v) => v.iter().max().map(|&x| u64::from(x)),
            ColumnData::U32(v) => v.iter().max().map(|&x| u64::from(x)),
            ColumnData::U64(v) => v.iter().max().copied(),
        }
    }

    /// New buffer holding `self[i]` for every `i` in `indices`.
    ///
    /// Indices must be in range; callers validate them first.
    pub(crate) fn gather(&self, indices: &[usize]) -> ColumnData {
        match self {
            ColumnData::U8(v) => ColumnData::U8(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::U16(v) => ColumnData::U16(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::U32(v) => ColumnData::U32(indices.iter().map(|&i| v[i]).collect()),
            ColumnData::U64(v) => ColumnData::U64(indices.iter().map(|&i| v[i]).collect()),
        }
    }

    /// Append `other`, which must have the same element type.
    pub(crate) fn extend_from(&mut self, other: ColumnData) -> AppResult<()> {
        match (self, other) {
            (ColumnData::U8(a), ColumnData::U8(b)) => a.extend(b),
            (ColumnData::U16(a), ColumnData::U16(b)) => a.extend(b),
            (ColumnData::U32(a), ColumnData::U32(b)) => a.extend(b),
            (ColumnData::U64(a), ColumnData::U64(b)) => a.extend(b),
            (a, b) => {
                return Err(DaqError::Decode(format!(
                    "cannot append {:?} elements to a {:?} column",
                    b.dtype(),
                    a.dtype()
                )))
            }
        }
        Ok(())
    }
}

/// A column reshaped to `(rows, width)`, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    width: usize,
    data: ColumnData,
}

impl Column {
    /// Wrap `data` as rows of `width` elements.
    pub fn new(width: usize, data: ColumnData) -> AppResult<Self> {
        let divisible = match width {
            0 => data.is_empty(),
            w => data.len() % w == 0,
        };
        if !divisible {
            return Err(DaqError::Decode(format!(
                "{} elements do not split into rows of {}",
                data.len(),
                width
            )));
        }
        Ok(Self { width, data })
    }

    /// Elements per row.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of rows. A zero-width column has no intrinsic row count and
    /// reports `None`.
    pub fn rows(&self) -> Option<usize> {
        (self.width > 0).then(|| self.data.len() / self.width)
    }

    /// Flat row-major elements.
    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    /// Element `(row, index)`.
    pub fn get(&self, row: usize, index: usize) -> Option<u64> {
        if index >= self.width {
            return None;
        }
        self.data.get(row * self.width + index)
    }

    /// One row widened to `u64`.
    pub fn row(&self, row: usize) -> Option<Vec<u64>> {
        (0..self.width).map(|i| self.get(row, i)).collect()
    }
}

/// Role of a channel, derived from its raw per-half index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    /// Signal channel
    Normal,
    /// Calibration injection channel (raw index 36)
    Calibration,
    /// Common-mode channel (raw index above 36)
    CommonMode,
}

impl ChannelType {
    /// Classify a raw (not unfolded) channel index.
    pub fn from_raw(raw_channel: u64) -> Self {
        match raw_channel {
            CALIBRATION_CHANNEL => ChannelType::Calibration,
            c if c > CALIBRATION_CHANNEL => ChannelType::CommonMode,
            _ => ChannelType::Normal,
        }
    }

    /// Code stored in the `channel_type` column.
    pub fn code(self) -> u8 {
        match self {
            ChannelType::Normal => 0,
            ChannelType::Calibration => 1,
            ChannelType::CommonMode => 2,
        }
    }

    /// Inverse of [`ChannelType::code`].
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(ChannelType::Normal),
            1 => Some(ChannelType::Calibration),
            2 => Some(ChannelType::CommonMode),
            _ => None,
        }
    }
}

/// Decoded events: one row per event, one named column per field.
///
/// Public columns are what [`crate::decoder::storage::save`] persists and
/// what equality compares. Internal columns (raw channel index, per-half
/// counters) are kept under a leading-underscore name for diagnostics.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    n_events: usize,
    columns: Vec<(String, Column)>,
    internal: Vec<(String, Column)>,
}

impl DecodedEvent {
    /// Build a table from public columns, checking that every column has
    /// `n_events` rows and that names are unique.
    pub fn new(n_events: usize, columns: Vec<(String, Column)>) -> AppResult<Self> {
        Self::with_internal(n_events, columns, Vec::new())
    }

    pub(crate) fn with_internal(
        n_events: usize,
        columns: Vec<(String, Column)>,
        internal: Vec<(String, Column)>,
    ) -> AppResult<Self> {
        let mut seen = HashSet::new();
        for (name, column) in columns.iter().chain(internal.iter()) {
            if !seen.insert(name.as_str()) {
                return Err(DaqError::Decode(format!("duplicate column '{name}'")));
            }
            if let Some(rows) = column.rows() {
                if rows != n_events {
                    return Err(DaqError::Decode(format!(
                        "column '{name}' has {rows} rows, expected {n_events}"
                    )));
                }
            }
        }
        Ok(Self {
            n_events,
            columns,
            internal,
        })
    }

    /// Number of events (rows).
    pub fn n_events(&self) -> usize {
        self.n_events
    }

    /// True when there are no events.
    pub fn is_empty(&self) -> bool {
        self.n_events == 0
    }

    /// Public column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    /// Internal column by its private (underscore-prefixed) name.
    pub fn internal_column(&self, name: &str) -> Option<&Column> {
        self.internal
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    /// Public columns in table order.
    pub fn columns(&self) -> &[(String, Column)] {
        &self.columns
    }

    /// Public field names in table order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Channel roles of one event, from the `channel_type` column.
    pub fn channel_types(&self, row: usize) -> Option<Vec<ChannelType>> {
        self.column("channel_type")?
            .row(row)?
            .into_iter()
            .map(ChannelType::from_code)
            .collect()
    }
}

impl PartialEq for DecodedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.n_events == other.n_events && self.columns == other.columns
    }
}
