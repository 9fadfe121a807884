//! Raw record decoding.
//!
//! [`decode`] opens a raw file and validates every buffer against the field
//! table in [`FIELDS`]. [`to_table`] reshapes the buffers into a
//! [`DecodedEvent`] and derives the per-channel views:
//!
//! - `channel`: raw channel index unfolded across halves,
//!   `raw + half * (max_raw + 1)`
//! - `channel_type`: [`ChannelType`] of the raw channel index
//! - `corruption`, `bxcounter`, `eventcounter`, `orbitcounter`: per-half
//!   counters broadcast to every channel of that half
//!
//! Cardinalities come from the file's own metadata, never from constants.

pub mod raw;
pub mod storage;
pub mod table;

pub use raw::{RawContainer, RawMetadata, RawWriter, RAW_MAGIC};
pub use storage::{load, load_field, save};
pub use table::{ChannelType, Column, ColumnData, DType, DecodedEvent, CALIBRATION_CHANNEL};

use crate::error::{AppResult, DaqError};
use std::path::Path;
use tracing::{debug, instrument, warn};

/// Number of elements a field carries per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// One value per event
    Scalar,
    /// One value per ASIC half
    PerHalf,
    /// One value per channel across all halves
    PerChannel,
    /// One value per trigger link
    PerLink,
}

impl Cardinality {
    /// Elements per event under `metadata`.
    pub fn width(self, metadata: &RawMetadata) -> usize {
        match self {
            Cardinality::Scalar => 1,
            Cardinality::PerHalf => metadata.n_halves as usize,
            Cardinality::PerChannel => metadata.n_channels(),
            Cardinality::PerLink => metadata.n_links as usize,
        }
    }
}

/// Whether a field appears in the public table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Stored under its own name
    Public,
    /// Stored as `_name`, exposed through a derived column
    Internal,
}

/// One entry of the raw field table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name in the raw file
    pub name: &'static str,
    /// Elements per event
    pub cardinality: Cardinality,
    /// Element type
    pub dtype: DType,
    /// Public or internal
    pub visibility: Visibility,
}

const fn field(
    name: &'static str,
    cardinality: Cardinality,
    dtype: DType,
    visibility: Visibility,
) -> FieldSpec {
    FieldSpec {
        name,
        cardinality,
        dtype,
        visibility,
    }
}

use Cardinality::{PerChannel, PerHalf, PerLink, Scalar};
use Visibility::{Internal, Public};

/// Every field a raw record file must carry.
pub const FIELDS: &[FieldSpec] = &[
    field("event", Scalar, DType::U32, Public),
    field("chip", Scalar, DType::U16, Public),
    field("trigtime", Scalar, DType::U32, Public),
    field("trigwidth", Scalar, DType::U32, Public),
    field("half", PerChannel, DType::U8, Public),
    field("channel", PerChannel, DType::U16, Internal),
    field("adc", PerChannel, DType::U16, Public),
    field("adcm", PerChannel, DType::U16, Public),
    field("toa", PerChannel, DType::U16, Public),
    field("tot", PerChannel, DType::U16, Public),
    field("totflag", PerChannel, DType::U8, Public),
    field("corruption", PerHalf, DType::U8, Internal),
    field("bxcounter", PerHalf, DType::U16, Internal),
    field("eventcounter", PerHalf, DType::U8, Internal),
    field("orbitcounter", PerHalf, DType::U8, Internal),
    field("trigsum", PerLink, DType::U32, Public),
];

/// Per-half fields broadcast to channels in the public table.
const PER_HALF_VIEWS: [&str; 4] = ["corruption", "bxcounter", "eventcounter", "orbitcounter"];

/// Look up a field in [`FIELDS`].
pub fn field_spec(name: &str) -> Option<&'static FieldSpec> {
    FIELDS.iter().find(|f| f.name == name)
}

/// Open and validate the raw file at `path`.
///
/// Every field in [`FIELDS`] must be present with its declared type and
/// exactly `n_events * cardinality` elements.
#[instrument(skip(path), fields(path = %path.as_ref().display()), err)]
pub fn decode(path: impl AsRef<Path>) -> AppResult<RawContainer> {
    let container = RawContainer::open(path)?;
    validate(&container)?;
    debug!(
        events = container.metadata().n_events,
        halves = container.metadata().n_halves,
        channels_per_half = container.metadata().channels_per_half,
        "Decoded raw file"
    );
    Ok(container)
}

/// Check a container against [`FIELDS`].
pub fn validate(container: &RawContainer) -> AppResult<()> {
    let metadata = container.metadata();
    let n_events = usize::try_from(metadata.n_events)
        .map_err(|_| DaqError::Decode(format!("event count {} too large", metadata.n_events)))?;

    for spec in FIELDS {
        let data = container
            .field(spec.name)
            .ok_or_else(|| DaqError::Decode(format!("missing field '{}'", spec.name)))?;
        if data.dtype() != spec.dtype {
            return Err(DaqError::Decode(format!(
                "field '{}' is {:?}, expected {:?}",
                spec.name,
                data.dtype(),
                spec.dtype
            )));
        }
        let expected = n_events
            .checked_mul(spec.cardinality.width(metadata))
            .ok_or_else(|| DaqError::Decode(format!("field '{}' size overflows", spec.name)))?;
        if data.len() != expected {
            return Err(DaqError::Decode(format!(
                "field '{}' has {} elements, metadata implies {} ({} events x {:?})",
                spec.name,
                data.len(),
                expected,
                n_events,
                spec.cardinality
            )));
        }
    }

    for name in container.field_names() {
        if field_spec(name).is_none() {
            warn!("Ignoring unknown raw field '{}'", name);
        }
    }
    Ok(())
}

/// Unfolded channel index: `raw + half * (max_raw + 1)`.
pub fn unfold_channel(half: u64, raw_channel: u64, max_raw_channel: u64) -> u64 {
    raw_channel + half * (max_raw_channel + 1)
}

/// Reshape a validated container into a [`DecodedEvent`].
pub fn to_table(container: &RawContainer) -> AppResult<DecodedEvent> {
    validate(container)?;
    let metadata = container.metadata();
    let n_events = metadata.n_events as usize;
    let n_halves = metadata.n_halves as usize;

    let mut public = Vec::with_capacity(FIELDS.len() + 2 + PER_HALF_VIEWS.len());
    let mut internal = Vec::new();
    for spec in FIELDS {
        let data = container
            .field(spec.name)
            .ok_or_else(|| DaqError::Decode(format!("missing field '{}'", spec.name)))?;
        let column = Column::new(spec.cardinality.width(metadata), data.clone())?;
        match spec.visibility {
            Visibility::Public => public.push((spec.name.to_string(), column)),
            Visibility::Internal => internal.push((format!("_{}", spec.name), column)),
        }
    }

    let find = |columns: &[(String, Column)], name: &str| -> AppResult<Column> {
        columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c.clone())
            .ok_or_else(|| DaqError::Decode(format!("missing column '{name}'")))
    };
    let half = find(public.as_slice(), "half")?;
    let raw_channel = find(internal.as_slice(), "_channel")?;
    let n_channels = half.width();

    // Flat index of the per-half value owning each channel slot.
    let mut owner = Vec::with_capacity(half.data().len());
    for row in 0..n_events {
        for slot in 0..n_channels {
            let h = half.get(row, slot).unwrap_or_default() as usize;
            if h >= n_halves {
                return Err(DaqError::Decode(format!(
                    "event {row} channel slot {slot}: half index {h} out of range for {n_halves} halves"
                )));
            }
            owner.push(row * n_halves + h);
        }
    }

    let max_raw = raw_channel.data().max().unwrap_or(0);
    let mut unfolded = Vec::with_capacity(owner.len());
    let mut types = Vec::with_capacity(owner.len());
    for i in 0..owner.len() {
        let raw = raw_channel.data().get(i).unwrap_or_default();
        let h = half.data().get(i).unwrap_or_default();
        let channel = u32::try_from(unfold_channel(h, raw, max_raw))
            .map_err(|_| DaqError::Decode(format!("unfolded channel of slot {i} overflows")))?;
        unfolded.push(channel);
        types.push(ChannelType::from_raw(raw).code());
    }
    public.push((
        "channel".to_string(),
        Column::new(n_channels, ColumnData::U32(unfolded))?,
    ));
    public.push((
        "channel_type".to_string(),
        Column::new(n_channels, ColumnData::U8(types))?,
    ));

    for name in PER_HALF_VIEWS {
        let per_half = find(internal.as_slice(), &format!("_{name}"))?;
        public.push((
            name.to_string(),
            Column::new(n_channels, per_half.data().gather(&owner))?,
        ));
    }

    DecodedEvent::with_internal(n_events, public, internal)
}

/// [`decode`] followed by [`to_table`].
pub fn decode_file(path: impl AsRef<Path>) -> AppResult<DecodedEvent> {
    to_table(&decode(path)?)
}
