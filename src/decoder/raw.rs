//! Raw record file format.
//!
//! A raw file is a little-endian container written by the data sink:
//!
//! ```text
//! magic          [u8; 8]  "TBRAW001"
//! n_halves       u32
//! channels/half  u32
//! n_links        u32
//! n_events       u64
//! n_fields       u32
//! n_fields times:
//!   name_len     u16
//!   name         [u8; name_len]   UTF-8
//!   dtype        u8               1=u8 2=u16 3=u32 4=u64
//!   count        u64              number of elements
//!   payload      [u8; count * size_of(dtype)]
//! ```
//!
//! Files are read through a memory map. [`RawContainer`] only checks framing;
//! cardinality checks against the field table live in [`crate::decoder`].

use super::table::{ColumnData, DType};
use crate::error::{AppResult, DaqError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// File signature, including the format revision.
pub const RAW_MAGIC: [u8; 8] = *b"TBRAW001";

const HEADER_LEN: usize = 8 + 4 + 4 + 4 + 8 + 4;

/// Cardinality metadata carried by every raw file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMetadata {
    /// Number of ASIC halves
    pub n_halves: u32,
    /// Channels in each half
    pub channels_per_half: u32,
    /// Number of trigger links
    pub n_links: u32,
    /// Number of recorded events
    pub n_events: u64,
}

impl RawMetadata {
    /// Total channel count across halves.
    pub fn n_channels(&self) -> usize {
        self.n_halves as usize * self.channels_per_half as usize
    }
}

/// Parsed contents of one raw file.
#[derive(Debug, Clone, PartialEq)]
pub struct RawContainer {
    metadata: RawMetadata,
    fields: Vec<(String, ColumnData)>,
}

impl RawContainer {
    /// Memory-map and parse the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(DaqError::Decode(format!("{} is empty", path.display())));
        }
        // SAFETY: the sink has stopped before a run file is decoded, so the
        // file is not modified while mapped.
        let mmap = unsafe { Mmap::map(&file)? };
        Self::parse(&mmap)
    }

    /// Parse a raw file already in memory.
    pub fn parse(bytes: &[u8]) -> AppResult<Self> {
        let mut buf = bytes;
        ensure(buf, HEADER_LEN, "header")?;

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != RAW_MAGIC {
            return Err(DaqError::Decode(format!(
                "bad magic {:?}, expected {:?}",
                String::from_utf8_lossy(&magic),
                String::from_utf8_lossy(&RAW_MAGIC)
            )));
        }

        let metadata = RawMetadata {
            n_halves: buf.get_u32_le(),
            channels_per_half: buf.get_u32_le(),
            n_links: buf.get_u32_le(),
            n_events: buf.get_u64_le(),
        };
        let n_fields = buf.get_u32_le();

        let mut fields: Vec<(String, ColumnData)> = Vec::new();
        for _ in 0..n_fields {
            ensure(buf, 2, "field name length")?;
            let name_len = usize::from(buf.get_u16_le());
            ensure(buf, name_len, "field name")?;
            let name = std::str::from_utf8(&buf[..name_len])
                .map_err(|e| DaqError::Decode(format!("field name is not UTF-8: {e}")))?
                .to_owned();
            buf.advance(name_len);

            ensure(buf, 1 + 8, "field descriptor")?;
            let code = buf.get_u8();
            let dtype = DType::from_code(code)
                .ok_or_else(|| DaqError::Decode(format!("field '{name}': unknown dtype {code}")))?;
            let count = buf.get_u64_le();
            let payload_len = usize::try_from(count)
                .ok()
                .and_then(|c| c.checked_mul(dtype.size()))
                .ok_or_else(|| DaqError::Decode(format!("field '{name}': count {count} overflows")))?;
            ensure(buf, payload_len, &format!("payload of '{name}'"))?;

            let data = read_elements(dtype, &buf[..payload_len]);
            buf.advance(payload_len);

            if fields.iter().any(|(n, _)| *n == name) {
                return Err(DaqError::Decode(format!("field '{name}' appears twice")));
            }
            fields.push((name, data));
        }

        if buf.has_remaining() {
            return Err(DaqError::Decode(format!(
                "{} trailing bytes after last field",
                buf.remaining()
            )));
        }

        Ok(Self { metadata, fields })
    }

    /// Cardinality metadata.
    pub fn metadata(&self) -> &RawMetadata {
        &self.metadata
    }

    /// Flat buffer of field `name`.
    pub fn field(&self, name: &str) -> Option<&ColumnData> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    /// Field names in file order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }
}

/// Builds raw files in the format read by [`RawContainer`].
#[derive(Debug, Clone)]
pub struct RawWriter {
    metadata: RawMetadata,
    fields: Vec<(String, ColumnData)>,
}

impl RawWriter {
    /// Empty writer for a file with the given metadata.
    pub fn new(metadata: RawMetadata) -> Self {
        Self {
            metadata,
            fields: Vec::new(),
        }
    }

    /// Append a field buffer. Later fields with the same name replace earlier ones.
    pub fn field(mut self, name: impl Into<String>, data: ColumnData) -> Self {
        let name = name.into();
        self.fields.retain(|(n, _)| *n != name);
        self.fields.push((name, data));
        self
    }

    /// Serialize header and fields.
    pub fn to_bytes(&self) -> AppResult<Bytes> {
        let payload: usize = self
            .fields
            .iter()
            .map(|(n, d)| 2 + n.len() + 1 + 8 + d.len() * d.dtype().size())
            .sum();
        let mut out = BytesMut::with_capacity(HEADER_LEN + payload);

        out.put_slice(&RAW_MAGIC);
        out.put_u32_le(self.metadata.n_halves);
        out.put_u32_le(self.metadata.channels_per_half);
        out.put_u32_le(self.metadata.n_links);
        out.put_u64_le(self.metadata.n_events);
        out.put_u32_le(u32::try_from(self.fields.len()).map_err(|_| {
            DaqError::Decode(format!("too many fields: {}", self.fields.len()))
        })?);

        for (name, data) in &self.fields {
            let name_len = u16::try_from(name.len())
                .map_err(|_| DaqError::Decode(format!("field name too long: {name}")))?;
            out.put_u16_le(name_len);
            out.put_slice(name.as_bytes());
            out.put_u8(data.dtype().code());
            out.put_u64_le(data.len() as u64);
            write_elements(data, &mut out);
        }
        Ok(out.freeze())
    }

    /// Write the file to `path`, replacing any existing file.
    pub fn write_to(&self, path: impl AsRef<Path>) -> AppResult<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }
}

fn ensure(buf: &[u8], needed: usize, what: &str) -> AppResult<()> {
    if buf.len() < needed {
        return Err(DaqError::Decode(format!(
            "truncated {what}: need {needed} bytes, {} left",
            buf.len()
        )));
    }
    Ok(())
}

fn read_elements(dtype: DType, payload: &[u8]) -> ColumnData {
    match dtype {
        DType::U8 => ColumnData::U8(payload.to_vec()),
        DType::U16 => ColumnData::U16(
            payload
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        ),
        DType::U32 => ColumnData::U32(
            payload
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DType::U64 => ColumnData::U64(
            payload
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
    }
}

fn write_elements(data: &ColumnData, out: &mut BytesMut) {
    match data {
        ColumnData::U8(v) => out.put_slice(v),
        ColumnData::U16(v) => v.iter().for_each(|&x| out.put_u16_le(x)),
        ColumnData::U32(v) => v.iter().for_each(|&x| out.put_u32_le(x)),
        ColumnData::U64(v) => v.iter().for_each(|&x| out.put_u64_le(x)),
    }
}
