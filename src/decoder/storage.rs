//! Arrow IPC persistence for decoded tables.
//!
//! One file per run. Only the public columns of a [`DecodedEvent`] are
//! written. Columns wider than one element become `FixedSizeList` columns so
//! the `(rows, width)` shape survives a round trip.

use super::table::{Column, ColumnData, DecodedEvent};
use crate::error::{AppResult, DaqError};
use arrow::array::{
    Array, ArrayRef, AsArray, FixedSizeListArray, UInt16Array, UInt32Array, UInt64Array,
    UInt8Array,
};
use arrow::buffer::NullBuffer;
use arrow::datatypes::{DataType, Field, Schema, UInt16Type, UInt32Type, UInt64Type, UInt8Type};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

const FORMAT_KEY: &str = "tileboard.format";
const FORMAT_VALUE: &str = "decoded-event/1";

/// Write the public columns of `table` to an Arrow IPC file at `path`.
#[instrument(skip(table, path), fields(path = %path.as_ref().display(), events = table.n_events()), err)]
pub fn save(table: &DecodedEvent, path: impl AsRef<Path>) -> AppResult<()> {
    let mut fields = Vec::with_capacity(table.columns().len());
    let mut arrays = Vec::with_capacity(table.columns().len());
    for (name, column) in table.columns() {
        let (field, array) = to_arrow(name, column, table.n_events())?;
        fields.push(field);
        arrays.push(array);
    }

    let metadata = HashMap::from([(FORMAT_KEY.to_string(), FORMAT_VALUE.to_string())]);
    let schema = Arc::new(Schema::new_with_metadata(fields, metadata));
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let file = File::create(path.as_ref())?;
    let mut writer = FileWriter::try_new(file, &schema)?;
    writer.write(&batch)?;
    writer.finish()?;

    info!("Saved {} events", table.n_events());
    Ok(())
}

/// Read a table written by [`save`].
#[instrument(skip(path), fields(path = %path.as_ref().display()), err)]
pub fn load(path: impl AsRef<Path>) -> AppResult<DecodedEvent> {
    let reader = open(path.as_ref(), None)?;
    let schema = reader.schema();

    let mut columns: Vec<Option<Column>> = vec![None; schema.fields().len()];
    let mut n_events = 0;
    for batch in reader {
        let batch = batch?;
        n_events += batch.num_rows();
        for (slot, array) in columns.iter_mut().zip(batch.columns()) {
            let chunk = from_arrow(array)?;
            match slot {
                Some(column) => append(column, chunk)?,
                None => *slot = Some(chunk),
            }
        }
    }

    let columns = schema
        .fields()
        .iter()
        .zip(columns)
        .map(|(field, column)| {
            let column = match column {
                Some(column) => column,
                None => empty_column(field.data_type())?,
            };
            Ok((field.name().clone(), column))
        })
        .collect::<AppResult<Vec<_>>>()?;

    debug!("Loaded {} columns", columns.len());
    DecodedEvent::new(n_events, columns)
}

/// Read one column of a saved table by name, without decoding the others.
#[instrument(skip(path), fields(path = %path.as_ref().display()), err)]
pub fn load_field(path: impl AsRef<Path>, name: &str) -> AppResult<Column> {
    let index = open(path.as_ref(), None)?
        .schema()
        .index_of(name)
        .map_err(|_| DaqError::Decode(format!("no field '{name}' in saved table")))?;

    let reader = open(path.as_ref(), Some(vec![index]))?;
    let field_type = reader.schema().field(0).data_type().clone();
    let mut column: Option<Column> = None;
    for batch in reader {
        let chunk = from_arrow(batch?.column(0))?;
        match column.as_mut() {
            Some(existing) => append(existing, chunk)?,
            None => column = Some(chunk),
        }
    }
    match column {
        Some(column) => Ok(column),
        None => empty_column(&field_type),
    }
}

fn open(path: &Path, projection: Option<Vec<usize>>) -> AppResult<FileReader<File>> {
    let reader = FileReader::try_new(File::open(path)?, projection)?;
    match reader.schema().metadata().get(FORMAT_KEY).map(String::as_str) {
        Some(FORMAT_VALUE) => Ok(reader),
        other => Err(DaqError::Decode(format!(
            "{} is not a decoded-event table (format {:?})",
            path.display(),
            other
        ))),
    }
}

fn to_arrow(name: &str, column: &Column, rows: usize) -> AppResult<(Field, ArrayRef)> {
    let (item_type, values): (DataType, ArrayRef) = match column.data() {
        ColumnData::U8(v) => (DataType::UInt8, Arc::new(UInt8Array::from(v.clone()))),
        ColumnData::U16(v) => (DataType::UInt16, Arc::new(UInt16Array::from(v.clone()))),
        ColumnData::U32(v) => (DataType::UInt32, Arc::new(UInt32Array::from(v.clone()))),
        ColumnData::U64(v) => (DataType::UInt64, Arc::new(UInt64Array::from(v.clone()))),
    };

    if column.width() == 1 {
        return Ok((Field::new(name, item_type, false), values));
    }

    let width = i32::try_from(column.width())
        .map_err(|_| DaqError::Decode(format!("column '{name}' is too wide")))?;
    let item = Arc::new(Field::new("item", item_type, false));
    // A zero-width list cannot infer its length from the values.
    let nulls = (width == 0).then(|| NullBuffer::new_valid(rows));
    let list = FixedSizeListArray::try_new(item.clone(), width, values, nulls)?;
    Ok((
        Field::new(name, DataType::FixedSizeList(item, width), false),
        Arc::new(list),
    ))
}

fn from_arrow(array: &ArrayRef) -> AppResult<Column> {
    match array.data_type() {
        DataType::FixedSizeList(_, width) => {
            let list = array
                .as_fixed_size_list_opt()
                .ok_or_else(|| DaqError::Decode("malformed list column".into()))?;
            let width = usize::try_from(*width)
                .map_err(|_| DaqError::Decode(format!("negative list width {width}")))?;
            Column::new(width, values_of(list.values().as_ref())?)
        }
        _ => Column::new(1, values_of(array.as_ref())?),
    }
}

fn values_of(array: &dyn Array) -> AppResult<ColumnData> {
    let unsupported = || DaqError::Decode(format!("unsupported column type {}", array.data_type()));
    Ok(match array.data_type() {
        DataType::UInt8 => ColumnData::U8(
            array
                .as_primitive_opt::<UInt8Type>()
                .ok_or_else(unsupported)?
                .values()
                .to_vec(),
        ),
        DataType::UInt16 => ColumnData::U16(
            array
                .as_primitive_opt::<UInt16Type>()
                .ok_or_else(unsupported)?
                .values()
                .to_vec(),
        ),
        DataType::UInt32 => ColumnData::U32(
            array
                .as_primitive_opt::<UInt32Type>()
                .ok_or_else(unsupported)?
                .values()
                .to_vec(),
        ),
        DataType::UInt64 => ColumnData::U64(
            array
                .as_primitive_opt::<UInt64Type>()
                .ok_or_else(unsupported)?
                .values()
                .to_vec(),
        ),
        _ => return Err(unsupported()),
    })
}

fn append(column: &mut Column, chunk: Column) -> AppResult<()> {
    if column.width() != chunk.width() {
        return Err(DaqError::Decode(format!(
            "batch width {} differs from {}",
            chunk.width(),
            column.width()
        )));
    }
    let width = column.width();
    let mut data = column.data().clone();
    data.extend_from(chunk.data().clone())?;
    *column = Column::new(width, data)?;
    Ok(())
}

/// Column with no rows, for files whose table had no batches.
fn empty_column(data_type: &DataType) -> AppResult<Column> {
    let (width, item) = match data_type {
        DataType::FixedSizeList(item, width) => (
            usize::try_from(*width).map_err(|_| DaqError::Decode("negative list width".into()))?,
            item.data_type(),
        ),
        other => (1, other),
    };
    let data = match item {
        DataType::UInt8 => ColumnData::U8(Vec::new()),
        DataType::UInt16 => ColumnData::U16(Vec::new()),
        DataType::UInt32 => ColumnData::U32(Vec::new()),
        DataType::UInt64 => ColumnData::U64(Vec::new()),
        other => return Err(DaqError::Decode(format!("unsupported column type {other}"))),
    };
    Column::new(width, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> DecodedEvent {
        DecodedEvent::new(
            3,
            vec![
                (
                    "event".into(),
                    Column::new(1, ColumnData::U32(vec![10, 11, 12])).unwrap(),
                ),
                (
                    "adc".into(),
                    Column::new(2, ColumnData::U16(vec![1, 2, 3, 4, 5, 6])).unwrap(),
                ),
                (
                    "totflag".into(),
                    Column::new(2, ColumnData::U8(vec![0, 1, 0, 1, 0, 1])).unwrap(),
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn round_trip_preserves_public_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.arrow");
        let original = table();

        save(&original, &path).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded, original);
        assert_eq!(
            loaded.field_names().collect::<Vec<_>>(),
            vec!["event", "adc", "totflag"]
        );
    }

    #[test]
    fn load_field_projects_one_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.arrow");
        save(&table(), &path).unwrap();

        let adc = load_field(&path, "adc").unwrap();
        assert_eq!(adc.width(), 2);
        assert_eq!(adc.row(2), Some(vec![5, 6]));

        let err = load_field(&path, "missing").unwrap_err();
        assert!(err.to_string().contains("missing"), "{err}");
    }

    #[test]
    fn foreign_arrow_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.arrow");
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::UInt8, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(UInt8Array::from(vec![1u8])) as ArrayRef],
        )
        .unwrap();
        let mut writer = FileWriter::try_new(File::create(&path).unwrap(), &schema).unwrap();
        writer.write(&batch).unwrap();
        writer.finish().unwrap();

        assert!(matches!(load(&path), Err(DaqError::Decode(_))));
    }
}
