//! Export of a stored capture as a polars [`DataFrame`].

use crate::sample_store::SampleStore;
use polars::prelude::*;
use std::path::Path;

pub const TIME_COLUMN_NAME: &str = "time";
const ROW_INDEX_COLUMN_NAME: &str = "row_index";

/// Column name of a probe's values.
pub fn channel_column_name(probe: u16) -> String {
    format!("ch{probe}")
}

/// One row per stored sample: a `time` column in seconds from the oldest
/// sample followed by one `u64` column per enabled probe.
pub fn to_frame(store: &SampleStore, sample_rate: u64) -> Result<DataFrame, PolarsError> {
    #[cfg(feature = "cpu-profiling")]
    let _zone = tracy_client::span!("capture_frame::to_frame");

    let view = store.view();
    let Some(channels) = view.channels() else {
        return Ok(DataFrame::empty());
    };
    let count = view.logical_count();

    let names: Vec<String> = channels
        .probes()
        .iter()
        .map(|&probe| channel_column_name(probe))
        .collect();
    let columns = names
        .iter()
        .enumerate()
        .map(|(channel, name)| {
            let values: Vec<u64> = (0..count).map(|i| view.value(i, channel)).collect();
            Series::new(name.as_str().into(), values).into()
        })
        .collect::<Vec<Column>>();
    drop(view);

    let mut selection = vec![col(TIME_COLUMN_NAME)];
    selection.extend(names.iter().map(|name| col(name.as_str())));

    DataFrame::new(columns)?
        .lazy()
        .with_row_index(ROW_INDEX_COLUMN_NAME, Some(0))
        .with_columns([(col(ROW_INDEX_COLUMN_NAME).cast(DataType::Float64)
            * lit(1.0 / sample_rate.max(1) as f64))
        .alias(TIME_COLUMN_NAME)])
        .select(selection)
        .collect()
}

/// Split the low `bits` bits of a value column into boolean columns named
/// `<column>_bit<n>`.
pub fn extract_bits<'a>(
    df: &'a mut DataFrame,
    column: &str,
    bits: u32,
) -> Result<&'a DataFrame, PolarsError> {
    let values = df.column(column)?.u64()?.clone();

    let mut bit_columns: Vec<Vec<bool>> = vec![Vec::with_capacity(values.len()); bits as usize];
    for value in &values {
        let value = value.unwrap_or_default();
        for (bit, column) in bit_columns.iter_mut().enumerate() {
            column.push((value >> bit) & 1 == 1);
        }
    }

    for (bit, values) in bit_columns.into_iter().enumerate() {
        let bit_column: Column = Series::new(format!("{column}_bit{bit}").into(), values).into();
        df.with_column(bit_column)?;
    }
    Ok(df)
}

pub fn write_csv(df: &mut DataFrame, path: impl AsRef<Path>) -> Result<(), PolarsError> {
    let mut file = std::fs::File::create(path)?;
    CsvWriter::new(&mut file).finish(df)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition_config::ChannelSet;

    fn store() -> SampleStore {
        let store = SampleStore::new();
        store
            .allocate(8, &ChannelSet::new(vec![0, 3], 8))
            .unwrap();
        store.append(&[1, 0xA0, 2, 0xA1, 3, 0xA2], 1);
        store
    }

    #[test]
    fn test_frame_has_time_and_channel_columns() {
        let df = to_frame(&store(), 4).unwrap();
        assert_eq!(df.height(), 3);
        let names: Vec<&str> = df.get_column_names().iter().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["time", "ch0", "ch3"]);

        let time = df.column(TIME_COLUMN_NAME).unwrap().f64().unwrap();
        assert_eq!(time.get(0), Some(0.0));
        assert_eq!(time.get(2), Some(0.5));
        let ch3 = df.column("ch3").unwrap().u64().unwrap();
        assert_eq!(ch3.get(1), Some(0xA1));
    }

    #[test]
    fn test_extract_bits() {
        let mut df = to_frame(&store(), 1).unwrap();
        let df = extract_bits(&mut df, "ch0", 2).unwrap();
        assert_eq!(df.width(), 5);
        let bit0 = df.column("ch0_bit0").unwrap().bool().unwrap();
        let bit1 = df.column("ch0_bit1").unwrap().bool().unwrap();
        assert_eq!(bit0.get(0), Some(true));
        assert_eq!(bit1.get(0), Some(false));
        assert_eq!(bit1.get(2), Some(true));
    }

    #[test]
    fn test_unallocated_store_gives_empty_frame() {
        let df = to_frame(&SampleStore::new(), 1_000).unwrap();
        assert_eq!(df.height(), 0);
        assert_eq!(df.width(), 0);
    }
}
