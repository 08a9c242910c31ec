use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{Array, Float32Array, Float64Array, Int32Array, Int64Array};
use arrow::datatypes::DataType;
use log::{debug, info, warn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::{ConditionType, Tube, Value};
use crate::experiment::Experiment;

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load one tube's event table.  Dispatch by extension.
///
/// Supported formats:
/// * `.parquet` – one numeric column per channel
/// * `.json`    – `[{ "FSC-A": 1.0, ... }, ...]` or `{ "FSC-A": [...], ... }`
/// * `.csv`     – header row of channel names, one event per row
pub fn load_tube(path: &Path, id: &str) -> Result<Tube> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let columns = match ext.as_str() {
        "parquet" | "pq" => load_parquet(path),
        "json" => load_json(path),
        "csv" => load_csv(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
    .with_context(|| format!("loading events from {}", path.display()))?;

    let tube = Tube::new(id, columns)?;
    debug!("loaded tube '{id}': {} events, {} channels", tube.len(), tube.channels().len());
    Ok(tube)
}

/// Build an [`Experiment`] from a setup file.
///
/// Layout (comma or tab delimited, sniffed from the first line):
///
/// ```text
/// filename      Dox    Strain
/// string        float  string
/// a3.csv        10.0   RFP
/// a4.csv        1.0    CFP
/// ```
///
/// Row 1 names the conditions (first cell `filename`), row 2 declares their
/// types (its first cell is ignored), and each following row is one sample.
/// Relative filenames resolve against the setup file's directory; the tube
/// id is the file stem.
pub fn load_setup(path: &Path) -> Result<Experiment> {
    let text = std::fs::read_to_string(path).context("reading setup file")?;
    let first_line = text.lines().next().unwrap_or("");
    let delimiter = if first_line.contains('\t') { b'\t' } else { b',' };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let rows: Vec<csv::StringRecord> = reader
        .records()
        .collect::<std::result::Result<_, _>>()
        .context("parsing setup file")?;

    if rows.len() < 2 {
        bail!("Setup file needs a header row and a type row");
    }
    let header = &rows[0];
    if !header
        .get(0)
        .is_some_and(|h| h.trim().eq_ignore_ascii_case("filename"))
    {
        bail!("First setup column must be 'filename'");
    }

    let names: Vec<String> = header.iter().skip(1).map(|h| h.trim().to_string()).collect();
    let types: Vec<ConditionType> = (1..=names.len())
        .map(|i| {
            rows[1]
                .get(i)
                .with_context(|| format!("missing type for condition '{}'", names[i - 1]))?
                .parse::<ConditionType>()
                .map_err(anyhow::Error::from)
        })
        .collect::<Result<_>>()?;

    let mut experiment = Experiment::new();
    experiment.add_conditions(names.iter().cloned().zip(types.iter().copied()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for (row_no, sample) in rows.iter().enumerate().skip(2) {
        let file = sample
            .get(0)
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .with_context(|| format!("setup row {}: missing filename", row_no + 1))?;
        let file_path = base.join(file);
        let id = file_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file)
            .to_string();

        let mut values = BTreeMap::new();
        for (i, (name, ty)) in names.iter().zip(&types).enumerate() {
            let raw = sample
                .get(i + 1)
                .with_context(|| format!("setup row {}: missing '{name}'", row_no + 1))?;
            let value = ty
                .parse_value(raw)
                .with_context(|| format!("setup row {}, condition '{name}'", row_no + 1))?;
            values.insert(name.clone(), value);
        }

        debug!("sample '{id}': {}", describe(&values));
        let tube = load_tube(&file_path, &id)?;
        experiment
            .add_tube(tube, &values)
            .with_context(|| format!("adding tube '{id}'"))?;
    }

    info!(
        "loaded {} tubes ({} events) from {}",
        experiment.tube_ids().len(),
        experiment.len(),
        path.display()
    );
    Ok(experiment)
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Accepts records (`df.to_json(orient='records')`) or a column object
/// (`orient='list'`). Channels come out in key order.
fn load_json(path: &Path) -> Result<Vec<(String, Vec<f64>)>> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    match root {
        JsonValue::Array(records) => {
            let mut columns: BTreeMap<String, Vec<f64>> = BTreeMap::new();
            for (i, rec) in records.iter().enumerate() {
                let obj = rec
                    .as_object()
                    .with_context(|| format!("Row {i} is not a JSON object"))?;
                if i > 0 && obj.len() != columns.len() {
                    bail!("Row {i} has {} fields, expected {}", obj.len(), columns.len());
                }
                for (key, val) in obj {
                    if i > 0 && !columns.contains_key(key) {
                        bail!("Row {i}: unexpected channel '{key}'");
                    }
                    let v = json_number(val).with_context(|| format!("Row {i}, '{key}'"))?;
                    columns.entry(key.clone()).or_default().push(v);
                }
            }
            Ok(columns.into_iter().collect())
        }
        JsonValue::Object(obj) => obj
            .into_iter()
            .map(|(key, val)| {
                let arr = val
                    .as_array()
                    .with_context(|| format!("'{key}' is not an array"))?;
                let values = arr
                    .iter()
                    .enumerate()
                    .map(|(j, v)| json_number(v).with_context(|| format!("{key}[{j}]")))
                    .collect::<Result<Vec<f64>>>()?;
                Ok((key, values))
            })
            .collect(),
        _ => bail!("Expected a JSON array of records or an object of columns"),
    }
}

fn json_number(val: &JsonValue) -> Result<f64> {
    match val {
        JsonValue::Null => Ok(f64::NAN),
        other => other.as_f64().context("not a number"),
    }
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

/// CSV layout: header row with channel names, then one event per row.
/// Empty cells become NaN.
fn load_csv(path: &Path) -> Result<Vec<(String, Vec<f64>)>> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); headers.len()];
    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        for (col_idx, cell) in record.iter().enumerate() {
            let cell = cell.trim();
            let value = if cell.is_empty() {
                f64::NAN
            } else {
                cell.parse::<f64>().with_context(|| {
                    format!("Row {row_no}, {}: '{cell}' is not a number", headers[col_idx])
                })?
            };
            columns[col_idx].push(value);
        }
    }

    Ok(headers.into_iter().zip(columns).collect())
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet file of events. Every numeric column (Float64, Float32,
/// Int64, Int32) becomes a channel; other columns are skipped.
fn load_parquet(path: &Path) -> Result<Vec<(String, Vec<f64>)>> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut names: Vec<String> = Vec::new();
    let mut columns: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for (batch_no, batch_result) in reader.enumerate() {
        let batch = batch_result.context("reading parquet record batch")?;
        let schema = batch.schema();

        for (idx, field) in schema.fields().iter().enumerate() {
            let Some(values) = extract_f64_column(batch.column(idx)) else {
                if batch_no == 0 {
                    warn!(
                        "skipping non-numeric column '{}' ({:?})",
                        field.name(),
                        field.data_type()
                    );
                }
                continue;
            };
            if !columns.contains_key(field.name()) {
                names.push(field.name().clone());
            }
            columns.entry(field.name().clone()).or_default().extend(values);
        }
    }

    Ok(names
        .into_iter()
        .map(|name| {
            let values = columns.remove(&name).unwrap_or_default();
            (name, values)
        })
        .collect())
}

// -- Arrow helpers --

/// Convert a numeric Arrow column to `f64`, nulls as NaN.
fn extract_f64_column(col: &Arc<dyn Array>) -> Option<Vec<f64>> {
    let values = match col.data_type() {
        DataType::Float64 => {
            let arr = col.as_any().downcast_ref::<Float64Array>()?;
            arr.iter().map(|v| v.unwrap_or(f64::NAN)).collect()
        }
        DataType::Float32 => {
            let arr = col.as_any().downcast_ref::<Float32Array>()?;
            arr.iter().map(|v| v.map(f64::from).unwrap_or(f64::NAN)).collect()
        }
        DataType::Int64 => {
            let arr = col.as_any().downcast_ref::<Int64Array>()?;
            arr.iter().map(|v| v.map(|i| i as f64).unwrap_or(f64::NAN)).collect()
        }
        DataType::Int32 => {
            let arr = col.as_any().downcast_ref::<Int32Array>()?;
            arr.iter().map(|v| v.map(f64::from).unwrap_or(f64::NAN)).collect()
        }
        _ => return None,
    };
    Some(values)
}

fn describe(values: &BTreeMap<String, Value>) -> String {
    values
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;

    use super::*;

    #[test]
    fn csv_tube_keeps_header_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a3.csv");
        fs::write(&path, "Y2-A,B1-A\n1.5,2\n3,\n").unwrap();

        let tube = load_tube(&path, "a3").unwrap();
        assert_eq!(tube.channels(), ["Y2-A", "B1-A"]);
        assert_eq!(tube.column("Y2-A").unwrap(), &[1.5, 3.0]);
        assert!(tube.column("B1-A").unwrap()[1].is_nan());
    }

    #[test]
    fn json_records_and_columns_agree() {
        let dir = tempfile::tempdir().unwrap();
        let records = dir.path().join("r.json");
        let columns = dir.path().join("c.json");
        fs::write(&records, r#"[{"FSC": 1, "SSC": 2.5}, {"FSC": 3, "SSC": 4}]"#).unwrap();
        fs::write(&columns, r#"{"FSC": [1, 3], "SSC": [2.5, 4]}"#).unwrap();

        let a = load_tube(&records, "t").unwrap();
        let b = load_tube(&columns, "t").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn json_records_must_share_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"[{"FSC": 1}, {"SSC": 2}]"#).unwrap();
        assert!(load_tube(&path, "t").is_err());
    }

    #[test]
    fn parquet_numeric_columns_become_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.parquet");
        let schema = Arc::new(Schema::new(vec![
            Field::new("Y2-A", DataType::Float64, true),
            Field::new("Count", DataType::Int32, false),
            Field::new("Label", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Float64Array::from(vec![Some(1.0), None])),
                Arc::new(Int32Array::from(vec![7, 8])),
                Arc::new(arrow::array::StringArray::from(vec!["x", "y"])),
            ],
        )
        .unwrap();
        let mut writer = ArrowWriter::try_new(fs::File::create(&path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let tube = load_tube(&path, "p").unwrap();
        assert_eq!(tube.channels(), ["Y2-A", "Count"]);
        assert_eq!(tube.column("Count").unwrap(), &[7.0, 8.0]);
        assert!(tube.column("Y2-A").unwrap()[1].is_nan());
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        assert!(load_tube(Path::new("sample.fcs"), "x").is_err());
    }

    #[test]
    fn setup_file_builds_experiment() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a3.csv"), "Y2-A\n1\n2\n").unwrap();
        fs::write(dir.path().join("a4.csv"), "Y2-A\n3\n").unwrap();
        let setup = dir.path().join("setup.txt");
        fs::write(
            &setup,
            "filename\tDox\tStrain\nstring\tfloat\tstring\na3.csv\t10\tRFP\na4.csv\t1.0\tCFP\n",
        )
        .unwrap();

        let ex = load_setup(&setup).unwrap();
        assert_eq!(ex.len(), 3);
        assert_eq!(ex.tube_ids(), ["a3", "a4"]);
        assert_eq!(ex.conditions()["Dox"], ConditionType::Float);
        assert_eq!(ex.data().value(2, "Strain"), Some(Value::from("CFP")));
        assert_eq!(ex.data().value(0, "Dox"), Some(Value::Float(10.0)));
    }

    #[test]
    fn setup_file_requires_filename_column() {
        let dir = tempfile::tempdir().unwrap();
        let setup = dir.path().join("setup.csv");
        fs::write(&setup, "file,Dox\nstring,float\n").unwrap();
        assert!(load_setup(&setup).is_err());
    }

    #[test]
    fn setup_values_must_parse_as_declared_type() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "Y2-A\n1\n").unwrap();
        let setup = dir.path().join("setup.csv");
        fs::write(&setup, "filename,Dox\nstring,float\na.csv,lots\n").unwrap();
        assert!(load_setup(&setup).is_err());
    }
}
