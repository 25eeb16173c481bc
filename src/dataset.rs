use csv::{ReaderBuilder, Trim};
use serde_json::Value;

use state_store::DatasetAnalysis;

use crate::{LuantraError, LuantraResult};

/// Format label for a supported upload, judged by file extension.
pub fn detect_format(file_name: &str) -> LuantraResult<&'static str> {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "csv" => Ok("csv"),
        "json" => Ok("json"),
        "xlsx" | "xls" => Ok("xlsx"),
        _ => Err(LuantraError::InvalidDataset(format!(
            "{} is not a CSV, JSON or Excel file",
            file_name
        ))),
    }
}

/// Best-effort header sniff. Never fails: unreadable content yields no columns.
pub fn analyze(format: &str, bytes: &[u8]) -> DatasetAnalysis {
    let (columns, row_count) = match format {
        "csv" => sniff_csv(bytes),
        "json" => sniff_json(bytes),
        _ => (Vec::new(), None),
    };
    DatasetAnalysis {
        format: format.to_string(),
        columns,
        row_count,
    }
}

fn sniff_csv(bytes: &[u8]) -> (Vec<String>, Option<usize>) {
    let bytes = bytes.strip_prefix("\u{feff}".as_bytes()).unwrap_or(bytes);
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(bytes);

    let columns = match reader.headers() {
        Ok(headers) => headers
            .iter()
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect(),
        Err(e) => {
            tracing::debug!("Could not read CSV header: {}", e);
            return (Vec::new(), None);
        }
    };
    let rows = reader
        .records()
        .filter_map(Result::ok)
        .filter(|r| r.iter().any(|field| !field.is_empty()))
        .count();
    (columns, Some(rows))
}

fn sniff_json(bytes: &[u8]) -> (Vec<String>, Option<usize>) {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Array(rows)) => {
            let columns = rows
                .first()
                .and_then(|r| r.as_object())
                .map(|o| o.keys().cloned().collect())
                .unwrap_or_default();
            (columns, Some(rows.len()))
        }
        Ok(Value::Object(row)) => (row.keys().cloned().collect(), Some(1)),
        _ => (Vec::new(), None),
    }
}
