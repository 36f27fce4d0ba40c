//! Reading import from CSV and JSON Lines files.
//!
//! Both formats carry the same two fields:
//! - `timestamp` (RFC3339)
//! - `value` (milliliters since the previous reading)

use crate::readings::types::Reading;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Supported reading file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Csv,
    JsonLines,
}

impl InputFormat {
    /// Guess the format from a file extension, defaulting to CSV.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("jsonl") | Some("ndjson") | Some("json") => InputFormat::JsonLines,
            _ => InputFormat::Csv,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Some(InputFormat::Csv),
            "jsonl" | "ndjson" | "json" => Some(InputFormat::JsonLines),
            _ => None,
        }
    }
}

/// Errors raised while reading an input file.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid CSV record at line {line}: {message}")]
    Csv { line: u64, message: String },
    #[error("invalid JSON at line {line}: {message}")]
    Json { line: usize, message: String },
}

/// Parse a reading from a single JSON line.
pub fn parse_json_line(line: &str) -> Result<Reading, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Read all readings from CSV data with a `timestamp,value` header.
pub fn read_csv<R: Read>(input: R) -> Result<Vec<Reading>, InputError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(input);
    let mut readings = Vec::new();

    for record in reader.deserialize::<Reading>() {
        let reading = record.map_err(|e| InputError::Csv {
            line: e.position().map(|p| p.line()).unwrap_or(0),
            message: e.to_string(),
        })?;
        readings.push(reading);
    }

    Ok(readings)
}

/// Read all readings from JSON Lines data, skipping blank lines.
pub fn read_json_lines<R: Read>(input: R) -> Result<Vec<Reading>, InputError> {
    let mut readings = Vec::new();

    for (idx, line) in BufReader::new(input).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reading = parse_json_line(&line).map_err(|e| InputError::Json {
            line: idx + 1,
            message: e.to_string(),
        })?;
        readings.push(reading);
    }

    Ok(readings)
}

/// Read a reading file in the given format.
pub fn read_file(path: &Path, format: InputFormat) -> Result<Vec<Reading>, InputError> {
    let file = std::fs::File::open(path)?;
    match format {
        InputFormat::Csv => read_csv(file),
        InputFormat::JsonLines => read_json_lines(file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_csv() {
        let data = "timestamp,value\n\
                    2024-03-01T07:00:00Z,0\n\
                    2024-03-01T07:01:00Z, 500\n";
        let readings = read_csv(data.as_bytes()).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].value, 500);
    }

    #[test]
    fn test_read_csv_rejects_negative_volume() {
        let data = "timestamp,value\n2024-03-01T07:00:00Z,-5\n";
        assert!(matches!(
            read_csv(data.as_bytes()),
            Err(InputError::Csv { .. })
        ));
    }

    #[test]
    fn test_read_json_lines_skips_blank_lines() {
        let data = "{\"timestamp\":\"2024-03-01T07:00:00Z\",\"value\":120}\n\n\
                    {\"timestamp\":\"2024-03-01T07:01:00Z\",\"value\":80}\n";
        let readings = read_json_lines(data.as_bytes()).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].value, 120);
    }

    #[test]
    fn test_json_error_reports_line() {
        let data = "{\"timestamp\":\"2024-03-01T07:00:00Z\",\"value\":1}\nnot json\n";
        match read_json_lines(data.as_bytes()) {
            Err(InputError::Json { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(InputFormat::from_path(Path::new("a.jsonl")), InputFormat::JsonLines);
        assert_eq!(InputFormat::from_path(Path::new("a.csv")), InputFormat::Csv);
        assert_eq!(InputFormat::parse("JSONL"), Some(InputFormat::JsonLines));
        assert_eq!(InputFormat::parse("xml"), None);
    }
}
