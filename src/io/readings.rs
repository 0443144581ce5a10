//! Meter reading import.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::model::EnergyReading;

#[derive(Debug, Error)]
pub enum ReadingsError {
    #[error("cannot open readings file: {0}")]
    Io(#[from] io::Error),
    #[error("malformed readings CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("row {row}: {message}")]
    Invalid { row: usize, message: String },
}

/// Column layout: `facility_id,zone_id,timestamp,power_kw,cumulative_kwh,cost`.
/// An empty `zone_id` marks the facility main meter; `cost` may be omitted.
#[derive(Debug, Deserialize)]
struct ReadingRow {
    facility_id: String,
    #[serde(default)]
    zone_id: Option<String>,
    timestamp: DateTime<Utc>,
    power_kw: f64,
    cumulative_kwh: f64,
    #[serde(default)]
    cost: Option<f64>,
}

impl ReadingRow {
    fn into_reading(self, row: usize) -> Result<EnergyReading, ReadingsError> {
        let invalid = |message: &str| ReadingsError::Invalid {
            row,
            message: message.to_string(),
        };
        if self.facility_id.trim().is_empty() {
            return Err(invalid("facility_id is empty"));
        }
        if !(self.power_kw.is_finite() && self.power_kw >= 0.0) {
            return Err(invalid("power_kw must be a finite, non-negative number"));
        }
        if !self.cumulative_kwh.is_finite() {
            return Err(invalid("cumulative_kwh must be finite"));
        }
        Ok(EnergyReading {
            facility_id: self.facility_id,
            zone_id: self.zone_id.filter(|z| !z.trim().is_empty()),
            timestamp: self.timestamp,
            power_kw: self.power_kw,
            cumulative_kwh: self.cumulative_kwh,
            cost: self.cost.unwrap_or(0.0),
        })
    }
}

/// Reads meter readings from a CSV file.
///
/// # Errors
///
/// Returns a `ReadingsError` if the file cannot be opened, a row does not
/// parse, or a value is out of range. Row numbers count the header as row 1.
pub fn import_readings_csv(path: &Path) -> Result<Vec<EnergyReading>, ReadingsError> {
    let file = File::open(path)?;
    read_readings_csv(io::BufReader::new(file))
}

/// Reads meter readings as CSV from any reader.
///
/// # Errors
///
/// See [`import_readings_csv`].
pub fn read_readings_csv(reader: impl Read) -> Result<Vec<EnergyReading>, ReadingsError> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut out = Vec::new();
    for (i, row) in rdr.deserialize::<ReadingRow>().enumerate() {
        out.push(row?.into_reading(i + 2)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = "\
facility_id,zone_id,timestamp,power_kw,cumulative_kwh,cost
greenhouse-1,,2026-06-01T16:00:00Z,24.0,0.0,
greenhouse-1,flower-a,2026-06-01T17:00:00Z,20.5,24.0,10.8
";

    #[test]
    fn empty_zone_is_main_meter() {
        let readings = read_readings_csv(SAMPLE.as_bytes()).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].zone_id, None);
        assert_eq!(readings[0].cost, 0.0);
        assert_eq!(readings[1].zone_id.as_deref(), Some("flower-a"));
        assert_eq!(readings[1].cost, 10.8);
    }

    #[test]
    fn negative_power_names_the_row() {
        let csv = "facility_id,zone_id,timestamp,power_kw,cumulative_kwh,cost\n\
                   f,,2026-06-01T16:00:00Z,1.0,0.0,\n\
                   f,,2026-06-01T17:00:00Z,-3.0,1.0,\n";
        let err = read_readings_csv(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, ReadingsError::Invalid { row: 3, .. }), "{err}");
    }

    #[test]
    fn bad_timestamp_is_a_csv_error() {
        let csv = "facility_id,zone_id,timestamp,power_kw,cumulative_kwh,cost\n\
                   f,,yesterday,1.0,0.0,\n";
        assert!(matches!(
            read_readings_csv(csv.as_bytes()),
            Err(ReadingsError::Csv(_))
        ));
    }

    #[test]
    fn imports_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let readings = import_readings_csv(file.path()).unwrap();
        assert_eq!(readings[1].power_kw, 20.5);
    }
}
