//! CSV export for savings reports and the schedule audit log.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::model::{BaselineMethod, SavingsReport};
use crate::scheduler::AuditEntry;

const REPORT_HEADER: &str = "facility_id,period_start,period_end,baseline_kwh,actual_kwh,\
                             kwh_saved,raw_delta_kwh,cost_saved,demand_charge_saved,\
                             peak_reduction_kw,baseline_peak_kw,actual_peak_kw,\
                             co2_avoided_kg,low_confidence,rate_fallback,baseline_method,\
                             degraded_schedules,generated_at";

const AUDIT_HEADER: &str = "at,facility_id,zone_id,schedule_id,from,to,detail";

/// Exports savings reports to a CSV file at the given path.
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_reports_csv(reports: &[SavingsReport], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    write_reports_csv(reports, io::BufWriter::new(file))
}

/// Writes savings reports as CSV to any writer, one row per report.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_reports_csv(reports: &[SavingsReport], writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    wtr.write_record(REPORT_HEADER.split(',').map(str::trim))?;

    for r in reports {
        let method = match r.baseline_method {
            BaselineMethod::ComparableDays => "comparable_days",
            BaselineMethod::FlatAverage => "flat_average",
        };
        wtr.write_record(&[
            r.facility_id.clone(),
            r.period_start.to_rfc3339(),
            r.period_end.to_rfc3339(),
            format!("{:.3}", r.baseline_kwh),
            format!("{:.3}", r.actual_kwh),
            format!("{:.3}", r.kwh_saved),
            format!("{:.3}", r.raw_delta_kwh),
            format!("{:.2}", r.cost_saved),
            format!("{:.2}", r.demand_charge_saved),
            format!("{:.3}", r.peak_reduction_kw),
            format!("{:.3}", r.baseline_peak_kw),
            format!("{:.3}", r.actual_peak_kw),
            format!("{:.3}", r.co2_avoided_kg),
            r.low_confidence.to_string(),
            r.rate_fallback.to_string(),
            method.to_string(),
            r.degraded_schedules.to_string(),
            r.generated_at.to_rfc3339(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Exports audit entries to a CSV file at the given path.
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_audit_csv(entries: &[AuditEntry], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    write_audit_csv(entries, io::BufWriter::new(file))
}

/// Writes audit entries as CSV. `from` is empty for creation entries.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_audit_csv(entries: &[AuditEntry], writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    wtr.write_record(AUDIT_HEADER.split(','))?;

    for e in entries {
        wtr.write_record(&[
            e.at.to_rfc3339(),
            e.facility_id.clone(),
            e.zone_id.clone(),
            e.schedule_id.to_string(),
            e.from.map(|s| s.to_string()).unwrap_or_default(),
            e.to.to_string(),
            e.detail.clone(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::model::ScheduleStatus;

    fn report() -> SavingsReport {
        let start = Utc.with_ymd_and_hms(2026, 6, 29, 0, 0, 0).unwrap();
        SavingsReport {
            facility_id: "greenhouse-1".to_string(),
            period_start: start,
            period_end: start + TimeDelta::days(1),
            baseline_kwh: 120.0,
            actual_kwh: 100.0,
            kwh_saved: 20.0,
            raw_delta_kwh: 20.0,
            cost_saved: 9.0,
            demand_charge_saved: 48.0,
            peak_reduction_kw: 4.0,
            baseline_peak_kw: 24.0,
            actual_peak_kw: 20.0,
            co2_avoided_kg: 8.0,
            low_confidence: false,
            rate_fallback: false,
            baseline_method: BaselineMethod::ComparableDays,
            degraded_schedules: 0,
            generated_at: start + TimeDelta::days(1),
        }
    }

    fn output(write: impl FnOnce(&mut Vec<u8>) -> io::Result<()>) -> String {
        let mut buf = Vec::new();
        write(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn report_row_has_every_column() {
        let out = output(|b| write_reports_csv(&[report()], b));
        let mut rdr = csv::ReaderBuilder::new().from_reader(out.as_bytes());
        assert_eq!(rdr.headers().unwrap().len(), 18);
        let row = rdr.records().next().unwrap().unwrap();
        assert_eq!(&row[5], "20.000");
        assert_eq!(&row[7], "9.00");
        assert_eq!(&row[14], "false");
        assert_eq!(&row[15], "comparable_days");
    }

    #[test]
    fn creation_entries_have_empty_from() {
        let entry = AuditEntry {
            at: Utc.with_ymd_and_hms(2026, 6, 29, 15, 0, 0).unwrap(),
            facility_id: "greenhouse-1".to_string(),
            zone_id: "flower-a".to_string(),
            schedule_id: Uuid::nil(),
            from: None,
            to: ScheduleStatus::Pending,
            detail: "created, manual".to_string(),
        };
        let out = output(|b| write_audit_csv(&[entry], b));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], AUDIT_HEADER);
        assert!(lines[1].contains(",,PENDING,"), "{}", lines[1]);
        assert!(lines[1].ends_with("\"created, manual\""));
    }
}
