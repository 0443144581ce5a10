//! CSV import of meter readings and export of savings reports and the audit log.

pub mod export;
pub mod readings;

pub use export::{export_audit_csv, export_reports_csv, write_audit_csv, write_reports_csv};
pub use readings::{ReadingsError, import_readings_csv, read_readings_csv};
