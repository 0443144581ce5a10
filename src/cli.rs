use std::env;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};

/// Days of synthetic history generated when no readings file is given.
pub const DEFAULT_SYNTHETIC_DAYS: u32 = 28;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Clone, PartialEq)]
pub struct ReportArgs {
    pub facility_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub out: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CliOptions {
    pub config: Option<PathBuf>,
    pub inventory: Option<PathBuf>,
    pub readings: Option<PathBuf>,
    pub synthetic_days: u32,
    pub seed: u64,
    pub port: Option<u16>,
    pub serve: bool,
    pub report: Option<ReportArgs>,
    pub audit_out: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(CliOptions),
    Help,
}

pub fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = env::args().skip(1).collect();
    parse_args_from(&args)
}

/// Accepts RFC 3339 timestamps or plain dates (midnight UTC).
fn parse_instant(flag: &str, raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
        .ok_or_else(|| {
            format!("{flag} value \"{raw}\" is not an RFC 3339 timestamp or YYYY-MM-DD date")
        })
}

fn set_once<T>(slot: &mut Option<T>, value: T, flag: &str) -> Result<(), String> {
    if slot.replace(value).is_some() {
        return Err(format!("{flag} provided more than once"));
    }
    Ok(())
}

pub fn parse_args_from(args: &[String]) -> Result<Command, String> {
    let mut i = 0usize;
    let mut config = None;
    let mut inventory = None;
    let mut readings = None;
    let mut synthetic_days = None;
    let mut seed = None;
    let mut port = None;
    let mut serve = false;
    let mut report_facility = None;
    let mut from = None;
    let mut to = None;
    let mut report_out = None;
    let mut audit_out = None;

    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = |expected: &str| -> Result<String, String> {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("missing value for {flag} (expected {expected})"))
        };
        match flag {
            "--help" | "-h" => return Ok(Command::Help),
            "--config" => set_once(&mut config, PathBuf::from(value("a TOML file path")?), flag)?,
            "--inventory" => {
                set_once(&mut inventory, PathBuf::from(value("a TOML file path")?), flag)?;
            }
            "--readings" => {
                set_once(&mut readings, PathBuf::from(value("a CSV file path")?), flag)?;
            }
            "--synthetic-days" => {
                let raw = value("a number of days")?;
                let days = raw
                    .parse::<u32>()
                    .map_err(|_| format!("--synthetic-days value \"{raw}\" is not a valid u32"))?;
                set_once(&mut synthetic_days, days, flag)?;
            }
            "--seed" => {
                let raw = value("a u64")?;
                let s = raw
                    .parse::<u64>()
                    .map_err(|_| format!("--seed value \"{raw}\" is not a valid u64"))?;
                set_once(&mut seed, s, flag)?;
            }
            "--port" => {
                let raw = value("a u16")?;
                let p = raw
                    .parse::<u16>()
                    .map_err(|_| format!("--port value \"{raw}\" is not a valid u16"))?;
                set_once(&mut port, p, flag)?;
            }
            "--serve" => serve = true,
            "--report" => set_once(&mut report_facility, value("a facility id")?, flag)?,
            "--from" => {
                let raw = value("a timestamp")?;
                set_once(&mut from, parse_instant(flag, &raw)?, flag)?;
            }
            "--to" => {
                let raw = value("a timestamp")?;
                set_once(&mut to, parse_instant(flag, &raw)?, flag)?;
            }
            "--report-out" => {
                set_once(&mut report_out, PathBuf::from(value("a CSV file path")?), flag)?;
            }
            "--audit-out" => {
                set_once(&mut audit_out, PathBuf::from(value("a CSV file path")?), flag)?;
            }
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    if readings.is_some() && synthetic_days.is_some() {
        return Err(
            "arguments `--readings` and `--synthetic-days` are mutually exclusive; choose one source"
                .to_string(),
        );
    }

    let report = match (report_facility, from, to) {
        (Some(facility_id), Some(from), Some(to)) => {
            if from >= to {
                return Err("--from must be before --to".to_string());
            }
            Some(ReportArgs {
                facility_id,
                from,
                to,
                out: report_out,
            })
        }
        (Some(_), _, _) => return Err("--report requires both --from and --to".to_string()),
        (None, None, None) if report_out.is_none() => None,
        _ => return Err("--from, --to and --report-out need --report".to_string()),
    };

    Ok(Command::Run(CliOptions {
        config,
        inventory,
        readings,
        synthetic_days: synthetic_days.unwrap_or(DEFAULT_SYNTHETIC_DAYS),
        seed: seed.unwrap_or(DEFAULT_SEED),
        port,
        serve,
        report,
        audit_out,
    }))
}

pub fn print_usage() {
    eprintln!("canopy-dr: energy optimization and demand-response control for grow facilities");
    eprintln!();
    eprintln!("Usage: canopy-dr [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>           Service configuration (TOML)");
    eprintln!("  --inventory <path>        Site inventory (TOML); built-in demo site if omitted");
    eprintln!("  --readings <path>         Import meter readings from CSV");
    eprintln!(
        "  --synthetic-days <n>      Generate n days of synthetic history (default: {DEFAULT_SYNTHETIC_DAYS})"
    );
    eprintln!("  --seed <u64>              Seed for synthetic history (default: {DEFAULT_SEED})");
    eprintln!("  --serve                   Start the HTTP API");
    eprintln!("  --port <u16>              Override server.port");
    eprintln!("  --report <facility>       Generate a savings report (needs --from and --to)");
    eprintln!("  --from <time>             Report period start (RFC 3339 or YYYY-MM-DD)");
    eprintln!("  --to <time>               Report period end (exclusive)");
    eprintln!("  --report-out <path>       Export the report to CSV");
    eprintln!("  --audit-out <path>        Export the schedule audit log to CSV");
    eprintln!("  --help                    Show this help message");
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    fn run(raw: &[&str]) -> CliOptions {
        match parse_args_from(&args(raw)) {
            Ok(Command::Run(opts)) => opts,
            other => panic!("expected options, got {other:?}"),
        }
    }

    #[test]
    fn defaults_to_synthetic_demo() {
        let opts = run(&[]);
        assert_eq!(opts.synthetic_days, DEFAULT_SYNTHETIC_DAYS);
        assert_eq!(opts.seed, DEFAULT_SEED);
        assert!(!opts.serve);
        assert!(opts.report.is_none());
    }

    #[test]
    fn parses_report_with_dates_and_timestamps() {
        let opts = run(&[
            "--report",
            "greenhouse-1",
            "--from",
            "2026-06-29",
            "--to",
            "2026-06-30T00:00:00+02:00",
            "--report-out",
            "out.csv",
        ]);
        let report = opts.report.unwrap();
        assert_eq!(report.facility_id, "greenhouse-1");
        assert_eq!(report.from, Utc.with_ymd_and_hms(2026, 6, 29, 0, 0, 0).unwrap());
        assert_eq!(report.to, Utc.with_ymd_and_hms(2026, 6, 29, 22, 0, 0).unwrap());
        assert_eq!(report.out.as_deref().and_then(|p| p.to_str()), Some("out.csv"));
    }

    #[test]
    fn report_needs_a_period() {
        let err = parse_args_from(&args(&["--report", "f1", "--from", "2026-06-29"])).unwrap_err();
        assert!(err.contains("--to"));
    }

    #[test]
    fn readings_and_synthetic_are_exclusive() {
        let err = parse_args_from(&args(&["--readings", "r.csv", "--synthetic-days", "3"]))
            .unwrap_err();
        assert!(err.contains("mutually exclusive"));
    }

    #[test]
    fn rejects_bad_values_and_repeats() {
        assert!(parse_args_from(&args(&["--port", "99999"])).is_err());
        assert!(parse_args_from(&args(&["--seed", "1", "--seed", "2"])).is_err());
        assert!(parse_args_from(&args(&["--verbose"])).is_err());
        assert_eq!(parse_args_from(&args(&["--serve", "-h"])), Ok(Command::Help));
    }
}
