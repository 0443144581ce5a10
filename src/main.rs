//! canopy-dr entry point: loads configuration and site inventory, seeds
//! meter history, starts the facility control loops and then either serves
//! the HTTP API or prints savings reports.

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tracing::{info, warn};

use canopy_dr::baseline::BaselineEstimator;
use canopy_dr::cli::{self, CliOptions, Command};
use canopy_dr::clock::{Clock, SystemClock};
use canopy_dr::config::ServiceConfig;
use canopy_dr::inventory::Inventory;
use canopy_dr::io::{export_audit_csv, export_reports_csv, import_readings_csv};
use canopy_dr::model::SavingsReport;
use canopy_dr::ports::{AckMode, InMemoryStore, RecordingActuator, Store, TracingAlerter};
use canopy_dr::rates::RateBook;
use canopy_dr::recommend::recommendations;
use canopy_dr::reporting::print_savings_report;
use canopy_dr::scheduler::{Collaborators, ControlPlane};
use canopy_dr::synthetic::{self, SyntheticProfile, SyntheticSensorFeed};
use canopy_dr::telemetry::init_tracing;
use canopy_dr::verification::SavingsEngine;

fn load_config(opts: &CliOptions) -> Result<ServiceConfig> {
    let mut config = match &opts.config {
        Some(path) => ServiceConfig::from_toml_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if let Some(port) = opts.port {
        config.server.port = port;
    }
    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  {e}");
        }
        bail!("configuration has {} error(s)", errors.len());
    }
    Ok(config)
}

fn load_inventory(opts: &CliOptions) -> Result<Inventory> {
    let inventory = match &opts.inventory {
        Some(path) => Inventory::from_toml_file(path)
            .with_context(|| format!("loading inventory {}", path.display()))?,
        None => Inventory::demo().context("built-in demo site")?,
    };
    let errors = inventory.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  {e}");
        }
        bail!("inventory has {} error(s)", errors.len());
    }
    Ok(inventory)
}

/// Imports the readings file, or generates synthetic history ending at `now`.
async fn seed_readings(
    opts: &CliOptions,
    inventory: &Inventory,
    store: &InMemoryStore,
    now: DateTime<Utc>,
) -> Result<()> {
    if let Some(path) = &opts.readings {
        let readings = import_readings_csv(path)
            .with_context(|| format!("importing readings {}", path.display()))?;
        info!(count = readings.len(), "imported readings");
        store.append_readings(&readings).await?;
        return Ok(());
    }

    let end = now.duration_trunc(TimeDelta::hours(1))?;
    let start = end - TimeDelta::days(i64::from(opts.synthetic_days));
    let profile = SyntheticProfile::default();
    for (i, facility) in inventory.facilities.iter().enumerate() {
        let zones: Vec<_> = inventory
            .zones
            .iter()
            .filter(|z| z.facility_id == facility.id)
            .cloned()
            .collect();
        let tariffs = inventory
            .rate_schedules
            .iter()
            .filter(|r| r.rate_zone == facility.rate_zone)
            .cloned()
            .collect();
        let rates = RateBook::for_facility(facility, tariffs)?;
        let readings = synthetic::generate(
            &zones,
            facility.tz()?,
            start,
            end,
            &profile,
            Some(&rates),
            opts.seed.wrapping_add(i as u64),
        );
        info!(
            facility_id = %facility.id,
            count = readings.len(),
            days = opts.synthetic_days,
            seed = opts.seed,
            "generated synthetic history"
        );
        store.append_readings(&readings).await?;
    }
    Ok(())
}

#[cfg(feature = "api")]
async fn serve(
    config: &ServiceConfig,
    plane: ControlPlane,
    savings: Arc<SavingsEngine>,
    store: Arc<dyn Store>,
) -> Result<()> {
    use canopy_dr::api::{AppState, serve};

    let state = Arc::new(AppState {
        plane,
        savings,
        store,
    });
    let addr = config.server.addr();
    serve(Arc::clone(&state), addr)
        .await
        .with_context(|| format!("serving on {addr}"))?;
    if let Ok(state) = Arc::try_unwrap(state) {
        state.plane.shutdown().await;
    }
    Ok(())
}

#[cfg(not(feature = "api"))]
async fn serve(
    _config: &ServiceConfig,
    _plane: ControlPlane,
    _savings: Arc<SavingsEngine>,
    _store: Arc<dyn Store>,
) -> Result<()> {
    bail!("--serve needs the `api` feature")
}

async fn print_report(
    savings: &SavingsEngine,
    store: &dyn Store,
    report: &SavingsReport,
) -> Result<()> {
    let history = savings.recent_reports(&report.facility_id, 10).await?;
    let schedules = store.schedules(&report.facility_id).await?;
    print_savings_report(report, &recommendations(&history, &schedules));
    Ok(())
}

async fn run(opts: CliOptions) -> Result<()> {
    let config = load_config(&opts)?;
    let inventory = load_inventory(&opts)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryStore::new());
    inventory.seed(&store);
    seed_readings(&opts, &inventory, &store, clock.now()).await?;

    let mut sensors = SyntheticSensorFeed::new(Arc::clone(&clock));
    for zone in &inventory.zones {
        if let Some((_, envelope)) = inventory
            .envelopes
            .iter()
            .find(|(profile, _)| *profile == zone.crop_profile)
        {
            sensors.add_zone(zone.id.clone(), envelope);
        }
    }

    let control = config.control_settings();
    let savings = Arc::new(
        SavingsEngine::new(
            store.clone(),
            Arc::clone(&clock),
            BaselineEstimator::new(config.baseline.clone()),
            config.verification.clone(),
            config.retry.clone(),
        )
        .with_io_timeout(control.timing.io_timeout),
    );
    let deps = Collaborators {
        store: store.clone(),
        actuator: Arc::new(RecordingActuator::new(AckMode::Immediate)),
        sensors: Arc::new(sensors),
        alerter: Arc::new(TracingAlerter),
        clock: Arc::clone(&clock),
        dedup: Arc::new(config.dedup_cache()),
        savings: Arc::clone(&savings),
    };
    let plane = ControlPlane::start(deps, control)
        .await
        .context("starting control loops")?;

    if let Some(args) = &opts.report {
        let report = savings
            .generate_report(&args.facility_id, args.from, args.to)
            .await
            .with_context(|| format!("savings report for {}", args.facility_id))?;
        print_report(&savings, store.as_ref(), &report).await?;
        if let Some(out) = &args.out {
            export_reports_csv(std::slice::from_ref(&report), out)
                .with_context(|| format!("writing {}", out.display()))?;
            info!(path = %out.display(), "report exported");
        }
    } else if !opts.serve {
        // last full day of history for every facility
        let end = clock.now().duration_trunc(TimeDelta::days(1))?;
        let start = end - TimeDelta::days(1);
        for facility in &inventory.facilities {
            match savings.generate_report(&facility.id, start, end).await {
                Ok(report) => print_report(&savings, store.as_ref(), &report).await?,
                Err(err) => warn!(facility_id = %facility.id, "no report: {err}"),
            }
        }
    }

    if let Some(out) = &opts.audit_out {
        let mut entries = Vec::new();
        for facility in &inventory.facilities {
            entries.extend(store.audit_log(&facility.id).await?);
        }
        export_audit_csv(&entries, out).with_context(|| format!("writing {}", out.display()))?;
        info!(path = %out.display(), entries = entries.len(), "audit log exported");
    }

    if opts.serve {
        serve(&config, plane, savings, store).await
    } else {
        plane.shutdown().await;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let opts = match cli::parse_args() {
        Ok(Command::Run(opts)) => opts,
        Ok(Command::Help) => {
            cli::print_usage();
            return;
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            cli::print_usage();
            process::exit(2);
        }
    };

    if let Err(err) = run(opts).await {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}
