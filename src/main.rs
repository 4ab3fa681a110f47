//! Command-line entry point for ppms_daq.
//!
//! ```bash
//! ppms_daq --config config/rig.toml describe
//! ppms_daq --config config/rig.toml run
//! ppms_daq pulse write
//! ppms_daq switch status
//! ppms_daq inspect data/PPMS_SMR/Pt_YIG_01/1102_1430_RvsAngle.csv
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ppms_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use ppms_daq::data::{read_table, CsvWriter};
use ppms_daq::hardware::LinkBoneSwitch;
use ppms_daq::logging;
use ppms_daq::rig::Rig;
use ppms_daq::sweep::SweepDriver;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Resistance sweeps on a PPMS rig")]
struct Cli {
    /// Rig configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the configured sweep and record it to CSV
    Run,
    /// Print the connections, measurements and sweep without touching hardware
    Describe {
        /// Print the merged configuration as JSON instead
        #[arg(long)]
        json: bool,
    },
    /// Fire a configured pulse once
    Pulse {
        /// Pulse name
        name: String,
    },
    /// Query the matrix switch
    Switch {
        #[arg(value_enum, default_value_t = SwitchQuery::Status)]
        query: SwitchQuery,
    },
    /// Summarise the resistances in a recorded data file
    Inspect {
        /// Data file
        file: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SwitchQuery {
    /// Relay state
    Status,
    /// Device description
    Info,
    /// Supported commands
    Help,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Command::Run => run(&load(&cli.config)?).await,
        Command::Describe { json } => describe(&load(&cli.config)?, *json),
        Command::Pulse { name } => pulse(&load(&cli.config)?, name).await,
        Command::Switch { query } => switch(&load(&cli.config)?, *query).await,
        Command::Inspect { file } => inspect(file),
    }
}

fn load(path: &Path) -> Result<Settings> {
    let settings =
        Settings::load_from(path).with_context(|| format!("loading {}", path.display()))?;
    logging::init(&settings.application)?;
    Ok(settings)
}

async fn run(settings: &Settings) -> Result<()> {
    let mut rig = Rig::from_settings(settings)
        .await
        .context("assembling the rig")?;
    let plan = settings
        .plan(rig.topology())
        .context("building the measurement plan")?;
    let sweep = settings.sweep().context("reading the sweep parameters")?;
    let mut storage = CsvWriter::new(&settings.storage.save_folder);

    let mut driver = SweepDriver::new(&mut rig, &plan, settings.timing.clone(), settings.ramps());
    let rows = driver
        .run(&sweep, &mut storage)
        .await
        .context("sweep aborted")?;
    info!(
        "Wrote {} rows to {}",
        rows.len(),
        storage.path().display()
    );
    println!("{}", storage.path().display());
    Ok(())
}

fn describe(settings: &Settings, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(settings)?);
        return Ok(());
    }
    let topology = settings.topology()?;
    let plan = settings.plan(&topology)?;
    let sweep = settings.sweep()?;
    println!("{}", topology);
    println!("{}", plan);
    println!("{}", sweep);
    println!("Rows per run: {}", sweep.row_count());
    Ok(())
}

async fn pulse(settings: &Settings, name: &str) -> Result<()> {
    let mut rig = Rig::from_settings(settings)
        .await
        .context("assembling the rig")?;
    let plan = settings.plan(rig.topology())?;
    let pulse = plan.pulse(name)?.clone();
    rig.fire_pulse(
        &pulse,
        settings.timing.wait_after_switch,
        settings.pulse_wait_after_arm(name),
    )
    .await
    .with_context(|| format!("firing pulse '{}'", name))?;
    println!("Pulse '{}' fired", name);
    Ok(())
}

async fn switch(settings: &Settings, query: SwitchQuery) -> Result<()> {
    let switch = settings
        .switch
        .as_ref()
        .context("no [switch] section in the configuration")?;
    if switch.simulated {
        anyhow::bail!("the configured switch is simulated");
    }
    let mut driver = LinkBoneSwitch::connect(&switch.address, switch.options())
        .await
        .with_context(|| format!("connecting to the switch at {}", switch.address))?;
    let reply = match query {
        SwitchQuery::Status => driver.status().await,
        SwitchQuery::Info => driver.info().await,
        SwitchQuery::Help => driver.help().await,
    }?;
    println!("{}", reply.trim_end());
    driver.close().await?;
    Ok(())
}

fn inspect(file: &Path) -> Result<()> {
    let table = read_table(file).with_context(|| format!("reading {}", file.display()))?;
    println!("{}: {} rows", file.display(), table.rows.len());
    for name in table.measurement_names() {
        let points = table.resistance(name)?;
        let values: Vec<f64> = points.iter().map(|p| p.resistance).collect();
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
        println!(
            "{:<12} mean {:>12.6} ohm   min {:>12.6}   max {:>12.6}",
            name, mean, min, max
        );
        for p in &points {
            println!(
                "    {:>8.2} deg {:>8.2} K {:>10.1} Oe   {:.6} ohm",
                p.angle, p.temperature, p.field, p.resistance
            );
        }
    }
    Ok(())
}
