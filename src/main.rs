//! `labctl`: inspect and drive a station of instruments from the shell.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use rust_labctl::config::LabConfig;
use rust_labctl::{logging, BatchedCaller, NamedValue, ParameterValue, Station};

#[derive(Debug, Parser)]
#[command(name = "labctl", version, about = "Instrument parameter control")]
struct Cli {
    /// Station YAML file (defaults to `station.file` from the config)
    #[arg(short, long, global = true)]
    station: Option<PathBuf>,

    /// Run batched reads sequentially instead of one worker per instrument
    #[arg(long, global = true)]
    sequential: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective configuration as TOML
    Config,
    #[command(flatten)]
    Station(StationCommand),
}

/// Commands that need a loaded station.
#[derive(Debug, Subcommand)]
enum StationCommand {
    /// Print the station state as JSON
    Snapshot {
        /// Read every gettable value first
        #[arg(short, long)]
        update: bool,
    },
    /// Read one or more values by dotted path
    Get {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Write a value by dotted path
    Set { path: String, value: String },
}

fn open_station(cli: &Cli, config: &LabConfig) -> Result<Station> {
    let path = cli
        .station
        .clone()
        .or_else(|| config.station.file.clone())
        .ok_or_else(|| anyhow!("no station file given; pass --station or set station.file"))?;
    Station::from_file(&path).with_context(|| format!("Failed to load station {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = LabConfig::load().context("Failed to load configuration")?;
    logging::init(&config.logging)?;

    match &cli.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Station(command) => {
            let station = open_station(&cli, &config)?;
            let outcome = run(command, &cli, &config, &station).await;
            station.close_all();
            outcome
        }
    }
}

async fn run(
    command: &StationCommand,
    cli: &Cli,
    config: &LabConfig,
    station: &Station,
) -> Result<()> {
    match command {
        StationCommand::Snapshot { update } => {
            let snapshot = station.snapshot(*update);
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        StationCommand::Get { paths } => {
            let values = paths
                .iter()
                .map(|p| station.parameter(p))
                .collect::<rust_labctl::Result<Vec<_>>>()?;
            let caller = if cli.sequential {
                BatchedCaller::new(false)
            } else {
                BatchedCaller::from_config(&config.batch)
            };
            let results = caller.get_all(&values).await?;
            for ((path, value), result) in paths.iter().zip(&values).zip(results) {
                println!("{} = {} {}", path, result, value.unit());
            }
        }
        StationCommand::Set { path, value } => {
            let parameter = station.parameter(path)?;
            let value = ParameterValue::parse_scalar(value);
            let target = value.clone();
            // ramps sleep between steps
            tokio::task::spawn_blocking(move || parameter.set(target))
                .await?
                .with_context(|| format!("Failed to set {}", path))?;
            info!(parameter = %path, %value, "set");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_needs_no_station() {
        let cli = Cli::try_parse_from(["labctl", "config"]).unwrap();
        assert!(matches!(cli.command, Command::Config));
    }

    #[test]
    fn test_station_commands_parse() {
        let cli =
            Cli::try_parse_from(["labctl", "--sequential", "set", "dac.ch01.voltage", "0.5"])
                .unwrap();
        assert!(cli.sequential);
        assert!(matches!(
            cli.command,
            Command::Station(StationCommand::Set { ref path, .. }) if path == "dac.ch01.voltage"
        ));
        assert!(Cli::try_parse_from(["labctl", "get"]).is_err());
    }

    #[tokio::test]
    async fn test_set_command_ramps_to_value() {
        let station = Station::load(
            &rust_labctl::StationConfig::from_yaml(
                "instruments:\n  dac:\n    driver: mock_dac\n    channels: 1\n    step: 0.1\n",
            )
            .unwrap(),
            &rust_labctl::DriverRegistry::new(),
            &rust_labctl::ChannelTypeRegistry::new(),
        )
        .unwrap();
        let cli = Cli::try_parse_from(["labctl", "set", "dac.ch01.voltage", "0.5"]).unwrap();
        let Command::Station(command) = &cli.command else {
            panic!("expected a station command");
        };
        run(command, &cli, &LabConfig::default(), &station).await.unwrap();
        assert_eq!(
            station.parameter("dac.ch01.voltage").unwrap().get().unwrap(),
            ParameterValue::Float(0.5)
        );
        station.close_all();
    }
}
