//! Loading stations and configuration from files on disk.

use serial_test::serial;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

use rust_labctl::config::{LabConfig, CONFIG_ENV_VAR};
use rust_labctl::error::InstrumentError;
use rust_labctl::{BatchedCaller, ParameterValue, Station};

const STATION: &str = r#"
instruments:
  dac:
    driver: mock_dac
    channels: 3
    step: 0.5
  lockin:
    driver: mock_lockin
    trace_points: 16
groups:
  chip:
    set_initial_values_on_load: true
    initial_values:
      device1.gate: 0.25
      device1.gate.step: 0.1
    submodules:
      device1:
        parameters:
          gate: dac.ch01.voltage
          drive: [dac.ch02.voltage, dac.ch03.voltage]
        channels:
          amp: lockin
"#;

fn station_file(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("station.yaml");
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn station_from_file_builds_everything() {
    let dir = TempDir::new().unwrap();
    let station = Station::from_file(station_file(&dir, STATION)).unwrap();

    assert_eq!(station.registry().names(), vec!["dac", "lockin", "chip"]);
    assert_eq!(
        station.parameter("dac.ch01.voltage").unwrap().get().unwrap(),
        ParameterValue::Float(0.25)
    );

    let drive = station.parameter("chip.device1.drive").unwrap();
    drive.set(ParameterValue::Float(-1.0)).unwrap();
    assert_eq!(
        station.parameter("dac.ch03.voltage").unwrap().get().unwrap(),
        ParameterValue::Float(-1.0)
    );

    // attached channel is the lockin itself
    let via_group = station.parameter("chip.device1.amp.frequency").unwrap();
    let direct = station.parameter("lockin.frequency").unwrap();
    assert_eq!(via_group.get().unwrap(), direct.get().unwrap());

    station.close_all();
}

#[tokio::test]
async fn station_values_read_in_a_batch() {
    let dir = TempDir::new().unwrap();
    let station = Station::from_file(station_file(&dir, STATION)).unwrap();
    let values = vec![
        station.parameter("chip.device1.gate").unwrap(),
        station.parameter("lockin.amplitude").unwrap(),
        station.parameter("dac.ch02.voltage").unwrap(),
    ];
    let results = BatchedCaller::new(true).get_all(&values).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], ParameterValue::Float(0.25));
    station.close_all();
}

#[test]
fn broken_station_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let err = Station::from_file(station_file(&dir, "instruments: [")).unwrap_err();
    assert!(matches!(err, InstrumentError::Yaml(_)));

    let missing = Station::from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(missing, InstrumentError::Io(_)));
}

#[test]
fn snapshot_serializes_to_json() {
    let dir = TempDir::new().unwrap();
    let station = Station::from_file(station_file(&dir, STATION)).unwrap();
    let json = serde_json::to_value(station.snapshot(true)).unwrap();
    assert!(json["instruments"]["dac"].is_object());
    assert!(json["instruments"]["chip"]["submodules"]["device1"].is_object());
    station.close_all();
}

#[test]
#[serial]
fn config_file_from_environment_variable() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[logging]\nlevel = \"debug\"\n\n[station]\nfile = \"fridge.yaml\"").unwrap();

    std::env::set_var(CONFIG_ENV_VAR, file.path());
    let loaded = LabConfig::load();
    std::env::remove_var(CONFIG_ENV_VAR);

    let config = loaded.unwrap();
    assert_eq!(config.logging.level, "debug");
    assert_eq!(
        config.station.file.as_deref(),
        Some(std::path::Path::new("fridge.yaml"))
    );
}

#[test]
#[serial]
fn environment_beats_config_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[logging]\nformat = \"plain\"").unwrap();

    std::env::set_var("LABCTL_LOGGING__FORMAT", "json");
    let loaded = LabConfig::load_from(&[file.path()]);
    std::env::remove_var("LABCTL_LOGGING__FORMAT");

    assert_eq!(loaded.unwrap().logging.format, "json");
}
