//! Loading rig descriptions from TOML and the environment.

use ppms_daq::config::Settings;
use ppms_daq::data::CsvWriter;
use ppms_daq::error::{DaqError, LookupError};
use ppms_daq::rig::Rig;
use ppms_daq::sweep::{Setpoints, SweepDriver};
use serial_test::serial;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/rig.toml")
}

fn write_config(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

const MINIMAL: &str = r#"
[switch]
simulated = true

[[puck]]
pin = 7
name = "HB+"
port = "a"

[[puck]]
pin = 8
name = "HB-"
port = "b"

[[instruments]]
model = "2182"
gpib = 7
simulated = true
terminals = [{ name = "V+", port = "p" }, { name = "V-", port = "o" }]

[[instruments]]
model = "2400"
gpib = 24
simulated = true

[[measurements]]
name = "R2pt"
switch = [["HB+", "V+"], ["HB-", "V-"]]

[sweep]
field = [-1000, 0, 1000]
"#;

#[test]
#[serial]
fn shipped_config_describes_the_smr_scan() {
    let settings = Settings::load_from(shipped_config()).unwrap();
    let topology = settings.topology().unwrap();
    assert_eq!(topology.puck_connections().len(), 8);
    assert_eq!(topology.instruments().len(), 3);

    let plan = settings.plan(&topology).unwrap();
    assert_eq!(plan.measurements().len(), 5);
    assert_eq!(plan.pulses().len(), 1);
    assert_eq!(plan.column_names().len(), 15);

    let sweep = settings.sweep().unwrap();
    assert_eq!(sweep.measurement_type(), "RvsAngle");
    assert_eq!(sweep.row_count(), 17);
}

#[test]
#[serial]
fn minimal_config_fills_in_defaults() {
    let file = write_config(MINIMAL);
    let settings = Settings::load_from(file.path()).unwrap();

    assert!(settings.ppms.is_none());
    assert_eq!(settings.sampling.num_points, 30);
    assert_eq!(settings.measurements[0].voltmeter, "Voltmeter");
    assert_eq!(settings.measurements[0].amplitude, 1e-4);

    let topology = settings.topology().unwrap();
    let plan = settings.plan(&topology).unwrap();
    let route = &plan.measurements()[0].routes()[0];
    assert_eq!(route.ports.0.label(), 'a');
    assert_eq!(route.ports.1.label(), 'p');

    let sweep = settings.sweep().unwrap();
    assert_eq!(sweep.measurement_type(), "RvsH_NoRotator");
}

// Environment variables are process-wide, hence `#[serial]` on every loader test.
#[test]
#[serial]
fn environment_overrides_the_file() {
    std::env::set_var("PPMS_DAQ_STORAGE__NOTE", "from the environment");
    let file = write_config(MINIMAL);
    let settings = Settings::load_from(file.path()).unwrap();
    std::env::remove_var("PPMS_DAQ_STORAGE__NOTE");
    assert_eq!(settings.storage.note, "from the environment");
    assert_eq!(settings.metadata().note, "from the environment");
}

#[test]
#[serial]
fn missing_file_is_reported() {
    let err = Settings::load_from("/nonexistent/rig.toml").unwrap_err();
    assert!(matches!(err, DaqError::Configuration(_)));
}

#[test]
#[serial]
fn unusable_sampling_fails_validation() {
    let file = write_config(&format!(
        "{}\n[sampling]\nnum_points = 8\nskip_points = 5\ndrop_outliers = 2\n",
        MINIMAL
    ));
    let err = Settings::load_from(file.path()).unwrap_err();
    assert!(matches!(
        err,
        DaqError::InsufficientSamples {
            available: 3,
            dropped: 2
        }
    ));
}

#[test]
#[serial]
fn malformed_port_is_a_load_error() {
    let file = write_config(&MINIMAL.replace("port = \"a\"", "port = \"z\""));
    let err = Settings::load_from(file.path()).unwrap_err();
    assert!(matches!(err, DaqError::Config(_)));
}

#[test]
#[serial]
fn bottom_row_puck_port_is_rejected() {
    let file = write_config(&MINIMAL.replace("port = \"a\"", "port = \"k\""));
    let settings = Settings::load_from(file.path()).unwrap();
    assert!(matches!(
        settings.topology(),
        Err(DaqError::Configuration(_))
    ));
}

#[test]
#[serial]
fn unknown_connection_fails_plan_construction() {
    let file = write_config(&MINIMAL.replace("[\"HB-\", \"V-\"]", "[\"HBL9\", \"V-\"]"));
    let settings = Settings::load_from(file.path()).unwrap();
    let topology = settings.topology().unwrap();
    assert!(matches!(
        settings.plan(&topology),
        Err(DaqError::Lookup(LookupError::NotFound(name))) if name == "HBL9"
    ));
}

#[tokio::test]
#[serial]
async fn hardware_ppms_is_not_available() {
    let file = write_config(&format!("{}\n[ppms]\nsimulated = false\n", MINIMAL));
    let settings = Settings::load_from(file.path()).unwrap();
    let result = Rig::from_settings(&settings).await;
    assert!(matches!(result, Err(DaqError::Configuration(_))));
}

#[tokio::test(start_paused = true)]
#[serial]
async fn shipped_config_runs_end_to_end_in_simulation() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::load_from(shipped_config()).unwrap();
    settings.sweep.angle = Some(Setpoints::List(vec![0.0, 90.0]));
    settings.storage.save_folder = dir.path().to_path_buf();

    let mut rig = Rig::from_settings(&settings).await.unwrap();
    let plan = settings.plan(rig.topology()).unwrap();
    let sweep = settings.sweep().unwrap();
    let mut storage = CsvWriter::new(&settings.storage.save_folder);

    let rows = SweepDriver::new(&mut rig, &plan, settings.timing.clone(), settings.ramps())
        .run(&sweep, &mut storage)
        .await
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].angle, 90.0);
    assert_eq!(rows[1].field, 140000.0);
    assert!(storage
        .path()
        .starts_with(dir.path().join(&settings.storage.sample_id)));
    for reading in &rows[0].readings {
        let resistance = reading.mean / reading.amplitude;
        assert!((resistance - 120.0).abs() < 0.1, "R = {}", resistance);
    }

    let pulse = plan.pulse("write").unwrap().clone();
    rig.fire_pulse(
        &pulse,
        settings.timing.wait_after_switch,
        settings.pulse_wait_after_arm("write"),
    )
    .await
    .unwrap();
}
