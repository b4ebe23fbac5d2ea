use std::path::PathBuf;

use acqcompiler_backend::utils::{init_logging, TickTimer};
use acqcompiler_backend::zstack::ZStackExperiment;
use acqcompiler_backend::*;
use acqctrl_backend::config::MirrorConfig;
use acqctrl_backend::*;
use tracing::{error, info};

// Dry run of a remote-focus Z-stack on a simulated mirror.
// Usage: acqctrl_backend_bin [rig.toml]
fn run() -> DeviceResult<()> {
    let mut timer = TickTimer::new();
    let rig = match std::env::args().nth(1) {
        Some(path) => RigConfig::load(&PathBuf::from(path))?,
        None => RigConfig::default(),
    };
    let mirror_config = rig.mirror.clone().unwrap_or(MirrorConfig {
        name: "dm".to_string(),
        n_actuators: 4,
        trigger_source: None,
        trigger_line: None,
        settling_time_ms: Time::from_whole_millis(10),
        lut_path: None,
        user_config_path: None,
    });
    let mut mirror = DeformableMirror::from_config(&mirror_config)?;
    let mut driver = SimulatedMirror::new(mirror_config.n_actuators);

    let cam = HandlerRef::camera(rig.cameras.first().map_or("cam0", |c| c.name.as_str()));
    let exposures = vec![ExposureSettings::new()
        .with_camera(cam)
        .with_light(HandlerRef::light("488"), Time::from_millis(20.0)?)?];
    let params = ExperimentParams::new(1, None, exposures)?;
    let experiment = ZStackExperiment::new(params, mirror.positioner(), -2.0, 4.0, 1.0)?;
    let exposer = rig.exposer();
    timer.tick_log("setup");

    let session = compile_experiment(&experiment, &exposer, &mut [&mut mirror])?;
    timer.tick_log("compile");
    info!(
        "{}: {} actions over {} ms",
        session.name(),
        session.len(),
        session.duration()?
    );

    mirror.execute_actions(session.actions(), &mut driver)?;
    timer.tick_log("execute");
    if let Some(patterns) = driver.queued.last() {
        info!("queued {} patterns of {} actuators", patterns.nrows(), patterns.ncols());
    }
    Ok(())
}

fn main() {
    init_logging();
    if let Err(err) = run() {
        error!("{}", err);
        std::process::exit(1);
    }
}
