use acqcompiler_backend::experiment::LinearStage;
use acqcompiler_backend::utils::{init_logging, TickTimer};
use acqcompiler_backend::*;
use tracing::{error, info};

fn run() -> ScheduleResult<()> {
    let mut timer = TickTimer::new();

    // Two-colour Z-stack over 4 um in 0.5 um steps
    let cam = HandlerRef::camera("cam0");
    let exposures = vec![
        ExposureSettings::new()
            .with_camera(cam.clone())
            .with_light(HandlerRef::light("488"), Time::from_millis(30.0)?)?,
        ExposureSettings::new()
            .with_camera(cam.clone())
            .with_light(HandlerRef::light("561"), Time::from_millis(50.0)?)?,
    ];
    let params = ExperimentParams::new(2, None, exposures)?;
    let stage = LinearStage::new(HandlerRef::stage("z"), 0.1, Time::from_millis(5.0)?)?;
    let experiment = zstack::ZStackExperiment::new(params, stage, 0.0, 4.0, 0.5)?;
    let exposer = BasicExposer::new().with_camera(cam, CameraTiming::new(Time::from_millis(12.5)?));
    timer.tick_log("setup");

    let session = compile_experiment(&experiment, &exposer, &mut [])?;
    timer.tick_log("compile");
    for action in session.iter().take(12) {
        info!("{}", action);
    }
    info!(
        "{} actions, {} ms per repetition",
        session.len(),
        session.duration()?
    );
    Ok(())
}

fn main() {
    init_logging();
    if let Err(err) = run() {
        error!("{}", err);
        std::process::exit(1);
    }
}
