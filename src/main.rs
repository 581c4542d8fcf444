// src/main.rs - Host shell for dry-running the motion core
use clap::Parser;
use stepcore::motion::mcodes;
use stepcore::{load_config, MotionController, MotionSettings, VirtualStepDriver, MOTORS};

#[derive(Parser, Debug)]
#[command(name = "motion-host", about = "Drive the motion core against the virtual step timers")]
struct Args {
    /// Path to a TOML machine configuration
    #[arg(short, long)]
    config: Option<String>,

    /// Exec-tier tick period in microseconds
    #[arg(long, default_value_t = 5000)]
    tick_us: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => {
            let config = load_config(path).map_err(|e| {
                tracing::error!("Failed to load config from '{}': {}", path, e);
                Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
            })?;
            MotionSettings::from_config(&config)
        }
        None => {
            tracing::info!("No config given, using defaults");
            MotionSettings::default()
        }
    };

    tracing::info!(
        "Motion core ready: {} block ring, {}us segments, jerk {:.0} mm/min^3",
        settings.buffer_size,
        settings.estd_segment_usec,
        settings.max_jerk[0]
    );

    let mut controller = MotionController::new(settings, VirtualStepDriver::new());

    // a short demonstration toolpath: a rectangle, then a dwell and a
    // spindle stop
    let feed_minutes = |length: f64| length / 600.0; // 600 mm/min
    controller.set_line_number(1);
    controller.submit_aline([100.0, 0.0, 0.0, 0.0], feed_minutes(100.0))?;
    controller.set_line_number(2);
    controller.submit_aline([100.0, 50.0, 0.0, 0.0], feed_minutes(50.0))?;
    controller.set_line_number(3);
    controller.submit_aline([0.0, 50.0, 0.0, 0.0], feed_minutes(100.0))?;
    controller.set_line_number(4);
    controller.submit_aline([0.0, 0.0, 0.0, 0.0], feed_minutes(50.0))?;
    controller.submit_dwell(0.25)?;
    controller.submit_mcode(mcodes::SPINDLE_OFF)?;

    tracing::info!("Toolpath queued, running to completion (Ctrl+C to abort)");

    let mut ticker =
        tokio::time::interval(tokio::time::Duration::from_micros(args.tick_us.max(100)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                controller.run_callbacks();
                if let Err(e) = controller.exec_pass() {
                    tracing::error!("exec tier fault: {e}");
                    controller.flush_planner();
                    break;
                }
                controller.driver_mut().tick(args.tick_us as f64);
                if !controller.is_busy() && controller.planned_blocks().is_empty() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Aborting: flushing planner");
                controller.flush_planner();
                break;
            }
        }
    }

    let steps = controller.driver().position_steps();
    let spu = controller.settings().steps_per_unit;
    let mm: Vec<f64> = (0..MOTORS).map(|m| steps[m] as f64 / spu[m]).collect();
    tracing::info!(
        "Final motor positions: {:?} steps = {:.3?} mm, runtime at [{:.3}, {:.3}, {:.3}, {:.3}]",
        steps,
        mm,
        controller.get_runtime_position(0),
        controller.get_runtime_position(1),
        controller.get_runtime_position(2),
        controller.get_runtime_position(3),
    );
    Ok(())
}
