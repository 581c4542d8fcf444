// src/motion/mod.rs - Motion subsystem facade

// --- Submodules ---
pub mod buffer;
pub mod feedhold;
pub mod junction;
pub mod kinematics;
pub mod planner;
pub mod runtime;
pub mod stepper;

// --- Re-exports for external use ---
pub use buffer::{Block, BlockRing, BufferState, MoveState, MoveType};
pub use feedhold::HoldState;
pub use kinematics::{CartesianKinematics, CoreXyKinematics, Kinematics};
pub use runtime::{mcodes, ExecError, ExecOutcome, MachineHooks, NullHooks, Runtime, SpindleMode};
pub use stepper::{DriverError, StepDriver, VirtualStepDriver};

use feedhold::Feedhold;
use thiserror::Error;

use crate::config::Config;

/// Cartesian axes handled by the planner: X, Y, Z, A.
pub const AXES: usize = 4;
/// Motor channels driven by the step executor.
pub const MOTORS: usize = 4;

/// Convert planner minutes to stepper microseconds.
pub(crate) fn usec(minutes: f64) -> f64 {
    minutes * 60_000_000.0
}

pub(crate) fn vector_length(a: &[f64; AXES], b: &[f64; AXES]) -> f64 {
    let mut sum = 0.0;
    for i in 0..AXES {
        sum += (a[i] - b[i]).powi(2);
    }
    sum.sqrt()
}

pub(crate) fn unit_vector(target: &[f64; AXES], position: &[f64; AXES]) -> [f64; AXES] {
    let length = vector_length(target, position);
    std::array::from_fn(|i| (target[i] - position[i]) / length)
}

/// Producer-side rejections. None of these mutate any state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("zero length move")]
    ZeroLengthMove,
    #[error("zero duration move")]
    ZeroDurationMove,
    /// Transient back-pressure: the ring has no free slot. Retry after
    /// the executor frees one.
    #[error("planner buffer full")]
    BufferFull,
}

/// Path-control mode, set upstream by the G-code model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathControl {
    #[default]
    Continuous,
    ExactPath,
    /// Force zero velocity at move endpoints, disabling look-ahead
    /// chaining across them.
    ExactStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleState {
    #[default]
    Off,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionState {
    #[default]
    Stop,
    Run,
    Hold,
}

/// Resolved planner tunables, flattened from [`Config`] into fixed
/// arrays for the hot paths.
#[derive(Debug, Clone)]
pub struct MotionSettings {
    pub steps_per_unit: [f64; MOTORS],
    pub max_velocity: [f64; AXES],
    pub max_jerk: [f64; AXES],
    pub junction_deviation: [f64; AXES],
    pub junction_acceleration: f64,
    pub buffer_size: usize,
    pub estd_segment_usec: f64,
    pub min_line_length: f64,
    pub epsilon: f64,
    pub velocity_tolerance: f64,
    pub length_tolerance: f64,
    pub length_factor: f64,
    pub iteration_max: u32,
    pub iteration_error_percent: f64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl MotionSettings {
    pub fn from_config(config: &Config) -> Self {
        let axes = config.axis_table();
        Self {
            steps_per_unit: std::array::from_fn(|i| axes[i].steps_per_unit),
            max_velocity: std::array::from_fn(|i| axes[i].max_velocity),
            max_jerk: std::array::from_fn(|i| axes[i].max_jerk),
            junction_deviation: std::array::from_fn(|i| axes[i].junction_deviation),
            junction_acceleration: config.planner.junction_acceleration,
            buffer_size: config.planner.buffer_size,
            estd_segment_usec: config.planner.estd_segment_usec,
            min_line_length: config.planner.min_line_length,
            epsilon: config.planner.epsilon,
            velocity_tolerance: config.planner.velocity_tolerance,
            length_tolerance: config.planner.length_tolerance,
            length_factor: config.planner.length_factor,
            iteration_max: config.planner.iteration_max,
            iteration_error_percent: config.planner.iteration_error_percent,
        }
    }
}

/// Planning-side position: where the tool will be once every queued
/// block has run. Foreground-only.
#[derive(Debug, Clone, Default)]
pub struct PlanningMaster {
    pub position: [f64; AXES],
}

/// The slice of canonical machine state the motion core needs.
#[derive(Debug, Clone, Default)]
pub struct MachineState {
    pub cycle_state: CycleState,
    pub motion_state: MotionState,
    pub path_control: PathControl,
}

/// The motion subsystem: block ring, planning master, runtime, machine
/// state and the step driver, owned together.
///
/// Lifecycle is one init at boot and no teardown; everything that used to
/// be a process-wide singleton lives in this container and is reached
/// through it. The producer-side API (submit_*, feedhold, the hold
/// callbacks) belongs to the foreground context; `exec_pass` stands in
/// for the exec-interrupt tier.
pub struct MotionController<D: StepDriver> {
    pub(crate) settings: MotionSettings,
    pub(crate) kinematics: Box<dyn Kinematics>,
    pub(crate) hooks: Box<dyn MachineHooks>,
    pub(crate) mb: BlockRing,
    pub(crate) mm: PlanningMaster,
    pub(crate) mr: Runtime,
    pub(crate) machine: MachineState,
    pub(crate) hold: Feedhold,
    pub(crate) driver: D,
    pub(crate) line_number: u32,
}

impl<D: StepDriver> MotionController<D> {
    pub fn new(settings: MotionSettings, driver: D) -> Self {
        let ring = BlockRing::new(settings.buffer_size);
        Self {
            settings,
            kinematics: Box::new(CartesianKinematics),
            hooks: Box::new(NullHooks),
            mb: ring,
            mm: PlanningMaster::default(),
            mr: Runtime::default(),
            machine: MachineState::default(),
            hold: Feedhold::default(),
            driver,
            line_number: 0,
        }
    }

    pub fn from_config(config: &Config, driver: D) -> Self {
        Self::new(MotionSettings::from_config(config), driver)
    }

    pub fn with_kinematics(mut self, kinematics: Box<dyn Kinematics>) -> Self {
        self.kinematics = kinematics;
        self
    }

    pub fn with_hooks(mut self, hooks: Box<dyn MachineHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Stamp subsequent blocks with a source line number (diagnostics
    /// only).
    pub fn set_line_number(&mut self, line_number: u32) {
        self.line_number = line_number;
    }

    pub fn set_path_control(&mut self, mode: PathControl) {
        self.machine.path_control = mode;
    }

    pub fn cycle_state(&self) -> CycleState {
        self.machine.cycle_state
    }

    pub fn motion_state(&self) -> MotionState {
        self.machine.motion_state
    }

    /// Which section (head/body/tail) the runtime is currently in, `Off`
    /// between blocks.
    pub fn runtime_state(&self) -> MoveState {
        self.mr.move_state
    }

    /// True while there is a free write slot in the ring.
    pub fn can_accept_move(&self) -> bool {
        self.mb.test_write()
    }

    /// True while a segment is in flight or the runtime is mid-move.
    /// Waiting for this to go false is how a caller syncs to the queue.
    pub fn is_busy(&self) -> bool {
        self.driver.is_busy() || self.mr.move_state > MoveState::New
    }

    // --- positions -------------------------------------------------------
    //
    // Moves need several reference frames at once: mm.position is the
    // planning endpoint, mr.position the current runtime segment end,
    // mr.target the segment in flight, and the block target / mr.endpoint
    // the final move target. All are set the moment they are computed and
    // run ahead of the physical tool.

    pub fn get_plan_position(&self) -> [f64; AXES] {
        self.mm.position
    }

    pub fn set_plan_position(&mut self, position: [f64; AXES]) {
        self.mm.position = position;
    }

    /// Set planning and runtime positions together (coordinate-system
    /// transforms go through here).
    pub fn set_axis_position(&mut self, position: [f64; AXES]) {
        self.mm.position = position;
        self.mr.position = position;
    }

    pub fn get_runtime_position(&self, axis: usize) -> f64 {
        self.mr.position[axis]
    }

    pub fn get_runtime_velocity(&self) -> f64 {
        self.mr.segment_velocity
    }

    pub fn get_runtime_line_number(&self) -> u32 {
        self.mr.line_number
    }

    /// Correct the reported velocity in the last segment for reporting
    /// purposes.
    pub fn zero_segment_velocity(&mut self) {
        self.mr.segment_velocity = 0.0;
    }

    /// Discard all queued and pending blocks and stop the cycle. The
    /// runtime is reset too; a segment already armed in the step driver
    /// keeps pulsing to its end.
    pub fn flush_planner(&mut self) {
        self.mb.init();
        self.mr.move_state = MoveState::Off;
        self.mr.section_state = MoveState::Off;
        self.mr.segment_velocity = 0.0;
        self.machine.motion_state = MotionState::Stop;
        tracing::info!("planner flushed");
    }

    /// Run the exec tier: as long as exec has been requested and the prep
    /// slot is free, step the dispatcher. Each dispatcher call prepares
    /// at most one segment.
    pub fn exec_pass(&mut self) -> Result<ExecOutcome, ExecError> {
        let mut last = ExecOutcome::Noop;
        while self.driver.take_exec_request() {
            loop {
                if self.driver.prep_busy() {
                    break;
                }
                match self.exec_move()? {
                    ExecOutcome::Noop => break,
                    status => last = status,
                }
            }
        }
        Ok(last)
    }

    /// Run the foreground hold callbacks. The host loop calls this every
    /// iteration, the way the original main loop polled its planner
    /// callbacks.
    pub fn run_callbacks(&mut self) {
        self.plan_hold_callback();
        self.end_hold_callback();
    }

    /// Snapshot of the committed blocks in queue order, for diagnostics
    /// and tests.
    pub fn planned_blocks(&self) -> Vec<Block> {
        self.mb.occupied()
    }
}
