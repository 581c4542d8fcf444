//! # stepcore
//!
//! Motion-planning and step-generation core for a multi-axis CNC /
//! 3D-printer controller. Takes a stream of Cartesian targets with
//! requested durations and produces a precisely timed pulse train on
//! per-axis step outputs, respecting per-axis velocity, jerk and
//! junction-deviation limits.
//!
//! The two halves:
//!
//! - the look-ahead planner: a bounded ring of move blocks replanned with
//!   backward/forward passes into constant-jerk S-curve trapezoids
//! - the step executor: a dispatcher and segment preparer that slice each
//!   planned section into fixed-duration segments, run them through
//!   inverse kinematics and hand them to the step-timer front end
//!
//! G-code parsing, arcs, host I/O and the real timer/GPIO hardware are
//! external collaborators; the [`motion::StepDriver`] trait is the
//! boundary to the latter.

pub mod config;
pub mod motion;

pub use config::{load_config, AxisConfig, Config, ConfigError, PlannerConfig};
pub use motion::{
    CartesianKinematics, ExecError, ExecOutcome, HoldState, Kinematics, MachineHooks,
    MotionController, MotionSettings, MoveType, PathControl, PlanError, StepDriver,
    VirtualStepDriver, AXES, MOTORS,
};
