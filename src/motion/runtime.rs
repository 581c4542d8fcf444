// src/motion/runtime.rs - Move execution runtime
//
// Everything in this file runs on the exec tier. The contract with the
// dispatcher is strict: each call into exec_move prepares one and only
// one segment. The planner relies on that - between calls the runtime is
// quiescent, and that interval is the only window in which feedhold
// planning may rewrite it. Preparing two segments in one call reopens
// the race this design exists to close.

use thiserror::Error;
use tracing::{debug, trace};

use super::buffer::{MoveState, MoveType};
use super::feedhold::HoldState;
use super::stepper::StepDriver;
use super::{usec, CycleState, MotionController, MotionState, AXES};

/// Exec-tier progress report. `Noop` means nothing was runnable, `Again`
/// means the current block has more segments, `Done` means a block
/// finished this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Done,
    Again,
    Noop,
}

/// Section-level progress: one more segment consumed, or the section has
/// run all of its segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentOutcome {
    Complete,
    Again,
}

#[derive(Debug, Error)]
pub enum ExecError {
    /// An invariant that should be unreachable was violated. Aborts the
    /// active cycle; there is no silent correction.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// Deferred M codes routed through the planning queue so they execute in
/// order with motion.
pub mod mcodes {
    pub const PROGRAM_STOP: u8 = 0;
    pub const OPTIONAL_STOP: u8 = 1;
    pub const PROGRAM_END: u8 = 2;
    pub const SPINDLE_CW: u8 = 3;
    pub const SPINDLE_CCW: u8 = 4;
    pub const SPINDLE_OFF: u8 = 5;
    pub const MIST_COOLANT_ON: u8 = 6;
    pub const FLOOD_COOLANT_ON: u8 = 7;
    pub const FLOOD_COOLANT_OFF: u8 = 8;
    pub const FEED_OVERRIDE_ON: u8 = 9;
    pub const FEED_OVERRIDE_OFF: u8 = 10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpindleMode {
    Cw,
    Ccw,
    Off,
}

/// Machine-level callbacks for deferred commands. The core only queues
/// and sequences these; what they do to the actual machine is the
/// embedder's business.
pub trait MachineHooks {
    fn program_stop(&mut self) {}
    fn program_end(&mut self) {}
    fn spindle_control(&mut self, _mode: SpindleMode) {}
    fn mist_coolant(&mut self, _on: bool) {}
    fn flood_coolant(&mut self, _on: bool) {}
    fn feed_override(&mut self, _on: bool) {}
    fn tool_change(&mut self, _tool: u8) {}
    fn spindle_speed(&mut self, _rpm: f64) {}
}

/// Default hooks: log and move on.
#[derive(Debug, Default)]
pub struct NullHooks;

impl MachineHooks for NullHooks {
    fn program_stop(&mut self) {
        debug!("program stop");
    }
    fn program_end(&mut self) {
        debug!("program end");
    }
    fn spindle_control(&mut self, mode: SpindleMode) {
        debug!(?mode, "spindle control");
    }
    fn spindle_speed(&mut self, rpm: f64) {
        debug!(rpm, "spindle speed");
    }
}

/// Persistent runtime state for the move being executed.
///
/// Survives across blocks; a block's parameters are snapshotted in on
/// first entry and the segment working set is rebuilt per section.
#[derive(Debug, Clone, Default)]
pub struct Runtime {
    pub line_number: u32,
    pub move_state: MoveState,
    pub section_state: MoveState,

    /// Final target of the whole move, kept to absorb accumulated
    /// rounding on the last segment.
    pub endpoint: [f64; AXES],
    pub position: [f64; AXES],
    pub target: [f64; AXES],
    pub unit: [f64; AXES],

    pub head_length: f64,
    pub body_length: f64,
    pub tail_length: f64,
    pub entry_velocity: f64,
    pub cruise_velocity: f64,
    pub exit_velocity: f64,

    pub length: f64,
    pub move_time: f64,
    pub accel_time: f64,
    pub elapsed_accel_time: f64,
    pub midpoint_velocity: f64,
    pub midpoint_acceleration: f64,
    pub jerk: f64,
    pub jerk_div2: f64,

    pub segments: f64,
    pub segment_count: u32,
    pub segment_move_time: f64,
    pub segment_accel_time: f64,
    pub microseconds: f64,
    pub segment_velocity: f64,
}

impl<D: StepDriver> MotionController<D> {
    /// Run one step of the move dispatcher.
    ///
    /// Pulls the current run block and routes it by type. Emits at most
    /// one segment into the step driver per call.
    pub fn exec_move(&mut self) -> Result<ExecOutcome, ExecError> {
        let Some(bf) = self.mb.get_run() else {
            return Ok(ExecOutcome::Noop);
        };
        if self.machine.cycle_state == CycleState::Off {
            self.begin_cycle();
        }
        if self.machine.motion_state == MotionState::Stop
            && self.mb.block(bf).move_type == MoveType::Aline
        {
            self.machine.motion_state = MotionState::Run;
        }
        match self.mb.block(bf).move_type {
            MoveType::Line => self.exec_line(bf),
            MoveType::Aline => self.exec_aline(bf),
            MoveType::Dwell => self.exec_dwell(bf),
            MoveType::MCode => self.exec_mcode(bf),
            MoveType::Tool => self.exec_tool(bf),
            MoveType::SpindleSpeed => self.exec_spindle_speed(bf),
            MoveType::None => Err(ExecError::Internal("empty move type in dispatcher")),
        }
    }

    /// Simple line: one step program for the whole move, no segmentation.
    fn exec_line(&mut self, bf: usize) -> Result<ExecOutcome, ExecError> {
        let block = self.mb.block(bf);
        let mut travel = [0.0; AXES];
        for i in 0..AXES {
            travel[i] = block.target[i] - self.mr.position[i];
        }
        let target = block.target;
        self.mr.microseconds = usec(block.time);
        let steps = self
            .kinematics
            .inverse(&travel, &self.settings.steps_per_unit, self.mr.microseconds);
        if self.driver.prep_line(steps, self.mr.microseconds).is_ok() {
            self.mr.position = target;
        }
        self.finish_run_block();
        Ok(ExecOutcome::Done)
    }

    fn exec_dwell(&mut self, bf: usize) -> Result<ExecOutcome, ExecError> {
        let seconds = self.mb.block(bf).time;
        let _ = self.driver.prep_dwell(seconds * 1_000_000.0);
        self.finish_run_block();
        Ok(ExecOutcome::Done)
    }

    fn exec_mcode(&mut self, bf: usize) -> Result<ExecOutcome, ExecError> {
        let code = self.mb.block(bf).move_code;
        match code {
            mcodes::PROGRAM_STOP | mcodes::OPTIONAL_STOP => self.hooks.program_stop(),
            mcodes::PROGRAM_END => self.hooks.program_end(),
            mcodes::SPINDLE_CW => self.hooks.spindle_control(SpindleMode::Cw),
            mcodes::SPINDLE_CCW => self.hooks.spindle_control(SpindleMode::Ccw),
            mcodes::SPINDLE_OFF => self.hooks.spindle_control(SpindleMode::Off),
            mcodes::MIST_COOLANT_ON => self.hooks.mist_coolant(true),
            mcodes::FLOOD_COOLANT_ON => self.hooks.flood_coolant(true),
            mcodes::FLOOD_COOLANT_OFF => self.hooks.flood_coolant(false),
            mcodes::FEED_OVERRIDE_ON => self.hooks.feed_override(true),
            mcodes::FEED_OVERRIDE_OFF => self.hooks.feed_override(false),
            _ => {
                self.finish_run_block();
                return Err(ExecError::Internal("unknown M code in dispatcher"));
            }
        }
        // a null prep keeps the loader pipeline primed across the
        // non-motion block
        self.driver.prep_null();
        self.finish_run_block();
        Ok(ExecOutcome::Done)
    }

    fn exec_tool(&mut self, bf: usize) -> Result<ExecOutcome, ExecError> {
        let tool = self.mb.block(bf).move_code;
        self.hooks.tool_change(tool);
        self.driver.prep_null();
        self.finish_run_block();
        Ok(ExecOutcome::Done)
    }

    fn exec_spindle_speed(&mut self, bf: usize) -> Result<ExecOutcome, ExecError> {
        let rpm = self.mb.block(bf).time;
        self.hooks.spindle_speed(rpm);
        self.driver.prep_null();
        self.finish_run_block();
        Ok(ExecOutcome::Done)
    }

    /// Accelerated line continuation. Re-entered once per segment until
    /// the block is done.
    fn exec_aline(&mut self, bf: usize) -> Result<ExecOutcome, ExecError> {
        if self.mb.block(bf).move_state == MoveState::Off {
            return Ok(ExecOutcome::Noop);
        }

        if self.mr.move_state == MoveState::Off {
            // feedhold release gate
            if self.mb.block(bf).hold_point {
                if self.hold.state == HoldState::Decel {
                    self.enter_hold();
                }
                return Ok(ExecOutcome::Noop);
            }

            // new block: snapshot it into the runtime. From here on the
            // block's contents no longer affect execution.
            let block = self.mb.block_mut(bf);
            block.replannable = false;
            if block.length < self.settings.epsilon {
                // zero-length blocks (a hold can shrink one to nothing)
                // free straight through so the queue keeps draining
                self.finish_run_block();
                return Ok(ExecOutcome::Again);
            }
            block.move_state = MoveState::Run;
            let block = self.mb.block(bf);
            self.mr.move_state = MoveState::Head;
            self.mr.section_state = MoveState::New;
            self.mr.line_number = block.line_number;
            self.mr.jerk = block.jerk;
            self.mr.jerk_div2 = block.jerk / 2.0;
            self.mr.head_length = block.head_length;
            self.mr.body_length = block.body_length;
            self.mr.tail_length = block.tail_length;
            self.mr.entry_velocity = block.entry_velocity;
            self.mr.cruise_velocity = block.cruise_velocity;
            self.mr.exit_velocity = block.exit_velocity;
            self.mr.unit = block.unit;
            self.mr.endpoint = block.target;
            trace!(
                line = block.line_number,
                head = block.head_length,
                body = block.body_length,
                tail = block.tail_length,
                "aline started"
            );
        }

        let status = match self.mr.move_state {
            MoveState::Head => self.exec_aline_head(),
            MoveState::Body => self.exec_aline_body(),
            MoveState::Tail => self.exec_aline_tail(),
            _ => return Err(ExecError::Internal("runtime in impossible section")),
        };

        // feedhold post-processing; see the hold state machine notes in
        // feedhold.rs
        if self.hold.state == HoldState::Sync {
            self.hold.state = HoldState::Plan;
        }
        if self.hold.state == HoldState::Decel
            && status == ExecOutcome::Done
            && self.mb.block(bf).hold_point
        {
            self.enter_hold();
        }

        if status != ExecOutcome::Again {
            // block is over: reset the runtime and prevent the planner
            // from rewriting the successor the executor may pick up next
            self.mr.move_state = MoveState::Off;
            self.mr.section_state = MoveState::Off;
            let nx = self.mb.next_of(bf);
            self.mb.block_mut(nx).replannable = false;
            if self.mb.block(bf).move_state == MoveState::Run {
                self.finish_run_block();
            }
            // otherwise the block was reused by hold planning and must
            // run again
        }
        Ok(status)
    }

    /// Acceleration section: two jerk-curve halves around the midpoint.
    fn exec_aline_head(&mut self) -> ExecOutcome {
        if self.mr.section_state == MoveState::New {
            if self.mr.head_length < self.settings.epsilon {
                self.mr.move_state = MoveState::Body;
                return self.exec_aline_body();
            }
            self.mr.midpoint_velocity = (self.mr.entry_velocity + self.mr.cruise_velocity) / 2.0;
            self.mr.move_time = self.mr.head_length / self.mr.midpoint_velocity;
            self.mr.accel_time =
                2.0 * ((self.mr.cruise_velocity - self.mr.entry_velocity) / self.mr.jerk).sqrt();
            self.mr.midpoint_acceleration =
                2.0 * (self.mr.cruise_velocity - self.mr.entry_velocity) / self.mr.accel_time;
            // segments per half
            self.mr.segments =
                (usec(self.mr.move_time) / (2.0 * self.settings.estd_segment_usec)).ceil();
            self.mr.segment_move_time = self.mr.move_time / (2.0 * self.mr.segments);
            self.mr.segment_accel_time = self.mr.accel_time / (2.0 * self.mr.segments);
            // elapsed time starts at the segment midpoint
            self.mr.elapsed_accel_time = self.mr.segment_accel_time / 2.0;
            self.mr.segment_count = self.mr.segments as u32;
            self.mr.microseconds = usec(self.mr.segment_move_time);
            self.mr.section_state = MoveState::Run1;
        }
        if self.mr.section_state == MoveState::Run1 {
            // concave half: V = Ve + Jm*T^2/2
            self.mr.segment_velocity = self.mr.entry_velocity
                + self.mr.elapsed_accel_time.powi(2) * self.mr.jerk_div2;
            if self.exec_aline_segment(false) == SegmentOutcome::Complete {
                self.mr.elapsed_accel_time = self.mr.segment_accel_time / 2.0;
                self.mr.segment_count = self.mr.segments as u32;
                self.mr.section_state = MoveState::Run2;
            }
            return ExecOutcome::Again;
        }
        if self.mr.section_state == MoveState::Run2 {
            // convex half: V = Vh + As*T - Jm*T^2/2
            self.mr.segment_velocity = self.mr.midpoint_velocity
                + self.mr.elapsed_accel_time * self.mr.midpoint_acceleration
                - self.mr.elapsed_accel_time.powi(2) * self.mr.jerk_div2;
            if self.exec_aline_segment(false) == SegmentOutcome::Complete {
                if self.mr.body_length < self.settings.min_line_length
                    && self.mr.tail_length < self.settings.min_line_length
                {
                    return ExecOutcome::Done;
                }
                self.mr.move_state = MoveState::Body;
                self.mr.section_state = MoveState::New;
            }
        }
        ExecOutcome::Again
    }

    /// Cruise section: constant velocity, evenly sliced.
    fn exec_aline_body(&mut self) -> ExecOutcome {
        if self.mr.section_state == MoveState::New {
            if self.mr.body_length < self.settings.epsilon {
                self.mr.move_state = MoveState::Tail;
                return self.exec_aline_tail();
            }
            self.mr.move_time = self.mr.body_length / self.mr.cruise_velocity;
            self.mr.segments = (usec(self.mr.move_time) / self.settings.estd_segment_usec).ceil();
            self.mr.segment_move_time = self.mr.move_time / self.mr.segments;
            self.mr.segment_velocity = self.mr.cruise_velocity;
            self.mr.segment_count = self.mr.segments as u32;
            self.mr.microseconds = usec(self.mr.segment_move_time);
            self.mr.section_state = MoveState::Run;
        }
        if self.mr.section_state == MoveState::Run {
            if self.exec_aline_segment(false) == SegmentOutcome::Complete {
                if self.mr.tail_length < self.settings.min_line_length {
                    return ExecOutcome::Done;
                }
                self.mr.move_state = MoveState::Tail;
                self.mr.section_state = MoveState::New;
            }
        }
        ExecOutcome::Again
    }

    /// Deceleration section: the head mirrored, with rounding correction
    /// armed on the final segment.
    fn exec_aline_tail(&mut self) -> ExecOutcome {
        if self.mr.section_state == MoveState::New {
            if self.mr.tail_length < self.settings.epsilon {
                return ExecOutcome::Done;
            }
            self.mr.midpoint_velocity = (self.mr.cruise_velocity + self.mr.exit_velocity) / 2.0;
            self.mr.move_time = self.mr.tail_length / self.mr.midpoint_velocity;
            self.mr.accel_time =
                2.0 * ((self.mr.cruise_velocity - self.mr.exit_velocity) / self.mr.jerk).sqrt();
            self.mr.midpoint_acceleration =
                2.0 * (self.mr.cruise_velocity - self.mr.exit_velocity) / self.mr.accel_time;
            self.mr.segments =
                (usec(self.mr.move_time) / (2.0 * self.settings.estd_segment_usec)).ceil();
            self.mr.segment_move_time = self.mr.move_time / (2.0 * self.mr.segments);
            self.mr.segment_accel_time = self.mr.accel_time / (2.0 * self.mr.segments);
            self.mr.elapsed_accel_time = self.mr.segment_accel_time / 2.0;
            self.mr.segment_count = self.mr.segments as u32;
            self.mr.microseconds = usec(self.mr.segment_move_time);
            self.mr.section_state = MoveState::Run1;
        }
        if self.mr.section_state == MoveState::Run1 {
            self.mr.segment_velocity = self.mr.cruise_velocity
                - self.mr.elapsed_accel_time.powi(2) * self.mr.jerk_div2;
            if self.exec_aline_segment(false) == SegmentOutcome::Complete {
                self.mr.elapsed_accel_time = self.mr.segment_accel_time / 2.0;
                self.mr.segment_count = self.mr.segments as u32;
                self.mr.section_state = MoveState::Run2;
            }
            return ExecOutcome::Again;
        }
        if self.mr.section_state == MoveState::Run2 {
            self.mr.segment_velocity = self.mr.midpoint_velocity
                - self.mr.elapsed_accel_time * self.mr.midpoint_acceleration
                + self.mr.elapsed_accel_time.powi(2) * self.mr.jerk_div2;
            if self.exec_aline_segment(true) == SegmentOutcome::Complete {
                return ExecOutcome::Done;
            }
        }
        ExecOutcome::Again
    }

    /// Prepare exactly one segment for the steppers.
    ///
    /// Scales the unit vector by the segment velocity to produce the
    /// per-axis target, converts the travel to motor steps, and hands the
    /// program to the driver. The final segment of a normal move snaps to
    /// the saved endpoint instead, absorbing the rounding accumulated by
    /// every segment before it; a move heading into a hold skips that
    /// correction because its endpoint is no longer where it will stop.
    fn exec_aline_segment(&mut self, correction: bool) -> SegmentOutcome {
        let correct_final = correction
            && self.mr.segment_count == 1
            && self.machine.motion_state == MotionState::Run
            && self.machine.cycle_state == CycleState::Started;
        let mut travel = [0.0; AXES];
        for i in 0..AXES {
            if correct_final {
                self.mr.target[i] = self.mr.endpoint[i];
            } else {
                self.mr.target[i] = self.mr.position[i]
                    + self.mr.unit[i] * self.mr.segment_velocity * self.mr.segment_move_time;
            }
            travel[i] = self.mr.target[i] - self.mr.position[i];
        }
        let steps = self
            .kinematics
            .inverse(&travel, &self.settings.steps_per_unit, self.mr.microseconds);
        if self.driver.prep_line(steps, self.mr.microseconds).is_ok() {
            self.mr.position = self.mr.target;
        }
        self.mr.elapsed_accel_time += self.mr.segment_accel_time;
        self.mr.segment_count -= 1;
        if self.mr.segment_count == 0 {
            return SegmentOutcome::Complete;
        }
        SegmentOutcome::Again
    }

    /// Free the run block; ends the cycle when the queue drains.
    pub(crate) fn finish_run_block(&mut self) {
        if self.mb.free_run() {
            self.end_cycle();
        }
    }

    pub(crate) fn begin_cycle(&mut self) {
        self.machine.cycle_state = CycleState::Started;
        debug!("cycle started");
    }

    pub(crate) fn end_cycle(&mut self) {
        self.machine.cycle_state = CycleState::Off;
        self.machine.motion_state = MotionState::Stop;
        self.mr.segment_velocity = 0.0;
        debug!("cycle ended");
    }
}
