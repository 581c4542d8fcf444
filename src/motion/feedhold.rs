// src/motion/feedhold.rs - Feedhold state machine
//
// Hold sequencing across the two execution contexts:
//
//   Off -> Sync      feedhold() called while motion is running
//   Sync -> Plan     the executor finishes one more segment, giving the
//                    planner a quiescent runtime to work on
//   Plan -> Decel    plan_hold_callback() replans the runtime and the
//                    block list to decelerate to zero
//   Decel -> Hold    the deceleration lands at the hold point
//   Hold -> EndHold  cycle_start() re-asserted externally
//   EndHold -> Off   end_hold_callback() clears the gate and restarts
//
// The planner's rewrite of the runtime happens only in the Plan state,
// between executor calls; the one-segment-per-call contract is what makes
// that window safe.

use tracing::{debug, info};

use super::buffer::MoveState;
use super::planner::{target_length, target_velocity};
use super::runtime::ExecOutcome;
use super::stepper::StepDriver;
use super::{vector_length, MotionController, MotionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HoldState {
    #[default]
    Off,
    /// Waiting for the executor to reach a segment boundary.
    Sync,
    /// Waiting for the planner callback to replan for the hold.
    Plan,
    /// Decelerating to the hold point.
    Decel,
    /// Stopped, gated at the hold point.
    Hold,
    /// Release requested; waiting for the end-hold callback.
    EndHold,
}

/// Hold bookkeeping owned by the controller.
#[derive(Debug, Default)]
pub struct Feedhold {
    pub(crate) state: HoldState,
    pub(crate) report_pending: bool,
}

impl<D: StepDriver> MotionController<D> {
    /// Request a feedhold. Takes effect at the next segment boundary; a
    /// machine that is not moving has nothing to hold.
    pub fn feedhold(&mut self) {
        if self.hold.state == HoldState::Off && self.machine.motion_state == MotionState::Run {
            self.hold.state = HoldState::Sync;
            self.machine.motion_state = MotionState::Hold;
            debug!("feedhold requested");
        }
    }

    /// External cycle start. Starts a cycle when idle and releases a
    /// feedhold that has finished (or is finishing) its deceleration.
    pub fn cycle_start(&mut self) {
        self.machine.cycle_state = super::CycleState::Started;
        if matches!(self.hold.state, HoldState::Hold | HoldState::Decel) {
            self.hold.state = HoldState::EndHold;
        }
    }

    /// Foreground callback: replan the runtime and the block list for a
    /// hold. A no-op unless the executor has parked the hold in `Plan`.
    ///
    /// Two shapes, depending on where the braking distance lands:
    ///
    /// Case 1 - the stop fits inside the running block. The runtime is
    /// forced into a tail that sheds the current velocity over the braking
    /// length, and the block keeps only the remainder, becoming the
    /// release block.
    ///
    /// Case 2 - the stop overruns the running block. The runtime
    /// decelerates to a nonzero exit across what remains, then successor
    /// blocks are copied forward one slot and turned into deceleration
    /// blocks until one contains the stop; the leftover of that move
    /// becomes the release block.
    pub fn plan_hold_callback(&mut self) -> ExecOutcome {
        if self.hold.state != HoldState::Plan {
            return ExecOutcome::Noop;
        }
        let Some(bf) = self.mb.get_run() else {
            return ExecOutcome::Noop;
        };
        let mut bp = bf;

        let mut braking_velocity = self.mr.segment_velocity;
        let (recip_jerk, cubert_jerk) = {
            let block = self.mb.block(bp);
            (block.recip_jerk, block.cubert_jerk)
        };
        let mut braking_length = target_length(braking_velocity, 0.0, recip_jerk);
        let mut remaining_length = vector_length(&self.mb.block(bf).target, &self.mr.position);

        if braking_length < remaining_length {
            // Case 1: replan the runtime to a zero exit
            self.mr.move_state = MoveState::Tail;
            self.mr.section_state = MoveState::New;
            self.mr.tail_length = braking_length;
            self.mr.cruise_velocity = braking_velocity;
            self.mr.exit_velocity = 0.0;

            // the running block keeps the remainder and becomes the feed
            // release point
            let block = self.mb.block_mut(bp);
            block.length = remaining_length - braking_length;
            block.delta_vmax = target_velocity(0.0, block.length, block.cubert_jerk);
            block.entry_vmax = 0.0;
            block.move_state = MoveState::New;
        } else if self.mb.block(self.mb.next_of(bp)).move_state == MoveState::Off {
            // No successor to shed the overrun into: stop within the
            // remaining length even though that exceeds the braking
            // profile. The alternative is sailing past the end of the
            // queue.
            self.mr.move_state = MoveState::Tail;
            self.mr.section_state = MoveState::New;
            self.mr.tail_length = remaining_length;
            self.mr.cruise_velocity = braking_velocity;
            self.mr.exit_velocity = 0.0;

            let block = self.mb.block_mut(bp);
            block.length = 0.0;
            block.delta_vmax = 0.0;
            block.entry_vmax = 0.0;
            block.move_state = MoveState::New;
        } else {
            // Case 2: runtime decelerates to the lowest exit the block
            // allows, successors absorb the rest
            self.mr.move_state = MoveState::Tail;
            self.mr.section_state = MoveState::New;
            self.mr.tail_length = remaining_length;
            self.mr.cruise_velocity = braking_velocity;
            self.mr.exit_velocity =
                braking_velocity - target_velocity(0.0, remaining_length, cubert_jerk);

            braking_velocity = self.mr.exit_velocity;
            loop {
                let nx = self.mb.next_of(bp);
                self.mb.copy_block(bp, nx);
                let (block_length, block_recip, block_cubert) = {
                    let block = self.mb.block(bp);
                    (block.length, block.recip_jerk, block.cubert_jerk)
                };
                braking_length = target_length(braking_velocity, 0.0, block_recip);
                remaining_length = block_length - braking_length;
                self.mb.block_mut(bp).entry_vmax = braking_velocity;
                if braking_length > block_length {
                    // decel does not fit; cap the exit and keep shedding
                    let exit = braking_velocity
                        - target_velocity(0.0, block_length, block_cubert);
                    self.mb.block_mut(bp).exit_vmax = exit;
                    braking_velocity = exit;
                    bp = self.mb.next_of(bp);
                } else {
                    // this block contains the stop
                    let block = self.mb.block_mut(bp);
                    block.length = braking_length;
                    block.exit_vmax = 0.0;
                    bp = self.mb.next_of(bp);
                    break;
                }
                if bp == bf {
                    break; // cutout if the list wraps
                }
            }

            // the leftover of the stopped move is the release block
            let block = self.mb.block_mut(bp);
            block.entry_vmax = 0.0;
            block.length = remaining_length - braking_length;
            block.delta_vmax = target_velocity(0.0, block.length, block.cubert_jerk);
        }

        self.mb.block_mut(bp).hold_point = true;
        self.reset_replannable_list();
        if let Some(last) = self.mb.last() {
            self.plan_block_list(last);
        }
        self.hold.state = HoldState::Decel;
        info!(
            braking_velocity = self.mr.cruise_velocity,
            tail = self.mr.tail_length,
            "feedhold planned, decelerating"
        );
        ExecOutcome::Done
    }

    /// Foreground callback: finish releasing a hold after cycle start.
    pub fn end_hold_callback(&mut self) -> ExecOutcome {
        if self.hold.state != HoldState::EndHold {
            return ExecOutcome::Noop;
        }
        self.hold.state = HoldState::Off;
        let Some(bf) = self.mb.get_run() else {
            self.machine.motion_state = MotionState::Stop;
            return ExecOutcome::Noop;
        };
        self.machine.motion_state = MotionState::Run;
        self.mb.block_mut(bf).hold_point = false;
        self.driver.request_exec();
        info!("feedhold released");
        ExecOutcome::Done
    }

    /// The deceleration has landed at the hold point.
    pub(crate) fn enter_hold(&mut self) {
        self.machine.motion_state = MotionState::Hold;
        self.hold.state = HoldState::Hold;
        self.hold.report_pending = true;
        info!("feedhold complete, motion held");
    }

    pub fn hold_state(&self) -> HoldState {
        self.hold.state
    }

    /// A status report was queued by the hold landing; reading it clears
    /// the flag.
    pub fn take_status_report(&mut self) -> bool {
        std::mem::take(&mut self.hold.report_pending)
    }
}
