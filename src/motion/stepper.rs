// src/motion/stepper.rs - Step-pulse timer front end
//
// The exec tier hands the driver one prepared program at a time (a line
// segment, a dwell, or a null placeholder) through a single prep slot.
// The loader moves the prep slot into the per-axis timers as soon as the
// previous program finishes, then raises the exec request so the next
// segment can be prepared while the current one pulses out. That double
// buffering is what keeps the pulse train gapless.

use thiserror::Error;

use super::MOTORS;

#[derive(Debug, Error)]
pub enum DriverError {
    /// The prep slot already holds a program. The exec tier retries after
    /// the loader consumes it.
    #[error("prep slot occupied")]
    PrepBusy,
}

/// Contract between the motion core and the timer/GPIO layer.
///
/// `prep_*` load the next step program; `request_exec` models the
/// software-interrupt line that asks the exec tier to run the dispatcher
/// at its next opportunity.
pub trait StepDriver {
    fn prep_line(&mut self, steps: [f64; MOTORS], microseconds: f64) -> Result<(), DriverError>;
    fn prep_dwell(&mut self, microseconds: f64) -> Result<(), DriverError>;
    /// Load a no-op program. Non-motion blocks (M codes) use this to keep
    /// the loader pipeline primed.
    fn prep_null(&mut self);
    fn request_exec(&mut self);
    /// Consume a pending exec request, if any.
    fn take_exec_request(&mut self) -> bool;
    /// True while the prep slot holds an unconsumed program.
    fn prep_busy(&self) -> bool;
    /// True while a program is loaded or prepped.
    fn is_busy(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
enum Prep {
    Line {
        steps: [i64; MOTORS],
        microseconds: f64,
    },
    Dwell {
        microseconds: f64,
    },
    Null,
}

/// One software timer per motor: a period in microseconds and a down
/// counter, stepping on each timer overflow until the counter drains.
#[derive(Debug, Clone, Copy, Default)]
struct AxisTimer {
    active: bool,
    counter: i64,
    period_us: f64,
    phase_us: f64,
    direction: i8,
}

/// Software implementation of the timer front end.
///
/// Stands in for the hardware timers during tests and host-side dry runs:
/// `tick` advances simulated time, pulses each active axis at its armed
/// period, and raises the exec request when a program completes. Net
/// pulses per motor accumulate in `position_steps`, so a test can check
/// the commanded distance actually reached the motors.
#[derive(Debug)]
pub struct VirtualStepDriver {
    axes: [AxisTimer; MOTORS],
    prep: Option<Prep>,
    moving: bool,
    dwell_remaining_us: f64,
    exec_requested: bool,
    position_steps: [i64; MOTORS],
    /// Fractional steps carried between segments so rounding never loses
    /// distance.
    residual: [f64; MOTORS],
    /// Axis-local rate limit: shortest allowed step period (0 = none).
    min_period_us: [f64; MOTORS],
}

impl Default for VirtualStepDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualStepDriver {
    pub fn new() -> Self {
        Self {
            axes: [AxisTimer::default(); MOTORS],
            prep: None,
            moving: false,
            dwell_remaining_us: 0.0,
            exec_requested: false,
            position_steps: [0; MOTORS],
            residual: [0.0; MOTORS],
            min_period_us: [0.0; MOTORS],
        }
    }

    pub fn with_rate_limits(min_period_us: [f64; MOTORS]) -> Self {
        let mut driver = Self::new();
        driver.min_period_us = min_period_us;
        driver
    }

    /// Net signed pulses emitted per motor since construction.
    pub fn position_steps(&self) -> [i64; MOTORS] {
        self.position_steps
    }

    pub fn reset_position(&mut self) {
        self.position_steps = [0; MOTORS];
        self.residual = [0.0; MOTORS];
    }

    /// Advance simulated time. Loads the prep slot when the timers are
    /// idle and pulses every active axis that overflows within `dt_us`.
    pub fn tick(&mut self, dt_us: f64) {
        if !self.moving {
            self.load_prep();
        }
        if !self.moving {
            return;
        }

        if self.dwell_remaining_us > 0.0 {
            self.dwell_remaining_us -= dt_us;
            if self.dwell_remaining_us <= 0.0 {
                self.dwell_remaining_us = 0.0;
                self.finish_program();
            }
            return;
        }

        let mut any_active = false;
        for (m, axis) in self.axes.iter_mut().enumerate() {
            if !axis.active {
                continue;
            }
            axis.phase_us += dt_us;
            while axis.phase_us >= axis.period_us && axis.counter > 0 {
                axis.phase_us -= axis.period_us;
                axis.counter -= 1;
                self.position_steps[m] += axis.direction as i64;
            }
            if axis.counter == 0 {
                axis.active = false;
            } else {
                any_active = true;
            }
        }
        if !any_active {
            self.finish_program();
        }
    }

    fn finish_program(&mut self) {
        self.moving = false;
        // chain straight into the next program, then ask for more work
        self.load_prep();
        self.exec_requested = true;
    }

    fn load_prep(&mut self) {
        let Some(prep) = self.prep.take() else {
            return;
        };
        match prep {
            Prep::Line {
                steps,
                microseconds,
            } => {
                let mut armed = false;
                for (m, &count) in steps.iter().enumerate() {
                    let axis = &mut self.axes[m];
                    if count == 0 {
                        axis.active = false;
                        continue;
                    }
                    let pulses = count.abs();
                    let mut period = microseconds / pulses as f64;
                    if self.min_period_us[m] > 0.0 && period < self.min_period_us[m] {
                        period = self.min_period_us[m];
                    }
                    axis.active = true;
                    axis.counter = pulses;
                    axis.period_us = period;
                    axis.phase_us = 0.0;
                    axis.direction = if count > 0 { 1 } else { -1 };
                    armed = true;
                }
                self.moving = armed;
                if !armed {
                    // segment rounded to zero pulses on every motor
                    self.exec_requested = true;
                }
            }
            Prep::Dwell { microseconds } => {
                self.dwell_remaining_us = microseconds;
                self.moving = microseconds > 0.0;
                if !self.moving {
                    self.exec_requested = true;
                }
            }
            Prep::Null => {
                self.exec_requested = true;
            }
        }
        // prep slot is free again; pull the next segment down
        self.exec_requested = true;
    }
}

impl StepDriver for VirtualStepDriver {
    fn prep_line(&mut self, steps: [f64; MOTORS], microseconds: f64) -> Result<(), DriverError> {
        if self.prep.is_some() {
            return Err(DriverError::PrepBusy);
        }
        let mut program = [0i64; MOTORS];
        for m in 0..MOTORS {
            let exact = steps[m] + self.residual[m];
            let rounded = exact.round();
            self.residual[m] = exact - rounded;
            program[m] = rounded as i64;
        }
        self.prep = Some(Prep::Line {
            steps: program,
            microseconds,
        });
        Ok(())
    }

    fn prep_dwell(&mut self, microseconds: f64) -> Result<(), DriverError> {
        if self.prep.is_some() {
            return Err(DriverError::PrepBusy);
        }
        self.prep = Some(Prep::Dwell { microseconds });
        Ok(())
    }

    fn prep_null(&mut self) {
        if self.prep.is_none() {
            self.prep = Some(Prep::Null);
        }
    }

    fn request_exec(&mut self) {
        self.exec_requested = true;
    }

    fn take_exec_request(&mut self) -> bool {
        std::mem::take(&mut self.exec_requested)
    }

    fn prep_busy(&self) -> bool {
        self.prep.is_some()
    }

    fn is_busy(&self) -> bool {
        self.moving || self.prep.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_program_pulses_each_motor_at_its_own_rate() {
        let mut driver = VirtualStepDriver::new();
        driver.prep_line([100.0, -50.0, 0.0, 0.0], 10_000.0).unwrap();
        assert!(driver.is_busy());

        for _ in 0..101 {
            driver.tick(100.0);
        }
        assert_eq!(driver.position_steps(), [100, -50, 0, 0]);
        assert!(!driver.is_busy());
        assert!(driver.take_exec_request());
    }

    #[test]
    fn prep_slot_rejects_a_second_program() {
        let mut driver = VirtualStepDriver::new();
        driver.prep_line([10.0, 0.0, 0.0, 0.0], 1000.0).unwrap();
        assert!(matches!(
            driver.prep_line([10.0, 0.0, 0.0, 0.0], 1000.0),
            Err(DriverError::PrepBusy)
        ));
        // loader consumes the slot on the first tick
        driver.tick(1.0);
        assert!(!driver.prep_busy());
        assert!(driver.prep_line([10.0, 0.0, 0.0, 0.0], 1000.0).is_ok());
    }

    #[test]
    fn fractional_steps_carry_between_segments() {
        let mut driver = VirtualStepDriver::new();
        // 10 segments of 0.4 steps each: 4 whole pulses must come out
        for _ in 0..10 {
            driver.prep_line([0.4, 0.0, 0.0, 0.0], 1000.0).unwrap();
            for _ in 0..11 {
                driver.tick(100.0);
            }
        }
        assert_eq!(driver.position_steps()[0], 4);
    }

    #[test]
    fn dwell_times_out_and_requests_exec() {
        let mut driver = VirtualStepDriver::new();
        driver.prep_dwell(5_000.0).unwrap();
        driver.tick(1.0);
        driver.take_exec_request();
        assert!(driver.is_busy());
        for _ in 0..5 {
            driver.tick(1_000.0);
        }
        assert!(!driver.is_busy());
        assert!(driver.take_exec_request());
        assert_eq!(driver.position_steps(), [0; MOTORS]);
    }

    #[test]
    fn null_program_keeps_the_pipeline_moving() {
        let mut driver = VirtualStepDriver::new();
        driver.prep_null();
        assert!(driver.prep_busy());
        driver.tick(1.0);
        assert!(!driver.prep_busy());
        assert!(driver.take_exec_request());
        assert!(!driver.is_busy());
    }

    #[test]
    fn rate_limit_stretches_a_too_fast_segment() {
        let mut driver = VirtualStepDriver::with_rate_limits([50.0, 0.0, 0.0, 0.0]);
        // 100 steps in 1000us asks for a 10us period; the limit holds it
        // at 50us so the program takes 5000us instead
        driver.prep_line([100.0, 0.0, 0.0, 0.0], 1000.0).unwrap();
        driver.tick(1.0);
        for _ in 0..20 {
            driver.tick(100.0);
        }
        assert!(driver.is_busy());
        for _ in 0..40 {
            driver.tick(100.0);
        }
        assert!(!driver.is_busy());
        assert_eq!(driver.position_steps()[0], 100);
    }
}
