// src/motion/kinematics.rs - Cartesian travel to motor step mapping
use super::{AXES, MOTORS};

/// Inverse kinematics seam between the segment preparer and the step
/// driver.
///
/// Maps a Cartesian travel delta over `microseconds` to per-motor signed
/// step counts. Steps are fractional at this level; the step driver owns
/// the integer conversion and carries sub-step residue between segments.
/// The duration is passed through so the driver can apply axis-local rate
/// limits. Implementations must be pure: no allocation, no I/O.
pub trait Kinematics {
    fn inverse(
        &self,
        travel: &[f64; AXES],
        steps_per_unit: &[f64; MOTORS],
        microseconds: f64,
    ) -> [f64; MOTORS];
}

/// Direct axis-to-motor mapping, the default machine geometry.
#[derive(Debug, Clone, Copy, Default)]
pub struct CartesianKinematics;

impl Kinematics for CartesianKinematics {
    fn inverse(
        &self,
        travel: &[f64; AXES],
        steps_per_unit: &[f64; MOTORS],
        _microseconds: f64,
    ) -> [f64; MOTORS] {
        std::array::from_fn(|i| travel[i] * steps_per_unit[i])
    }
}

/// CoreXY belt geometry: motor A follows X+Y, motor B follows X-Y, the
/// remaining motors map directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreXyKinematics;

impl Kinematics for CoreXyKinematics {
    fn inverse(
        &self,
        travel: &[f64; AXES],
        steps_per_unit: &[f64; MOTORS],
        _microseconds: f64,
    ) -> [f64; MOTORS] {
        let mut steps = [0.0; MOTORS];
        steps[0] = (travel[0] + travel[1]) * steps_per_unit[0];
        steps[1] = (travel[0] - travel[1]) * steps_per_unit[1];
        for i in 2..MOTORS {
            steps[i] = travel[i] * steps_per_unit[i];
        }
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEPS: [f64; MOTORS] = [80.0, 80.0, 400.0, 100.0];

    #[test]
    fn cartesian_maps_each_axis_to_its_motor() {
        let kin = CartesianKinematics;
        let steps = kin.inverse(&[1.0, -2.0, 0.5, 0.0], &STEPS, 1000.0);
        assert_eq!(steps, [80.0, -160.0, 200.0, 0.0]);
    }

    #[test]
    fn corexy_mixes_x_and_y() {
        let kin = CoreXyKinematics;
        let steps = kin.inverse(&[1.0, 1.0, 0.0, 0.0], &STEPS, 1000.0);
        // pure +X+Y diagonal drives only motor A
        assert_eq!(steps[0], 160.0);
        assert_eq!(steps[1], 0.0);

        let steps = kin.inverse(&[1.0, -1.0, 0.25, 0.0], &STEPS, 1000.0);
        assert_eq!(steps[0], 0.0);
        assert_eq!(steps[1], 160.0);
        assert_eq!(steps[2], 100.0);
    }
}
