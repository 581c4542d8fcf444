// src/motion/junction.rs - Corner velocity limits
//
// Tangent-circle cornering model: place a circle tangent to both line
// segments at the corner; the allowed junction deviation sets the circle
// radius, and the configured centripetal acceleration then bounds the
// velocity around it. Using the half-angle identity
// sin(theta/2) = sqrt((1 - cos(theta)) / 2) keeps the whole computation
// down to two square roots.

use super::AXES;

/// Maximum velocity through the corner between two consecutive unit
/// vectors. Collinear junctions are unbounded, full reversals are pinned
/// to zero.
pub fn junction_vmax(
    a_unit: &[f64; AXES],
    b_unit: &[f64; AXES],
    deviation: &[f64; AXES],
    junction_acceleration: f64,
) -> f64 {
    let mut costheta = 0.0;
    for i in 0..AXES {
        costheta -= a_unit[i] * b_unit[i];
    }
    if costheta < -0.99 {
        return f64::INFINITY; // straight line
    }
    if costheta > 0.99 {
        return 0.0; // reversal
    }
    let delta = junction_deviation(a_unit, b_unit, deviation);
    let sintheta_over2 = ((1.0 - costheta) / 2.0).sqrt();
    let radius = delta * sintheta_over2 / (1.0 - sintheta_over2);
    (radius * junction_acceleration).sqrt()
}

/// Composite junction deviation weighted by each axis's contribution to
/// the move. Axes with tighter deviation limits (a slow screw-driven Z
/// next to a belt XY, say) pull the composite down in proportion to how
/// much they participate in the corner.
pub fn junction_deviation(
    a_unit: &[f64; AXES],
    b_unit: &[f64; AXES],
    deviation: &[f64; AXES],
) -> f64 {
    let mut a_delta = 0.0;
    let mut b_delta = 0.0;
    for i in 0..AXES {
        a_delta += (a_unit[i] * deviation[i]).powi(2);
        b_delta += (b_unit[i] * deviation[i]).powi(2);
    }
    (a_delta.sqrt() + b_delta.sqrt()) / 2.0
}
