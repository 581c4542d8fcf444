// Integration tests for look-ahead planning: junction chaining, exact
// stop mode and the planned-block invariants.

use stepcore::motion::{Block, MoveType};
use stepcore::{MotionController, MotionSettings, PathControl, PlanError, VirtualStepDriver};

const FEED: f64 = 600.0; // mm/min

fn controller() -> MotionController<VirtualStepDriver> {
    MotionController::new(MotionSettings::default(), VirtualStepDriver::new())
}

fn minutes(length: f64, feed: f64) -> f64 {
    length / feed
}

fn aline_blocks(controller: &MotionController<VirtualStepDriver>) -> Vec<Block> {
    controller
        .planned_blocks()
        .into_iter()
        .filter(|b| b.move_type == MoveType::Aline)
        .collect()
}

fn assert_block_invariants(blocks: &[Block]) {
    for b in blocks {
        assert!(
            0.0 <= b.entry_velocity
                && b.entry_velocity <= b.cruise_velocity + 1e-9
                && b.exit_velocity <= b.cruise_velocity + 1e-9
                && b.exit_velocity >= 0.0,
            "velocity ordering violated on line {}: {} <= {} >= {}",
            b.line_number,
            b.entry_velocity,
            b.cruise_velocity,
            b.exit_velocity
        );
        let sum = b.head_length + b.body_length + b.tail_length;
        assert!(
            (sum - b.length).abs() < 0.05,
            "section lengths {} do not sum to {} on line {}",
            sum,
            b.length,
            b.line_number
        );
        let norm: f64 = b.unit.iter().map(|u| u * u).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9, "unit vector not normalized");
    }
    for pair in blocks.windows(2) {
        assert!(pair[0].exit_velocity <= pair[0].exit_vmax + 1e-9);
        assert!(
            (pair[1].entry_velocity - pair[0].exit_velocity).abs() < 1e-9,
            "entry/exit mismatch between lines {} and {}",
            pair[0].line_number,
            pair[1].line_number
        );
    }
}

#[test]
fn single_long_line_plans_a_full_trapezoid() {
    let mut c = controller();
    c.submit_aline([100.0, 0.0, 0.0, 0.0], minutes(100.0, FEED))
        .unwrap();

    let blocks = aline_blocks(&c);
    assert_eq!(blocks.len(), 1);
    let b = &blocks[0];
    assert_eq!(b.entry_velocity, 0.0);
    assert_eq!(b.exit_velocity, 0.0);
    assert!((b.cruise_velocity - 600.0).abs() < 1e-9);
    assert!(b.body_length > 0.0);
    assert!(b.head_length > 0.0);
    assert!(b.tail_length > 0.0);
    assert!((b.head_length + b.body_length + b.tail_length - 100.0).abs() < 1e-9);
    assert_eq!(c.get_plan_position(), [100.0, 0.0, 0.0, 0.0]);
}

#[test]
fn short_line_below_transition_splits_symmetrically() {
    let mut c = controller();
    c.submit_aline([0.8, 0.0, 0.0, 0.0], minutes(0.8, 400.0))
        .unwrap();

    let b = &aline_blocks(&c)[0];
    assert!((b.head_length - 0.4).abs() < 1e-9);
    assert!((b.tail_length - 0.4).abs() < 1e-9);
    assert_eq!(b.body_length, 0.0);
    // cruise is what half the line buys under the jerk limit:
    // (0.4)^(2/3) * (5e7)^(1/3)
    let expected = 0.4f64.powf(2.0 / 3.0) * 50_000_000.0f64.cbrt();
    assert!((b.cruise_velocity - expected).abs() < 1e-6);
}

#[test]
fn collinear_moves_chain_at_cruise() {
    let mut c = controller();
    c.set_line_number(1);
    c.submit_aline([10.0, 0.0, 0.0, 0.0], minutes(10.0, FEED))
        .unwrap();
    c.set_line_number(2);
    c.submit_aline([20.0, 0.0, 0.0, 0.0], minutes(10.0, FEED))
        .unwrap();

    let blocks = aline_blocks(&c);
    assert_eq!(blocks.len(), 2);
    // straight junction: no deceleration between the blocks
    assert!((blocks[0].exit_velocity - 600.0).abs() < 1e-9);
    assert!((blocks[1].entry_velocity - 600.0).abs() < 1e-9);
    assert_eq!(blocks[0].tail_length, 0.0);
    assert_eq!(blocks[1].head_length, 0.0);
    assert_block_invariants(&blocks);
}

#[test]
fn right_angle_corner_slows_to_the_junction_limit() {
    let mut c = controller();
    c.submit_aline([10.0, 0.0, 0.0, 0.0], minutes(10.0, FEED))
        .unwrap();
    c.submit_aline([10.0, 10.0, 0.0, 0.0], minutes(10.0, FEED))
        .unwrap();

    let blocks = aline_blocks(&c);
    // delta = 0.05, cos(theta) = 0:
    // R = 0.05 * sqrt(0.5) / (1 - sqrt(0.5)), v = sqrt(R * 2e5)
    let radius = 0.05 * 0.5f64.sqrt() / (1.0 - 0.5f64.sqrt());
    let expected = (radius * 200_000.0).sqrt();
    assert!((blocks[0].exit_velocity - expected).abs() < 0.5);
    assert!((blocks[1].entry_velocity - expected).abs() < 0.5);
    assert!((expected - 155.4).abs() < 0.5);
    assert!(blocks[0].tail_length > 0.0);
    assert!(blocks[1].head_length > 0.0);
    assert_block_invariants(&blocks);
}

#[test]
fn reversal_junction_forces_a_full_stop() {
    let mut c = controller();
    c.submit_aline([10.0, 0.0, 0.0, 0.0], minutes(10.0, FEED))
        .unwrap();
    c.submit_aline([0.0, 0.0, 0.0, 0.0], minutes(10.0, FEED))
        .unwrap();

    let blocks = aline_blocks(&c);
    assert_eq!(blocks[1].entry_vmax, 0.0);
    assert_eq!(blocks[0].exit_velocity, 0.0);
    assert_eq!(blocks[1].entry_velocity, 0.0);
    assert_block_invariants(&blocks);
}

#[test]
fn exact_stop_mode_plans_independent_trapezoids() {
    let mut c = controller();
    c.set_path_control(PathControl::ExactStop);
    for i in 1..=3 {
        c.submit_aline([10.0 * i as f64, 0.0, 0.0, 0.0], minutes(10.0, FEED))
            .unwrap();
    }

    let blocks = aline_blocks(&c);
    assert_eq!(blocks.len(), 3);
    for b in &blocks {
        assert_eq!(b.exit_vmax, 0.0);
        assert_eq!(b.entry_velocity, 0.0);
        assert_eq!(b.exit_velocity, 0.0);
        assert!(!b.replannable);
        assert!(b.head_length > 0.0);
        assert!(b.body_length > 0.0);
        assert!(b.tail_length > 0.0);
    }
    assert_block_invariants(&blocks);
}

#[test]
fn mixed_path_keeps_all_planning_invariants() {
    let mut c = controller();
    let targets = [
        ([20.0, 0.0, 0.0, 0.0], 600.0),
        ([20.0, 5.0, 0.0, 0.0], 900.0),
        ([25.0, 5.0, 0.0, 0.0], 300.0),
        ([25.0, 5.0, 2.0, 0.0], 200.0),
        ([0.0, 0.0, 2.0, 0.0], 1200.0),
        ([0.0, 0.0, 0.0, 0.0], 400.0),
    ];
    let mut position = [0.0; 4];
    for (i, (target, feed)) in targets.iter().enumerate() {
        let length: f64 = target
            .iter()
            .zip(position.iter())
            .map(|(t, p)| (t - p) * (t - p))
            .sum::<f64>()
            .sqrt();
        c.set_line_number(i as u32 + 1);
        c.submit_aline(*target, minutes(length, *feed)).unwrap();
        position = *target;
    }
    let blocks = aline_blocks(&c);
    assert_eq!(blocks.len(), targets.len());
    assert_block_invariants(&blocks);
    assert_eq!(c.get_plan_position(), [0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn zero_moves_are_rejected_without_side_effects() {
    let mut c = controller();
    assert_eq!(
        c.submit_aline([10.0, 0.0, 0.0, 0.0], 0.0),
        Err(PlanError::ZeroDurationMove)
    );
    assert_eq!(
        c.submit_aline([0.0, 0.0, 0.0, 0.0], 0.1),
        Err(PlanError::ZeroLengthMove)
    );
    assert_eq!(
        c.submit_line([0.0, 0.0, 0.0, 0.0], 0.1),
        Err(PlanError::ZeroLengthMove)
    );
    assert!(c.planned_blocks().is_empty());
    assert_eq!(c.get_plan_position(), [0.0; 4]);
}

#[test]
fn full_ring_reports_back_pressure() {
    let mut settings = MotionSettings::default();
    settings.buffer_size = 4;
    let mut c = MotionController::new(settings, VirtualStepDriver::new());
    for i in 1..=3 {
        c.submit_aline([i as f64, 0.0, 0.0, 0.0], minutes(1.0, FEED))
            .unwrap();
    }
    assert!(!c.can_accept_move());
    assert_eq!(
        c.submit_aline([10.0, 0.0, 0.0, 0.0], minutes(7.0, FEED)),
        Err(PlanError::BufferFull)
    );
}
