// Benchmark for look-ahead replanning and segment generation throughput
// Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use stepcore::{MotionController, MotionSettings, VirtualStepDriver};

fn zigzag_targets(count: usize) -> Vec<[f64; 4]> {
    (0..count)
        .map(|i| {
            let x = (i + 1) as f64 * 2.0;
            let y = if i % 2 == 0 { 0.0 } else { 5.0 };
            [x, y, 0.0, 0.0]
        })
        .collect()
}

fn bench_replanning(c: &mut Criterion) {
    let targets = zigzag_targets(20);
    c.bench_function("plan 20-move zigzag", |b| {
        b.iter(|| {
            let mut settings = MotionSettings::default();
            settings.buffer_size = 32;
            let mut controller = MotionController::new(settings, VirtualStepDriver::new());
            let mut position = [0.0f64; 4];
            for target in &targets {
                let length: f64 = target
                    .iter()
                    .zip(position.iter())
                    .map(|(t, p)| (t - p) * (t - p))
                    .sum::<f64>()
                    .sqrt();
                controller.submit_aline(*target, length / 600.0).unwrap();
                position = *target;
            }
            assert_eq!(controller.planned_blocks().len(), 20);
        });
    });
}

fn bench_segment_pipeline(c: &mut Criterion) {
    c.bench_function("execute 10mm move to pulses", |b| {
        b.iter(|| {
            let mut controller =
                MotionController::new(MotionSettings::default(), VirtualStepDriver::new());
            controller
                .submit_aline([10.0, 0.0, 0.0, 0.0], 10.0 / 600.0)
                .unwrap();
            for _ in 0..500 {
                controller.exec_pass().unwrap();
                controller.driver_mut().tick(5_000.0);
                if !controller.is_busy() && controller.planned_blocks().is_empty() {
                    break;
                }
            }
            let steps = controller.driver().position_steps()[0];
            assert!((steps - 800).abs() <= 1);
        });
    });
}

criterion_group!(benches, bench_replanning, bench_segment_pipeline);
criterion_main!(benches);
