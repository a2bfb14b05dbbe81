// tests/test_fleet.rs — Integration tests for the Fleet-Jepson phase estimator.

mod common;

use common::{flat, init_tracing, plaid, translating};
use denseflow::error::FlowError;
use denseflow::error_analysis::compare;
use denseflow::estimator::Estimator;
use denseflow::fleet::{FleetJepson, FleetJepsonParams};
use denseflow::flow::{FlowField, FlowVector};
use denseflow::report::Rejection;

const VELOCITY: (f32, f32) = (0.4, 0.25);
const EXPECTED: (f32, f32) = (0.4, -0.25);
const SIZE: usize = 48;

fn fleet() -> FleetJepson {
    FleetJepson::new(FleetJepsonParams::default()).unwrap()
}

fn truth() -> FlowField {
    let mut f = FlowField::new(SIZE, SIZE);
    for y in 0..SIZE {
        for x in 0..SIZE {
            f.set(x, y, FlowVector::full(EXPECTED.0, EXPECTED.1));
        }
    }
    f
}

// ===== Full velocity =====

#[test]
fn recovers_plaid_translation() {
    init_tracing();
    let fj = fleet();
    assert_eq!(fj.support(), 21);
    let stack = translating(SIZE, SIZE, 21, VELOCITY, plaid);
    let est = fj.estimate(&stack, 10).unwrap();

    assert!(est.field.count_full() >= 50, "{}", est.report);
    let stats = compare(&est.field, &truth()).unwrap();
    assert!(stats.mean < 1.0, "angular error {stats}");
}

#[test]
fn margin_covers_gabor_demodulation_and_fit() {
    let stack = translating(SIZE, SIZE, 21, VELOCITY, plaid);
    let est = fleet().estimate(&stack, 10).unwrap();
    // Gabor halfwidth ceil(3·2.5) = 8, central difference 2, fit window 2.
    assert_eq!(est.field.edge(), 12);
    for (x, y, v) in est.field.iter() {
        if x < 12 || y < 12 || x >= SIZE - 12 || y >= SIZE - 12 {
            assert!(v.is_invalid());
        }
    }
}

// ===== Component velocities =====

#[test]
fn normals_agree_with_the_true_motion() {
    let stack = translating(SIZE, SIZE, 21, VELOCITY, plaid);
    let filtered = fleet().filter(&stack, 10).unwrap();
    assert_eq!(filtered.channels.len(), 22);
    assert!(filtered.global_max > 0.0);

    let bank = filtered.normals(0.05, 2.5);
    let mut total = 0;
    let mut good = 0;
    for field in &bank.fields {
        for (_, _, v) in field.iter() {
            let FlowVector::Normal { vx, vy } = v else { continue };
            let m = vx.hypot(vy);
            if m < 1e-3 {
                continue;
            }
            total += 1;
            let along = (vx * EXPECTED.0 + vy * EXPECTED.1) / m;
            if (along - m).abs() < 0.1 {
                good += 1;
            }
        }
    }
    assert!(total > 1000, "only {total} normals");
    assert!(good as f32 > 0.7 * total as f32, "{good} of {total} normals consistent");
}

#[test]
fn stricter_tau_keeps_fewer_normals() {
    let stack = translating(SIZE, SIZE, 21, VELOCITY, plaid);
    let filtered = fleet().filter(&stack, 10).unwrap();
    let count = |tau: f32| {
        let bank = filtered.normals(0.05, tau);
        bank.fields.iter().map(|f| f.iter().filter(|(_, _, v)| !v.is_invalid()).count()).sum::<usize>()
    };
    assert!(count(0.5) < count(2.5));
}

// ===== Rejection paths =====

#[test]
fn flat_sequence_has_no_amplitude() {
    let est = fleet().estimate(&flat(32, 32, 21), 10).unwrap();
    assert_eq!(est.field.count_full(), 0);
    assert!(est.report.rejected(Rejection::LowAmplitude) > 0);
    assert_eq!(est.report.rejected(Rejection::PhaseInconsistent), 0);
    assert_eq!(est.report.rejected(Rejection::TooFewConstraints), 8 * 8);
}

#[test]
fn stack_shorter_than_the_gabor_support_fails() {
    let stack = translating(24, 24, 20, VELOCITY, plaid);
    assert!(matches!(
        fleet().estimate(&stack, 10),
        Err(FlowError::InsufficientFrames { required: 21, available: 20 })
    ));
}
