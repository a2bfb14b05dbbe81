// tests/test_config.rs — JSON configuration and runtime method selection.

mod common;

use common::{init_tracing, plaid, translating};
use denseflow::error::FlowError;
use denseflow::estimator::EstimatorConfig;
use denseflow::fleet::FleetJepsonParams;
use denseflow::lucas::{GradientMethod, LucasKanadeParams, Regularization};
use denseflow::singh::SinghParams;
use denseflow::uras::UrasParams;

#[test]
fn json_round_trip_keeps_every_method() {
    let configs = [
        EstimatorConfig::LucasKanade(LucasKanadeParams {
            gradient: GradientMethod::Sobel3D { sigma_s: 1.0, sigma_t: 0.5 },
            regularization: Regularization::Reference,
            tau: 5.0,
            normals: true,
        }),
        EstimatorConfig::Uras(UrasParams {
            region: 4,
            ..Default::default()
        }),
        EstimatorConfig::Singh(SinghParams::default()),
        EstimatorConfig::FleetJepson(FleetJepsonParams {
            tau: 1.25,
            ..Default::default()
        }),
    ];
    for cfg in configs {
        let text = cfg.to_json().unwrap();
        assert_eq!(EstimatorConfig::from_json(&text).unwrap(), cfg, "{text}");
    }
}

#[test]
fn tags_are_snake_case() {
    let cfg = EstimatorConfig::LucasKanade(LucasKanadeParams {
        gradient: GradientMethod::Sobel2D { sigma_s: 1.0, sigma_t: 1.0 },
        regularization: Regularization::Gaussian2D { sigma_w: 2.0 },
        ..Default::default()
    });
    let text = cfg.to_json().unwrap();
    assert!(text.contains(r#""method": "lucas_kanade""#), "{text}");
    assert!(text.contains(r#""kind": "sobel_2d""#), "{text}");
    assert!(text.contains(r#""kind": "gaussian_2d""#), "{text}");

    let fj = EstimatorConfig::FleetJepson(FleetJepsonParams::default()).to_json().unwrap();
    assert!(fj.contains(r#""method": "fleet_jepson""#));
}

#[test]
fn omitted_fields_take_defaults() {
    let cfg = EstimatorConfig::from_json(r#"{ "method": "uras", "region": 8 }"#).unwrap();
    assert_eq!(
        cfg,
        EstimatorConfig::Uras(UrasParams {
            region: 8,
            ..Default::default()
        })
    );

    let cfg = EstimatorConfig::from_json(
        r#"{ "method": "lucas_kanade", "gradient": { "kind": "frame_difference", "sigma_s": 1.0 } }"#,
    )
    .unwrap();
    let EstimatorConfig::LucasKanade(p) = cfg else { panic!("wrong method") };
    assert_eq!(p.gradient, GradientMethod::FrameDifference { sigma_s: 1.0 });
    assert_eq!(p.tau, LucasKanadeParams::default().tau);
}

#[test]
fn unknown_method_is_a_config_error() {
    assert!(matches!(
        EstimatorConfig::from_json(r#"{ "method": "horn_schunck" }"#),
        Err(FlowError::Config(_))
    ));
    assert!(matches!(EstimatorConfig::from_json("not json"), Err(FlowError::Config(_))));
}

#[test]
fn build_validates_parameters() {
    let bad = EstimatorConfig::Singh(SinghParams {
        subwindow: 9,
        ..Default::default()
    });
    assert!(matches!(bad.build::<u8>(), Err(FlowError::InvalidParameter(_))));

    let bad = EstimatorConfig::FleetJepson(FleetJepsonParams {
        sigma_s: 0.0,
        ..Default::default()
    });
    assert!(matches!(bad.build::<f32>(), Err(FlowError::InvalidParameter(_))));
}

#[test]
fn built_estimators_run_through_the_trait() {
    init_tracing();
    for cfg in [
        EstimatorConfig::LucasKanade(LucasKanadeParams::default()),
        EstimatorConfig::Uras(UrasParams::default()),
        EstimatorConfig::Singh(SinghParams::default()),
    ] {
        let estimator = cfg.build::<f32>().unwrap();
        let support = estimator.support();
        let stack = translating(40, 40, support, (0.4, 0.25), plaid);
        let est = estimator.estimate(&stack, support / 2).unwrap();
        assert_eq!(est.report.estimator, estimator.name());
        assert_eq!(est.report.cells, 40 * 40);
    }
}
