use offsync::{
    config::AdaptiveConfig,
    engine::adaptive::{AdaptiveCompressionOptimizer, DeviceClass, NetworkCondition},
};

fn optimizer() -> AdaptiveCompressionOptimizer {
    AdaptiveCompressionOptimizer::new(AdaptiveConfig::default())
}

#[test]
fn fast_network_on_premium_device_biases_high() {
    let mut opt = optimizer();
    assert_eq!(opt.update_network_conditions(50_000.0, Some(10.0), Some(true)), NetworkCondition::Fast);
    assert_eq!(opt.update_device_resources(0.1, 8_192), DeviceClass::Premium);

    let rec = opt.get_recommended_level();
    assert_eq!(rec.network_factor, 1.0);
    assert_eq!(rec.device_factor, 1.0);
    assert_eq!(rec.recommended_level, 9);
    assert!(rec.reason.contains("fast network"));
}

#[test]
fn offline_busy_constrained_device_biases_low() {
    let mut opt = optimizer();
    assert_eq!(opt.update_network_conditions(0.0, None, None), NetworkCondition::Offline);
    assert_eq!(opt.update_device_resources(0.95, 256), DeviceClass::Constrained);
    opt.set_low_power_mode(true);

    let rec = opt.get_recommended_level();
    assert_eq!(rec.network_factor, 0.0);
    assert_eq!(rec.device_factor, 0.0);
    assert_eq!(rec.recommended_level, 1);
}

#[test]
fn offline_flag_overrides_speed() {
    let mut opt = optimizer();
    assert_eq!(
        opt.update_network_conditions(10_000.0, Some(20.0), Some(false)),
        NetworkCondition::Offline
    );
    assert_eq!(opt.get_recommended_level().network_factor, 0.0);
}

#[test]
fn network_factor_is_monotonic_in_speed() {
    let mut opt = optimizer();
    let mut previous = f64::NEG_INFINITY;
    for speed in [0.0, 100.0, 499.0, 500.0, 1_500.0, 3_000.0, 5_001.0, 15_000.0, 100_000.0] {
        opt.update_network_conditions(speed, None, Some(true));
        let factor = opt.get_recommended_level().network_factor;
        assert!(factor >= previous, "speed {speed}");
        assert!((0.0..=1.0).contains(&factor));
        previous = factor;
    }
}

#[test]
fn recommendation_stays_in_range() {
    let mut opt = optimizer();
    for speed in [0.0, 250.0, 1_000.0, 4_000.0, 9_000.0, 1e9] {
        for (cpu, mem) in [(0.0, 0), (0.6, 1_024), (1.0, 16_384), (0.2, u64::MAX)] {
            for low_power in [false, true] {
                opt.update_network_conditions(speed, None, Some(true));
                opt.update_device_resources(cpu, mem);
                opt.set_low_power_mode(low_power);
                let level = opt.get_recommended_level().recommended_level;
                assert!((1..=9).contains(&level));
            }
        }
    }
}

#[test]
fn small_change_waits_for_confidence() {
    let mut opt = optimizer();
    // unknown device, normal 3 Mbps link: (0.6 + 0.5) / 2 -> level 5, one away from 6
    opt.update_network_conditions(3_000.0, None, Some(true));
    assert_eq!(opt.get_recommended_level().recommended_level, 5);
    assert!(!opt.apply_recommendation());
    assert_eq!(opt.current_level(), 6);

    for _ in 0..8 {
        opt.record_compression_performance(6, 2.0, 0.6);
    }
    assert!(opt.get_recommended_level().confidence >= 0.8);
    assert!(opt.apply_recommendation());
    assert_eq!(opt.current_level(), 5);
    assert_eq!(opt.level_changes(), 1);

    assert!(!opt.apply_recommendation());
    assert_eq!(opt.level_changes(), 1);
}

#[test]
fn large_change_applies_without_confidence() {
    let mut opt = optimizer();
    opt.update_network_conditions(0.0, None, Some(false));
    opt.update_device_resources(0.95, 256);
    assert!(opt.get_recommended_level().confidence < 0.8);
    assert!(opt.apply_recommendation());
    assert_eq!(opt.current_level(), 1);
}

#[test]
fn performance_summary_groups_by_level() {
    let mut opt = optimizer();
    opt.record_compression_performance(3, 1.0, 0.4);
    opt.record_compression_performance(3, 3.0, 0.6);
    opt.record_compression_performance(9, 10.0, 0.8);

    let summary = opt.performance_summary();
    assert_eq!(summary.len(), 2);
    assert_eq!(summary[0].level, 3);
    assert_eq!(summary[0].samples, 2);
    assert_eq!(summary[0].average_ms, 2.0);
    assert!((summary[0].average_ratio - 0.5).abs() < 1e-9);
    assert_eq!(summary[1].level, 9);
}

#[test]
fn performance_history_is_bounded() {
    let mut opt = AdaptiveCompressionOptimizer::new(AdaptiveConfig {
        max_history: 5,
        ..AdaptiveConfig::default()
    });
    for _ in 0..20 {
        opt.record_compression_performance(4, 1.0, 0.5);
    }
    assert_eq!(opt.performance_summary()[0].samples, 5);
}
