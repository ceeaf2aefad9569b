//! End-to-end simulation runs

use ringmesh_routing::{OverlayConfig, Topology};
use ringnode::{sim, Config, SimulationConfig};

fn overlay(half: usize, digit_bits: u32) -> OverlayConfig {
    OverlayConfig {
        leaf_set_half_size: half,
        digit_bits,
        ..OverlayConfig::default()
    }
}

#[tokio::test]
async fn test_simulation_with_churn() {
    let sim = SimulationConfig {
        nodes: 40,
        lookups: 80,
        failures: 4,
        seed: 1234,
        topology: Topology::Euclidean,
        settle_timeout_secs: 30,
    };

    let report = sim::run(&overlay(4, 4), &sim).await.unwrap();
    assert_eq!(report.joined, 40);
    assert_eq!(report.join_failures, 0);
    assert_eq!(report.rounds.len(), 2);
    for round in &report.rounds {
        assert_eq!(round.delivered, 80, "{}", report);
        assert!(round.is_clean(), "{}", report);
        assert!(round.max_hops <= 8);
    }
}

#[tokio::test]
async fn test_simulation_with_binary_digits() {
    let sim = SimulationConfig {
        nodes: 20,
        lookups: 40,
        failures: 0,
        seed: 77,
        topology: Topology::Uniform,
        settle_timeout_secs: 30,
    };

    let report = sim::run(&overlay(2, 1), &sim).await.unwrap();
    assert_eq!(report.rounds.len(), 1);
    assert_eq!(report.killed, 0);
    assert!(report.is_clean(), "{}", report);
}

#[tokio::test]
async fn test_single_node_owns_every_key() {
    let sim = SimulationConfig {
        nodes: 1,
        lookups: 10,
        failures: 0,
        seed: 3,
        ..SimulationConfig::default()
    };

    let report = sim::run(&OverlayConfig::default(), &sim).await.unwrap();
    assert_eq!(report.rounds[0].delivered, 10);
    assert_eq!(report.rounds[0].max_hops, 0);
}

#[tokio::test]
async fn test_report_serializes_to_json() {
    let sim = SimulationConfig {
        nodes: 6,
        lookups: 5,
        failures: 1,
        seed: 9,
        ..SimulationConfig::default()
    };
    let report = sim::run(&overlay(2, 4), &sim).await.unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["joined"], 6);
    assert_eq!(json["killed"], 1);
    assert_eq!(json["rounds"][0]["label"], "joined");
    assert_eq!(json["rounds"][1]["label"], "after-churn");
    assert_eq!(json["rounds"][1]["live_nodes"], 5);
}

#[test]
fn test_config_file_drives_simulation_settings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    Config::create_default(Some(path.clone())).unwrap();

    let config = Config::load(Some(path)).unwrap();
    assert_eq!(config.simulation, SimulationConfig::default());
    assert!(config.validate().is_ok());
}
