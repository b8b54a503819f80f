//! End-to-end tests of the acquisition-to-storage pipeline.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sentinel::acquisition::simulated::{DeviceScript, ScriptedFactory};
use sentinel::acquisition::ScanRead;
use sentinel::relay::gpio::{PinEvent, RecordingPins};
use sentinel::storage::{inspect, MemoryStore};
use sentinel::{Sentinel, SentinelConfig};

/// Two configurations: `open` (A, B -> sum) and `load` (A -> twice).
fn write_config(dir: &Path, database_dir: &Path, poll_ms: u64) -> SentinelConfig {
    let config = serde_json::json!({
        "DatabaseConfig": {
            "Name": "rig",
            "Directory": database_dir,
            "WriteIntervalMs": 25,
            "ChangeInterval": 0
        },
        "MeasurementConfig": [
            {
                "Name": "open",
                "ScanRateHz": 100.0,
                "Channels": { "0": "A", "1": "B" },
                "Measurements": { "sum": "A + B", "ratio": "A / B" },
                "OutputState": true
            },
            {
                "Name": "load",
                "ScanPeriodMs": 10.0,
                "Channels": { "0": "A" },
                "Measurements": { "twice": "2 * A" }
            }
        ],
        "MeasurementControl": {
            "MeasConfOutputGpio": [29, 31, 33],
            "PollIntervalMs": poll_ms,
            "DriveTimeMs": 1,
            "FlybackTimeMs": 1
        },
        "Logging": { "Level": "warn", "Format": "compact" }
    });
    let path = dir.join("sentinel.json");
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    SentinelConfig::load_from(&path).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simulated_hat_run_writes_csv_tables() {
    let dir = tempfile::tempdir().unwrap();
    let databases = dir.path().join("data");
    let config = write_config(dir.path(), &databases, 20);

    let sentinel = Sentinel::builder(config)
        .with_output_pins(Box::new(RecordingPins::new()))
        .start()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = sentinel.shutdown().await.unwrap();

    assert!(report.health.batches > 0);
    assert_eq!(report.health.calc_failures, 0);

    let summaries = inspect(&databases).unwrap();
    assert_eq!(summaries.len(), 1);
    let tables: Vec<&str> = summaries[0].tables.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(tables, vec!["load_twice", "open_ratio", "open_sum"]);

    let sum = summaries[0].tables.iter().find(|t| t.name == "open_sum").unwrap();
    assert!(sum.rows > 0);
    assert_eq!(sum.corrupt_rows, 0);
    assert_eq!(sum.rows, report.storage.flush.rows / 2);
    // Nothing acquired for the inactive configuration.
    assert_eq!(summaries[0].tables[0].rows, 0);
}

#[tokio::test]
async fn scripted_batches_arrive_in_order_and_switch_tables() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), dir.path(), 10);

    let script = DeviceScript::new();
    script.push(ScanRead::samples(vec![1.0, 2.0, 3.0, 4.0]));
    let store = MemoryStore::new();
    let pins = RecordingPins::new();
    let log = pins.log();

    let sentinel = Sentinel::builder(config)
        .with_device_factory(Arc::new(ScriptedFactory::new(Arc::clone(&script))))
        .with_store(Box::new(store.clone()))
        .with_output_pins(Box::new(pins))
        .start()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    sentinel.switch_to(1).await.unwrap();
    script.push(ScanRead::samples(vec![5.0, 6.0, 7.0]));
    tokio::time::sleep(Duration::from_millis(60)).await;

    let report = sentinel.shutdown().await.unwrap();

    let sum = store.rows("open_sum");
    assert_eq!(sum.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![3.0, 7.0]);
    assert!(sum[0].0 < sum[1].0);
    assert!((sum[1].0 - sum[0].0 - 0.01).abs() < 1e-5);

    let twice = store.rows("load_twice");
    assert_eq!(
        twice.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
        vec![10.0, 12.0, 14.0]
    );
    assert!(twice.windows(2).all(|pair| pair[0].0 < pair[1].0));

    // Two loop generations, never overlapping, device released at the end.
    assert_eq!(script.claims().opens(), 2);
    assert!(!script.claims().is_claimed());
    assert_eq!(script.scans_started(), vec![(0b11, 100.0), (0b1, 100.0)]);

    assert_eq!(report.relay_sequences, 2);
    assert_eq!(log.events().last(), Some(&PinEvent::Release));
    assert!(store.is_closed());
}

#[tokio::test]
async fn shutdown_flushes_values_still_in_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = write_config(dir.path(), dir.path(), 10);
    // Longer than the test runs: only the final write-back can store data.
    config.database_config.write_interval_ms = 60_000;

    let script = DeviceScript::new();
    script.push(ScanRead::samples(vec![0.5, 0.25]));
    let store = MemoryStore::new();

    let sentinel = Sentinel::builder(config)
        .with_device_factory(Arc::new(ScriptedFactory::new(Arc::clone(&script))))
        .with_store(Box::new(store.clone()))
        .with_output_pins(Box::new(RecordingPins::new()))
        .start()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.rows("open_sum").is_empty());

    sentinel.shutdown().await.unwrap();

    assert_eq!(store.rows("open_sum").len(), 1);
    assert_eq!(store.rows("open_ratio")[0].1, 2.0);
}
