//! Sessions configured from `backfill.toml`.

use crate::common::*;
use backfill::{
    BackfillConfig, HistoryLoader, HistoryStore, Key, LoopExit, Timestamp, CONFIG_FILE_NAME,
};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn rfc3339(millis: u64) -> String {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap()
        .to_rfc3339()
}

#[test]
fn test_session_from_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    let content = format!(
        "[window]\n\
         start = \"{}\"\n\
         end = \"{}\"\n\
         \n\
         [loader]\n\
         initial_speed = 2.0\n\
         min_span_per_key_ms = 1\n\
         min_frames = 1.0\n\
         failure_retry_delay_ms = 0\n\
         fetch_partitions = 2\n",
        rfc3339(T0),
        rfc3339(T0 + LEN)
    );
    std::fs::write(&path, content).unwrap();

    let config = BackfillConfig::from_file(&path).unwrap();
    let window = config.timespan().unwrap();
    assert_eq!(window.start(), Timestamp::from_millis(T0));
    assert_eq!(window.end(), ts(LEN));
    assert_eq!(config.loader.fetch_partitions, 2);
    assert_eq!(config.loader.round_target_ms, 5_000);

    let store = Arc::new(HistoryStore::new(window));
    store.register_keys(&[Key::tag(1), Key::tag(2), Key::tag(3)]);
    let provider = provider_with_tags(&[1, 2, 3]);
    let loader = HistoryLoader::new(Arc::clone(&store), provider.clone(), config.loader).unwrap();

    loader.begin_loading();
    assert!(wait_until(Duration::from_secs(10), || !loader.is_loading()));
    assert_eq!(loader.last_exit(), Some(LoopExit::Complete));

    let mut first: Vec<Vec<u64>> = provider
        .history_calls()
        .into_iter()
        .filter(|(_, start, _)| *start == ts(1))
        .map(|(tags, _, _)| tags)
        .collect();
    first.sort();
    assert_eq!(first, vec![vec![1, 2], vec![3]]);
}

#[test]
fn test_default_file_is_written_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);

    BackfillConfig::write_default_if_missing(&path).unwrap();
    let config = BackfillConfig::from_file(&path).unwrap();
    assert!(config.window.is_none());
    assert!(config.timespan().is_err());

    std::fs::write(&path, "[loader]\nfetch_partitions = 4\n").unwrap();
    BackfillConfig::write_default_if_missing(&path).unwrap();
    let config = BackfillConfig::from_file(&path).unwrap();
    assert_eq!(config.loader.fetch_partitions, 4);
}

#[test]
fn test_invalid_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(&path, "[loader]\nmax_consecutive_failures = 0\n").unwrap();
    let err = BackfillConfig::from_file(&path).unwrap_err();
    assert!(err.to_string().contains("max_consecutive_failures"));
}
