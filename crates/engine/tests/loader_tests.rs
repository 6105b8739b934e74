//! Integration tests for HistoryLoader
//!
//! 1. **Initialization** - initial values, supervision, listener sequence
//! 2. **Buffering** - rounds, partitions, skipping, several workers
//! 3. **Termination** - failures, memory pressure, stop and restart

use backfill_core::{
    DailySnapshot, Key, Record, SupervisionEntity, SupervisionEvent, SupervisionStatus, TagValue,
    TagValueUpdate, Timespan, Timestamp, MILLIS_PER_DAY,
};
use backfill_engine::testing::{FixedMemoryProbe, ProviderOperation, ScriptedProvider};
use backfill_engine::{HistoryLoader, LoaderConfig, LoaderListener, LoopExit};
use backfill_storage::HistoryStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MIDNIGHT: u64 = 19_500 * MILLIS_PER_DAY;
const T0: u64 = MIDNIGHT + 12 * 60 * 60 * 1000;
const LEN: u64 = 10_000;

fn ts(offset: u64) -> Timestamp {
    Timestamp::from_millis(T0 + offset)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn window() -> Timespan {
    Timespan::new(ts(0), ts(LEN)).unwrap()
}

fn fast_config() -> LoaderConfig {
    LoaderConfig {
        initial_speed: 2.0,
        min_span_per_key_ms: 1,
        min_frames: 1.0,
        failure_retry_delay_ms: 0,
        claim_retry_interval_ms: 20,
        stop_timeout_ms: 5_000,
        ..LoaderConfig::default()
    }
}

/// Config that needs thousands of rounds to cover the window.
fn slow_config() -> LoaderConfig {
    LoaderConfig {
        initial_speed: 0.001,
        measurement_weight: 1_000_000.0,
        ..fast_config()
    }
}

/// One update per tag before the window, then one every second.
fn provider_with_tags(tags: &[u64]) -> Arc<ScriptedProvider> {
    let provider = Arc::new(ScriptedProvider::new());
    for &tag in tags {
        provider.add_updates(vec![TagValueUpdate::new(
            tag,
            TagValue::Int(0),
            Timestamp::from_millis(T0 - 1_000),
        )]);
        provider.add_updates((0..10).map(|i| {
            TagValueUpdate::new(tag, TagValue::Int(i as i64 + 1), ts(i * 1_000 + 500))
        }));
    }
    provider
}

fn new_loader(
    store: &Arc<HistoryStore>,
    provider: &Arc<ScriptedProvider>,
    config: LoaderConfig,
) -> (HistoryLoader, Arc<FixedMemoryProbe>) {
    let probe = Arc::new(FixedMemoryProbe::new(None));
    let loader = HistoryLoader::with_memory_probe(
        Arc::clone(store),
        Arc::clone(provider) as _,
        config,
        Arc::clone(&probe) as _,
    )
    .unwrap();
    (loader, probe)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn wait_for_exit(loader: &HistoryLoader) -> Option<LoopExit> {
    assert!(
        wait_until(Duration::from_secs(10), || !loader.is_loading()),
        "workers did not finish"
    );
    loader.last_exit()
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    failures: AtomicU32,
    out_of_memory: AtomicUsize,
}

impl LoaderListener for Recorder {
    fn on_initializing_starting(&self) {
        self.events.lock().push("starting".into());
    }

    fn on_initializing_progress(&self, message: &str) {
        self.events.lock().push(format!("progress: {}", message));
    }

    fn on_initializing_finished(&self) {
        self.events.lock().push("finished".into());
    }

    fn on_stopped_loading_due_to_out_of_memory(&self) {
        self.out_of_memory.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stopped_loading_due_to_failures(&self, failures: u32) {
        self.failures.store(failures, Ordering::SeqCst);
    }
}

// ============================================================================
// SECTION 1: Initialization
// ============================================================================

#[test]
fn test_loads_window_to_the_end() {
    init_tracing();
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1, 2]);
    store.register_keys(&[Key::tag(1), Key::tag(2)]);
    let (loader, _) = new_loader(&store, &provider, fast_config());

    loader.begin_loading();
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::Complete));
    assert!(store.is_loading_complete());

    let initial = provider.calls_of(ProviderOperation::InitialValues);
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].start, ts(0));

    let history = provider.history_calls();
    assert_eq!(history[0], (vec![1, 2], ts(1), ts(700)));
    assert_eq!(history.last().map(|c| c.2), Some(ts(LEN)));

    // Initial value plus ten updates, no duplicates
    assert_eq!(store.history(&Key::tag(1)).unwrap().len(), 11);
    let value = store.value_at(&Key::tag(2), ts(2_000)).unwrap();
    assert_eq!(value.as_tag_value().unwrap().value, TagValue::Int(2));
    let before = store.value_at(&Key::tag(2), ts(100)).unwrap();
    assert_eq!(before.as_tag_value().unwrap().value, TagValue::Int(0));
}

#[test]
fn test_initialization_notifies_listeners_in_order() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1]);
    store.register_keys(&[Key::tag(1)]);
    let (loader, _) = new_loader(&store, &provider, fast_config());
    let recorder = Arc::new(Recorder::default());
    let _subscription = loader.subscribe(recorder.clone());

    loader.begin_loading();
    wait_for_exit(&loader);

    let events = recorder.events.lock().clone();
    assert_eq!(events.first().map(String::as_str), Some("starting"));
    assert_eq!(events.last().map(String::as_str), Some("finished"));
    assert!(events.iter().filter(|e| e.starts_with("progress")).count() >= 2);
    let position = |event: &str| events.iter().position(|e| e == event);
    for (before, after) in [
        ("Loading daily snapshots (1 tags)", "Daily snapshots loaded (1 tags)"),
        ("Loading initial values (1 tags)", "Initial values loaded (1 tags)"),
    ] {
        let before = position(&format!("progress: {}", before));
        let after = position(&format!("progress: {}", after));
        assert!(before.is_some() && after.is_some(), "{:?}", events);
        assert!(before < after, "{:?}", events);
    }

    // Nothing new to initialize: no further events
    loader.begin_loading();
    assert_eq!(recorder.events.lock().len(), events.len());
}

#[test]
fn test_initialization_reports_failed_steps() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1]);
    let supervision = Key::supervision(7, SupervisionEntity::Process);
    store.register_keys(&[Key::tag(1), supervision]);
    provider.fail(ProviderOperation::InitialSupervision, 1);
    provider.fail(ProviderOperation::DailySnapshots, 1);
    let (loader, _) = new_loader(&store, &provider, fast_config());
    let recorder = Arc::new(Recorder::default());
    let _subscription = loader.subscribe(recorder.clone());

    loader.begin_loading();

    let events = recorder.events.lock().clone();
    let position = |event: &str| events.iter().position(|e| e == event);
    for (before, after) in [
        ("Loading supervision events (1 entities)", "Loading supervision events failed"),
        ("Loading daily snapshots (1 tags)", "Loading daily snapshots failed"),
        ("Loading initial values (1 tags)", "Initial values loaded (1 tags)"),
    ] {
        let before = position(&format!("progress: {}", before));
        let after = position(&format!("progress: {}", after));
        assert!(before.is_some() && after.is_some(), "{:?}", events);
        assert!(before < after, "{:?}", events);
    }
    assert!(!store.is_initialized(&supervision));
    loader.stop_loading();
}

#[test]
fn test_supervision_keys_are_loaded_during_initialization() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1]);
    provider.add_supervision_events(vec![
        SupervisionEvent::new(
            7,
            SupervisionEntity::Process,
            SupervisionStatus::Running,
            Timestamp::from_millis(T0 - 50),
        ),
        SupervisionEvent::new(7, SupervisionEntity::Process, SupervisionStatus::Down, ts(4_000)),
    ]);
    let supervision = Key::supervision(7, SupervisionEntity::Process);
    store.register_keys(&[Key::tag(1), supervision]);
    let (loader, _) = new_loader(&store, &provider, fast_config());

    loader.begin_loading();
    assert_eq!(store.watermark(&supervision), Some(ts(LEN)));
    assert_eq!(store.history(&supervision).unwrap().len(), 2);
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::Complete));

    // Supervision keys are never fetched by rounds
    assert!(provider.history_calls().iter().all(|(tags, _, _)| tags == &vec![1]));
}

#[test]
fn test_failed_initialization_leaves_keys_uninitialized() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1, 2]);
    provider.fail(ProviderOperation::InitialValues, 1);
    store.register_keys(&[Key::tag(1), Key::tag(2)]);
    let (loader, _) = new_loader(&store, &provider, fast_config());

    loader.begin_loading();
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::NothingToLoad));
    assert_eq!(store.uninitialized_keys().len(), 2);
    assert!(provider.history_calls().is_empty());
    assert!(!store.is_loading_complete());

    // The next pass retries the initialization
    loader.begin_loading();
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::Complete));
    assert!(store.is_loading_complete());
}

#[test]
fn test_new_keys_stop_and_restart_buffering() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1, 2]);
    provider.set_history_delay(Some(Duration::from_millis(5)));
    store.register_keys(&[Key::tag(1)]);
    let (loader, _) = new_loader(&store, &provider, slow_config());

    loader.begin_loading();
    assert!(wait_until(Duration::from_secs(5), || provider.history_calls().len() >= 2));

    store.register_keys(&[Key::tag(2)]);
    loader.begin_loading();
    assert!(loader.is_loading());
    assert!(store.is_initialized(&Key::tag(2)));

    let initial = provider.calls_of(ProviderOperation::InitialValues);
    assert_eq!(initial.len(), 2);
    assert_eq!(initial[1].tag_ids, vec![2]);

    assert!(loader.stop_loading());
}

// ============================================================================
// SECTION 2: Buffering
// ============================================================================

#[test]
fn test_partitions_split_the_round() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1, 2, 3, 4]);
    store.register_keys(&(1..=4).map(Key::tag).collect::<Vec<_>>());
    let config = LoaderConfig {
        fetch_partitions: 2,
        ..fast_config()
    };
    let (loader, _) = new_loader(&store, &provider, config);

    loader.begin_loading();
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::Complete));

    let mut first: Vec<Vec<u64>> = provider
        .history_calls()
        .into_iter()
        .filter(|(_, start, _)| *start == ts(1))
        .map(|(tags, _, _)| tags)
        .collect();
    first.sort();
    assert_eq!(first, vec![vec![1, 2], vec![3, 4]]);
}

#[test]
fn test_partial_round_failure_is_not_fatal() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1, 2, 3, 4]);
    provider.fail(ProviderOperation::History, 1);
    store.register_keys(&(1..=4).map(Key::tag).collect::<Vec<_>>());
    let config = LoaderConfig {
        fetch_partitions: 2,
        max_consecutive_failures: 1,
        ..fast_config()
    };
    let (loader, _) = new_loader(&store, &provider, config);

    loader.begin_loading();
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::Complete));
    for tag in 1..=4 {
        assert_eq!(store.history(&Key::tag(tag)).unwrap().len(), 11);
    }
}

#[test]
fn test_unchanged_days_are_skipped_without_fetching() {
    let window = Timespan::new(
        Timestamp::from_millis(MIDNIGHT),
        Timestamp::from_millis(MIDNIGHT + 3 * MILLIS_PER_DAY),
    )
    .unwrap();
    let store = Arc::new(HistoryStore::new(window));
    let provider = Arc::new(ScriptedProvider::new());
    let steady = TagValueUpdate::new(1, TagValue::Int(5), Timestamp::from_millis(MIDNIGHT - 1_000));
    provider.add_updates(vec![steady.clone()]);
    provider.add_snapshots((0..=3).map(|day| {
        DailySnapshot::new(
            Timestamp::from_millis(MIDNIGHT + day * MILLIS_PER_DAY),
            steady.clone(),
        )
    }));
    store.register_keys(&[Key::tag(1)]);
    let (loader, _) = new_loader(&store, &provider, fast_config());

    loader.begin_loading();
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::Complete));
    assert!(store.is_loading_complete());
    assert!(provider.history_calls().is_empty());
    assert_eq!(store.history(&Key::tag(1)).unwrap().len(), 1);
}

#[test]
fn test_only_changing_tags_are_fetched() {
    let window = Timespan::new(
        Timestamp::from_millis(MIDNIGHT),
        Timestamp::from_millis(MIDNIGHT + 2 * MILLIS_PER_DAY),
    )
    .unwrap();
    let store = Arc::new(HistoryStore::new(window));
    let provider = Arc::new(ScriptedProvider::new());
    let steady = TagValueUpdate::new(1, TagValue::Int(5), Timestamp::from_millis(MIDNIGHT - 1_000));
    let moving = TagValueUpdate::new(2, TagValue::Int(1), Timestamp::from_millis(MIDNIGHT - 1_000));
    let moved = TagValueUpdate::new(2, TagValue::Int(2), Timestamp::from_millis(MIDNIGHT + 1_000));
    provider.add_updates(vec![steady.clone(), moving.clone(), moved.clone()]);
    provider.add_snapshots((0..=2).map(|day| {
        DailySnapshot::new(Timestamp::from_millis(MIDNIGHT + day * MILLIS_PER_DAY), steady.clone())
    }));
    provider.add_snapshots(vec![
        DailySnapshot::new(Timestamp::from_millis(MIDNIGHT), moving),
        DailySnapshot::new(Timestamp::from_millis(MIDNIGHT + MILLIS_PER_DAY), moved.clone()),
        DailySnapshot::new(Timestamp::from_millis(MIDNIGHT + 2 * MILLIS_PER_DAY), moved),
    ]);
    store.register_keys(&[Key::tag(1), Key::tag(2)]);
    let (loader, _) = new_loader(&store, &provider, fast_config());

    loader.begin_loading();
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::Complete));

    let history = provider.history_calls();
    assert!(!history.is_empty());
    assert!(history.iter().all(|(tags, _, _)| tags == &vec![2]));
    // Past the first day tag 2 is unchanged as well
    assert!(history
        .iter()
        .all(|(_, start, _)| *start <= Timestamp::from_millis(MIDNIGHT + MILLIS_PER_DAY)));
    assert_eq!(store.history(&Key::tag(2)).unwrap().len(), 2);
}

#[test]
fn test_workers_fetch_contiguous_ranges() {
    let store = Arc::new(HistoryStore::new(window()));
    let tags: Vec<u64> = (1..=6).collect();
    let provider = provider_with_tags(&tags);
    store.register_keys(&tags.iter().copied().map(Key::tag).collect::<Vec<_>>());
    let config = LoaderConfig {
        buffering_workers: 3,
        min_frames: 20.0,
        ..fast_config()
    };
    let (loader, _) = new_loader(&store, &provider, config);

    loader.begin_loading();
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::Complete));

    for &tag in &tags {
        let mut ranges: Vec<(Timestamp, Timestamp)> = provider
            .history_calls()
            .into_iter()
            .filter(|(ids, _, _)| ids.contains(&tag))
            .map(|(_, start, end)| (start, end))
            .collect();
        ranges.sort();
        let mut expected_start = ts(1);
        for (start, end) in ranges {
            assert_eq!(start, expected_start, "tag {} fetched twice", tag);
            expected_start = end.saturating_add_millis(1);
        }
        assert_eq!(expected_start, ts(LEN + 1));
        assert_eq!(store.history(&Key::tag(tag)).unwrap().len(), 11);
    }
}

// ============================================================================
// SECTION 3: Termination
// ============================================================================

#[test]
fn test_two_failed_rounds_abort_loading() {
    init_tracing();
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1, 2]);
    provider.fail_always(ProviderOperation::History);
    store.register_keys(&[Key::tag(1), Key::tag(2)]);
    let (loader, _) = new_loader(&store, &provider, fast_config());
    let recorder = Arc::new(Recorder::default());
    let _subscription = loader.subscribe(recorder.clone());

    loader.begin_loading();
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::TooManyFailures));
    assert_eq!(provider.history_calls().len(), 2);
    assert_eq!(recorder.failures.load(Ordering::SeqCst), 2);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(provider.history_calls().len(), 2);
    assert_eq!(store.global_watermark(false), ts(0));

    // Explicit restart resumes
    provider.heal();
    loader.begin_loading();
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::Complete));
}

#[test]
fn test_memory_pressure_stops_and_notifies_once() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1, 2]);
    store.register_keys(&[Key::tag(1), Key::tag(2)]);
    let config = LoaderConfig {
        buffering_workers: 2,
        ..fast_config()
    };
    let (loader, probe) = new_loader(&store, &provider, config);
    probe.set(Some(0.9));
    let recorder = Arc::new(Recorder::default());
    let _subscription = loader.subscribe(recorder.clone());

    loader.begin_loading();
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::MemoryPressure));
    assert!(wait_until(Duration::from_secs(2), || {
        recorder.out_of_memory.load(Ordering::SeqCst) == 1
    }));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(recorder.out_of_memory.load(Ordering::SeqCst), 1);
    assert!(provider.history_calls().is_empty());

    // Initialization is not affected by the ceiling
    assert!(store.is_initialized(&Key::tag(1)));

    probe.set(Some(0.1));
    loader.begin_loading();
    assert_eq!(wait_for_exit(&loader), Some(LoopExit::Complete));
}

#[test]
fn test_stop_loading_interrupts_buffering() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1]);
    provider.set_history_delay(Some(Duration::from_millis(10)));
    store.register_keys(&[Key::tag(1)]);
    let (loader, _) = new_loader(&store, &provider, slow_config());

    loader.begin_loading();
    assert!(wait_until(Duration::from_secs(5), || provider.history_calls().len() >= 3));

    assert!(loader.stop_loading());
    assert!(!loader.is_loading());
    assert_eq!(loader.last_exit(), Some(LoopExit::Stopped));

    let calls = provider.history_calls().len();
    let watermark = store.watermark(&Key::tag(1)).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(provider.history_calls().len(), calls);
    assert!(watermark > ts(0) && watermark < ts(LEN));

    // Restart continues from the watermark
    loader.begin_loading();
    assert!(wait_until(Duration::from_secs(5), || provider.history_calls().len() > calls));
    let resumed = provider.history_calls()[calls].clone();
    assert!(resumed.1 > watermark);
    assert!(loader.stop_loading());
}

#[test]
fn test_dropping_the_loader_stops_workers() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1]);
    provider.set_history_delay(Some(Duration::from_millis(5)));
    store.register_keys(&[Key::tag(1)]);
    let (loader, _) = new_loader(&store, &provider, slow_config());

    loader.begin_loading();
    assert!(wait_until(Duration::from_secs(5), || !provider.history_calls().is_empty()));
    drop(loader);

    let calls = provider.history_calls().len();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(provider.history_calls().len(), calls);
}

#[test]
fn test_clear_drops_loaded_history() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1]);
    store.register_keys(&[Key::tag(1)]);
    let (loader, _) = new_loader(&store, &provider, fast_config());

    loader.begin_loading();
    wait_for_exit(&loader);
    assert!(!store.is_empty());

    loader.clear();
    assert!(store.is_empty());
    assert!(store.history(&Key::tag(1)).is_none());
}

#[test]
fn test_invalid_config_is_rejected() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = Arc::new(ScriptedProvider::new());
    let config = LoaderConfig {
        fetch_partitions: 0,
        ..LoaderConfig::default()
    };
    assert!(HistoryLoader::new(store, provider, config).is_err());
}

#[test]
fn test_records_reach_the_right_keys() {
    let store = Arc::new(HistoryStore::new(window()));
    let provider = provider_with_tags(&[1, 2]);
    store.register_keys(&[Key::tag(1), Key::tag(2)]);
    let (loader, _) = new_loader(&store, &provider, fast_config());

    loader.begin_loading();
    wait_for_exit(&loader);

    let snapshot = store.history(&Key::tag(1)).unwrap();
    assert!(snapshot
        .records()
        .iter()
        .all(|r: &Record| r.key() == Key::tag(1)));
}
