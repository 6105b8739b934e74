//! Sessions seeded from the live tag cache.

use crate::common::*;
use backfill::testing::ProviderOperation;
use backfill::{Key, LiveTagValue, LoopExit, TagValue, TagValueUpdate, Timestamp};

fn live(tag: u64, exists: bool, at: Timestamp) -> LiveTagValue {
    LiveTagValue {
        exists,
        update: TagValueUpdate::new(tag, TagValue::Int(42), at),
    }
}

#[test]
fn test_stale_live_values_need_no_fetch() {
    let session = Session::new(&[], provider_with_tags(&[2, 3]), scenario_config());
    let must_fetch = session.store.register_live_values(&[
        live(1, true, Timestamp::from_millis(T0 - 60_000)),
        live(2, true, ts(3_000)),
        live(3, false, ts(3_000)),
    ]);
    assert_eq!(must_fetch, vec![Key::tag(2), Key::tag(3)]);

    // Unchanged for the whole window: already fully loaded
    assert_eq!(session.store.watermark(&Key::tag(1)), Some(ts(LEN)));
    let value = session.store.value_at(&Key::tag(1), ts(5_000)).unwrap();
    assert_eq!(value.as_tag_value().unwrap().value, TagValue::Int(42));

    session.store.register_keys(&must_fetch);
    session.loader.begin_loading();
    session.wait_idle();
    assert_eq!(session.loader.last_exit(), Some(LoopExit::Complete));

    let initial = session.provider.calls_of(ProviderOperation::InitialValues);
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].tag_ids, vec![2, 3]);
    assert!(session
        .provider
        .history_calls()
        .iter()
        .all(|(tags, _, _)| !tags.contains(&1)));
}

#[test]
fn test_all_live_values_stale_means_nothing_to_load() {
    let session = Session::new(&[], provider_with_tags(&[]), scenario_config());
    let old = Timestamp::from_millis(T0 - 1);
    let must_fetch = session
        .store
        .register_live_values(&[live(1, true, old), live(2, true, old)]);
    assert!(must_fetch.is_empty());
    assert!(session.store.is_loading_complete());
    assert_eq!(session.events.fully_loaded_count(), 1);

    session.loader.begin_loading();
    assert!(!session.loader.is_loading());
    assert!(session.provider.calls().is_empty());
}
