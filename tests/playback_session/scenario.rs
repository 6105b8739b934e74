//! The reference two-tag session over a ten second window.

use crate::common::*;
use backfill::testing::ProviderOperation;
use backfill::{Key, LoopExit, TagValue};

#[test]
fn test_two_tags_load_to_the_end() {
    init_tracing();
    let session = Session::new(
        &[Key::tag(1), Key::tag(2)],
        provider_with_tags(&[1, 2]),
        scenario_config(),
    );

    session.loader.begin_loading();
    session.wait_idle();
    assert_eq!(session.loader.last_exit(), Some(LoopExit::Complete));

    // Initialization asked for the values at window start
    let initial = session.provider.calls_of(ProviderOperation::InitialValues);
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].tag_ids, vec![1, 2]);
    assert_eq!(initial[0].start, ts(0));

    // The short first round, then rounds up to the end
    let history = session.provider.history_calls();
    assert_eq!(history[0], (vec![1, 2], ts(1), ts(700)));
    assert_eq!(history.last().map(|(_, _, end)| *end), Some(ts(LEN)));

    let watermarks = session.events.watermarks.lock().clone();
    assert!(watermarks.contains(&ts(700)));
    assert_eq!(watermarks.last(), Some(&ts(LEN)));
    assert!(watermarks.windows(2).all(|pair| pair[0] <= pair[1]));

    assert!(session.store.is_loading_complete());
    assert_eq!(session.store.global_watermark(false), ts(LEN));
    assert_eq!(session.events.fully_loaded_count(), 1);
}

#[test]
fn test_loaded_history_serves_point_in_time_reads() {
    let session = Session::new(
        &[Key::tag(1), Key::tag(2)],
        provider_with_tags(&[1, 2]),
        scenario_config(),
    );
    session.loader.begin_loading();
    session.wait_idle();

    for tag in [1, 2] {
        let history = session.store.history(&Key::tag(tag)).unwrap();
        assert_eq!(history.len(), 10);
        assert!(history
            .records()
            .windows(2)
            .all(|pair| pair[0].timestamp() <= pair[1].timestamp()));
    }

    let value = session.store.value_at(&Key::tag(1), ts(4_500)).unwrap();
    assert_eq!(value.as_tag_value().unwrap().value, TagValue::Int(4));
    let first = session.store.value_at(&Key::tag(2), ts(0)).unwrap();
    assert_eq!(first.as_tag_value().unwrap().value, TagValue::Int(0));

    // Initialization reported both keys once; later rounds report additions
    let initialized = session.events.initialized.lock().clone();
    assert_eq!(initialized.iter().filter(|k| **k == Key::tag(1)).count(), 1);
    assert!(session.events.added.lock().contains(&Key::tag(2)));
}

#[test]
fn test_restart_after_failures_finishes_the_window() {
    let session = Session::new(
        &[Key::tag(1), Key::tag(2)],
        provider_with_tags(&[1, 2]),
        scenario_config(),
    );
    session.provider.fail_always(ProviderOperation::History);

    session.loader.begin_loading();
    session.wait_idle();
    assert_eq!(session.loader.last_exit(), Some(LoopExit::TooManyFailures));
    assert!(!session.store.is_loading_complete());
    assert_eq!(session.events.fully_loaded_count(), 0);

    session.provider.heal();
    session.loader.begin_loading();
    session.wait_idle();
    assert_eq!(session.loader.last_exit(), Some(LoopExit::Complete));
    assert_eq!(session.events.fully_loaded_count(), 1);
}

#[test]
fn test_keys_added_mid_session_are_loaded_too() {
    let session = Session::new(&[Key::tag(1)], provider_with_tags(&[1, 2]), scenario_config());
    session.loader.begin_loading();
    session.wait_idle();
    assert_eq!(session.events.fully_loaded_count(), 1);

    // A new key pulls the global watermark back to the window start
    session.store.register_keys(&[Key::tag(2)]);
    assert!(!session.store.is_loading_complete());

    session.loader.begin_loading();
    session.wait_idle();
    assert_eq!(session.loader.last_exit(), Some(LoopExit::Complete));
    assert_eq!(session.store.history(&Key::tag(2)).unwrap().len(), 10);
    assert_eq!(session.events.fully_loaded_count(), 2);
}
