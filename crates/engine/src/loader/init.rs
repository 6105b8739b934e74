//! Initialization of new keys
//!
//! Three independent steps run on their own threads under one store batch:
//! supervision history, daily snapshot index and tag values at window
//! start. A failing step leaves its keys uninitialized; they are retried
//! by the next `begin_loading`.

use backfill_core::{Key, Record, SupervisionRequest};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, Scope};
use tracing::{debug, error, warn};

use super::{panic_message, LoaderInner};

pub(crate) fn initialize(inner: &LoaderInner, keys: &[Key]) {
    let (tags, supervision): (Vec<Key>, Vec<Key>) =
        keys.iter().copied().partition(Key::is_tag_value);
    debug!(
        target: "backfill::init",
        tags = tags.len(),
        supervision = supervision.len(),
        "initializing keys"
    );

    let _batch = inner.store.batch();
    thread::scope(|scope| {
        spawn_step(scope, "supervision", || load_supervision(inner, &supervision));
        spawn_step(scope, "snapshots", || load_snapshots(inner, &tags));
        if inner.config.load_initial_values {
            spawn_step(scope, "initial-values", || load_initial_values(inner, &tags));
        }
    });

    if !inner.config.load_initial_values {
        inner.store.add_initial_records(&tags, Vec::new());
    }
}

fn spawn_step<'scope, F>(scope: &'scope Scope<'scope, '_>, name: &'static str, step: F)
where
    F: FnOnce() + Send + 'scope,
{
    let guarded = move || {
        if let Err(e) = catch_unwind(AssertUnwindSafe(step)) {
            error!(
                target: "backfill::init",
                step = name,
                "initialization step panicked: {}",
                panic_message(e.as_ref())
            );
        }
    };
    if let Err(e) = thread::Builder::new()
        .name(format!("backfill-init-{}", name))
        .spawn_scoped(scope, guarded)
    {
        error!(
            target: "backfill::init",
            step = name,
            error = %e,
            "failed to spawn initialization step"
        );
    }
}

/// Status at window start and every change inside the window. Keys are
/// marked initialized only when both calls succeed.
fn load_supervision(inner: &LoaderInner, keys: &[Key]) {
    if keys.is_empty() {
        return;
    }
    let store = &inner.store;
    let requests: Vec<SupervisionRequest> =
        keys.iter().filter_map(SupervisionRequest::from_key).collect();
    inner.progress(&format!(
        "Loading supervision events ({} entities)",
        requests.len()
    ));

    let (start, end) = (store.start(), store.end());
    let fetched = inner
        .provider
        .get_initial_supervision_events(start, &requests)
        .and_then(|initial| {
            inner
                .provider
                .get_supervision_events(start, end, &requests)
                .map(|events| (initial, events))
        });

    match fetched {
        Ok((initial, events)) => {
            let initial: Vec<Record> = initial.into_iter().map(Record::from).collect();
            let events: Vec<Record> = events.into_iter().map(Record::from).collect();
            let stored = store.add_initial_records(keys, initial)
                + store.add_records(keys, events, end);
            debug!(
                target: "backfill::init",
                entities = keys.len(),
                stored,
                "supervision history loaded"
            );
            inner.progress(&format!(
                "Supervision events loaded ({} entities)",
                requests.len()
            ));
        }
        Err(e) => {
            inner.progress("Loading supervision events failed");
            warn!(
                target: "backfill::init",
                entities = keys.len(),
                error = %e,
                "failed to load supervision events, keys stay uninitialized"
            );
        }
    }
}

fn load_snapshots(inner: &LoaderInner, tags: &[Key]) {
    if tags.is_empty() {
        return;
    }
    let store = &inner.store;
    let tag_ids: Vec<u64> = tags.iter().filter_map(Key::tag_id).collect();
    inner.progress(&format!("Loading daily snapshots ({} tags)", tag_ids.len()));

    match inner
        .provider
        .get_daily_snapshot_records(&tag_ids, store.start(), store.end())
    {
        Ok(snapshots) => {
            let indexed = inner.snapshots.add_snapshot_values(snapshots);
            debug!(target: "backfill::init", indexed, "daily snapshots indexed");
            inner.progress(&format!("Daily snapshots loaded ({} tags)", tag_ids.len()));
        }
        Err(e) => {
            inner.progress("Loading daily snapshots failed");
            warn!(target: "backfill::init", error = %e, "failed to load daily snapshots");
        }
    }
}

fn load_initial_values(inner: &LoaderInner, tags: &[Key]) {
    if tags.is_empty() {
        return;
    }
    let store = &inner.store;
    let tag_ids: Vec<u64> = tags.iter().filter_map(Key::tag_id).collect();
    inner.progress(&format!("Loading initial values ({} tags)", tag_ids.len()));

    match inner.provider.get_initial_values(&tag_ids, store.start()) {
        Ok(updates) => {
            let records: Vec<Record> = updates.into_iter().map(Record::from).collect();
            let stored = store.add_initial_records(tags, records);
            debug!(target: "backfill::init", tags = tags.len(), stored, "initial values loaded");
            inner.progress(&format!("Initial values loaded ({} tags)", tag_ids.len()));
        }
        Err(e) => {
            inner.progress("Loading initial values failed");
            warn!(
                target: "backfill::init",
                tags = tags.len(),
                error = %e,
                "failed to load initial values, keys stay uninitialized"
            );
        }
    }
}
