//! Buffering worker loop
//!
//! Each pass of a worker:
//!
//! 1. checks memory, stop and completion
//! 2. advances keys over ranges the daily snapshots prove unchanged
//! 3. picks the lagging keys (every tag at the global watermark, or the
//!    single least-loaded one) and claims them
//! 4. sizes and fetches one round, split into parallel partitions
//!
//! A round fails only when every partition failed. Consecutive failures
//! end the loop once `max_consecutive_failures` is reached.

use backfill_core::{Key, ProviderError, ProviderResult, Record, Timestamp};
use backfill_storage::HistoryStore;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, ScopedJoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::{panic_message, LoaderInner, LoopExit};
use crate::sizing::estimate_round_end;

/// Thread body of a buffering worker.
pub(crate) fn run_worker(inner: Arc<LoaderInner>) {
    let exit = match catch_unwind(AssertUnwindSafe(|| run(&inner))) {
        Ok(exit) => exit,
        Err(e) => {
            error!(
                target: "backfill::buffering",
                "buffering worker panicked: {}",
                panic_message(e.as_ref())
            );
            LoopExit::Stopped
        }
    };
    inner.worker_finished(exit);
}

fn run(inner: &Arc<LoaderInner>) -> LoopExit {
    let store = &inner.store;
    let config = &inner.config;
    let window = store.window();
    let mut rounds: u64 = 0;
    let mut failures: u32 = 0;
    debug!(target: "backfill::buffering", window = %window, "buffering worker started");

    let exit = loop {
        if inner.memory_exceeded() {
            break LoopExit::MemoryPressure;
        }
        if inner.stop.is_stop_requested() {
            break LoopExit::Stopped;
        }
        if store.is_loading_complete() {
            break LoopExit::Complete;
        }

        skip_unchanged_ranges(inner);

        let seen = inner.work.generation();
        let target = match select_targets(store) {
            Some(target) => target,
            None => {
                if store.global_watermark(true) >= window.end() {
                    break LoopExit::Complete;
                }
                error!(
                    target: "backfill::buffering",
                    uninitialized = store.uninitialized_keys().len(),
                    "history is not fully loaded but no key can be loaded further"
                );
                break LoopExit::NothingToLoad;
            }
        };

        let claim = inner.work.claim(target.keys.iter().copied());
        if claim.is_empty() {
            trace!(target: "backfill::buffering", "lagging keys are claimed by another round");
            inner.work.wait_for_release(seen, config.claim_retry_interval());
            continue;
        }
        // Another round may have advanced a key between selection and claim
        if claim
            .keys()
            .iter()
            .any(|key| store.watermark(key) != Some(target.watermark))
        {
            continue;
        }

        let target_ms = if rounds == 0 {
            config.first_round_target_ms
        } else {
            config.round_target_ms
        };
        let speed = inner.speed.current();
        let end = estimate_round_end(
            config,
            &window,
            speed,
            claim.len(),
            target.watermark,
            target_ms,
        );
        debug!(
            target: "backfill::buffering",
            round = rounds,
            keys = claim.len(),
            from = %target.watermark,
            end = %end,
            speed,
            "loading round"
        );

        match fetch_round(inner, claim.keys(), target.watermark, end) {
            Ok(()) => {
                failures = 0;
                rounds += 1;
            }
            Err(failed) => {
                drop(claim);
                failures += 1;
                if failures >= config.max_consecutive_failures {
                    error!(
                        target: "backfill::buffering",
                        failures,
                        "loading history failed too many times in a row, giving up"
                    );
                    inner
                        .listeners
                        .notify(|l| l.on_stopped_loading_due_to_failures(failures));
                    break LoopExit::TooManyFailures;
                }
                warn!(
                    target: "backfill::buffering",
                    failures,
                    partitions = failed,
                    "loading round failed, retrying"
                );
                inner.stop.sleep(config.failure_retry_delay());
            }
        }
    };

    if exit == LoopExit::MemoryPressure {
        notify_memory_pressure(inner);
    }
    info!(target: "backfill::buffering", exit = ?exit, rounds, "buffering worker finished");
    store.request_watermark_notification();
    exit
}

/// Keys chosen for the next round and the watermark they share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RoundTarget {
    pub(crate) keys: Vec<Key>,
    pub(crate) watermark: Timestamp,
}

/// Lagging keys: every initialized tag at the global watermark. When none
/// sits there (the laggard is a supervision key or already claimed and
/// advanced), the single least-loaded tag below the window end.
pub(crate) fn select_targets(store: &HistoryStore) -> Option<RoundTarget> {
    let end = store.end();
    let global = store.global_watermark(true);
    let candidates: Vec<(Key, Timestamp)> = store
        .initialized_watermarks()
        .into_iter()
        .filter(|(key, watermark)| key.is_tag_value() && *watermark < end)
        .collect();

    let cohort: Vec<Key> = candidates
        .iter()
        .filter(|(_, watermark)| *watermark == global)
        .map(|(key, _)| *key)
        .collect();
    if !cohort.is_empty() {
        return Some(RoundTarget {
            keys: cohort,
            watermark: global,
        });
    }

    candidates
        .iter()
        .min_by_key(|(key, watermark)| (*watermark, *key))
        .map(|(key, watermark)| RoundTarget {
            keys: vec![*key],
            watermark: *watermark,
        })
}

/// Advance every initialized tag over the unchanged run its daily
/// snapshots prove, without fetching.
pub(crate) fn skip_unchanged_ranges(inner: &LoaderInner) {
    if inner.snapshots.is_empty() {
        return;
    }
    let store = &inner.store;
    let end = store.end();
    let _batch = store.batch();

    let mut skipped: u64 = 0;
    for (key, watermark) in store.initialized_watermarks() {
        let Some(tag_id) = key.tag_id() else {
            continue;
        };
        if watermark >= end {
            continue;
        }
        if let Some(span) = inner.snapshots.get_timespan(tag_id, watermark) {
            let until = span.end().min(end);
            store.add_records(&[key], Vec::new(), until);
            skipped += until.millis_since(watermark);
        }
    }
    if skipped > 0 {
        debug!(
            target: "backfill::buffering",
            hours = skipped as f64 / 3_600_000.0,
            "skipped unchanged history"
        );
    }
}

/// Fetch `(from, end]` for `keys`.
///
/// Returns the number of failed partitions when all of them failed.
fn fetch_round(
    inner: &LoaderInner,
    keys: &[Key],
    from: Timestamp,
    end: Timestamp,
) -> Result<(), usize> {
    let start = from.saturating_add_millis(1);
    let partitions = partition(keys, inner.config.fetch_partitions);
    let started = Instant::now();

    let outcomes: Vec<ProviderResult<usize>> = if partitions.len() <= 1 {
        partitions
            .iter()
            .map(|part| fetch_partition(inner, part, start, end))
            .collect()
    } else {
        thread::scope(|scope| {
            let handles: Vec<Option<ScopedJoinHandle<'_, ProviderResult<usize>>>> = partitions
                .iter()
                .enumerate()
                .map(|(i, part)| {
                    let spawned = thread::Builder::new()
                        .name(format!("backfill-fetch-{}", i))
                        .spawn_scoped(scope, move || fetch_partition(inner, part, start, end));
                    match spawned {
                        Ok(handle) => Some(handle),
                        Err(e) => {
                            error!(
                                target: "backfill::buffering",
                                partition = i,
                                error = %e,
                                "failed to spawn fetch thread"
                            );
                            None
                        }
                    }
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| match handle {
                    Some(handle) => handle.join().unwrap_or_else(|e| {
                        Err(ProviderError::failed(
                            "get_history",
                            format!("fetch thread panicked: {}", panic_message(e.as_ref())),
                        ))
                    }),
                    None => Err(ProviderError::failed("get_history", "fetch thread not started")),
                })
                .collect()
        })
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut failed = 0;
    let mut stored = 0;
    for outcome in outcomes {
        match outcome {
            Ok(count) => stored += count,
            Err(e) => {
                failed += 1;
                warn!(target: "backfill::buffering", error = %e, "history fetch failed");
            }
        }
    }

    if failed == 0 {
        let span = round_span_ms(keys.len(), start, end);
        let speed = inner.speed.add_measurement(span, elapsed_ms);
        trace!(target: "backfill::buffering", stored, elapsed_ms, speed, "round loaded");
        Ok(())
    } else if failed < partitions.len() {
        Ok(())
    } else {
        Err(failed)
    }
}

/// History covered by a round over `keys` requesting `[start, end]`.
fn round_span_ms(keys: usize, start: Timestamp, end: Timestamp) -> u64 {
    end.millis_since(start).saturating_mul(keys as u64)
}

fn fetch_partition(
    inner: &LoaderInner,
    keys: &[Key],
    start: Timestamp,
    end: Timestamp,
) -> ProviderResult<usize> {
    let tag_ids: Vec<u64> = keys.iter().filter_map(Key::tag_id).collect();
    let updates = inner.provider.get_history(&tag_ids, start, end)?;
    let records: Vec<Record> = updates.into_iter().map(Record::from).collect();
    Ok(inner.store.add_records(keys, records, end))
}

/// Split `keys` into at most `partitions` contiguous chunks of equal size.
fn partition(keys: &[Key], partitions: usize) -> Vec<&[Key]> {
    if keys.is_empty() {
        return Vec::new();
    }
    let partitions = partitions.clamp(1, keys.len());
    let size = (keys.len() + partitions - 1) / partitions;
    keys.chunks(size).collect()
}

/// Fire the memory event on its own thread, once per loading session.
fn notify_memory_pressure(inner: &Arc<LoaderInner>) {
    if inner.memory_event_sent.swap(true, Ordering::AcqRel) {
        return;
    }
    warn!(target: "backfill::buffering", "buffering stopped, memory is running short");

    let notifier = Arc::clone(inner);
    let spawned = thread::Builder::new()
        .name("backfill-memory-warning".to_string())
        .spawn(move || {
            notifier
                .listeners
                .notify(|l| l.on_stopped_loading_due_to_out_of_memory());
        });
    if let Err(e) = spawned {
        error!(target: "backfill::buffering", error = %e, "failed to spawn memory warning thread");
        inner
            .listeners
            .notify(|l| l.on_stopped_loading_due_to_out_of_memory());
    }
}
