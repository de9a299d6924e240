//! Table behavior over a live runtime, across all three serialization
//! strategies.

use mm_runtime::{Config as RtConfig, Runtime};
use mm_store::{Config, IncrOutcome, StoreOutcome, Strategy, Table};
use std::sync::Arc;

fn run_with_table(
    strategy: Strategy,
    cores: usize,
    body: impl AsyncFnOnce(Arc<Table>) + 'static,
) {
    let runtime = Runtime::new(RtConfig {
        cores,
        max_workers: 16,
        ring_capacity: 256,
    })
    .unwrap();
    let handle = runtime.handle();

    let table = Table::new(
        Config {
            partitions: 4,
            volume: 16 << 20,
            strategy,
            ..Config::default()
        },
        handle.clone(),
    );

    runtime.run(async move {
        body(table).await;
        handle.stop();
    });
}

fn entry(table: &Arc<Table>, key: &[u8], value: &[u8], flags: u32) -> mm_store::EntryData {
    let mut entry = table.create_entry(key, value.len(), flags, 0).unwrap();
    entry.value_mut().copy_from_slice(value);
    entry
}

fn set_get_roundtrip(strategy: Strategy) {
    run_with_table(strategy, 2, async move |table| {
        let outcome = table.set(entry(&table, b"foo", b"bar", 7)).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Stored);

        let found = table.get(b"foo").await.expect("set then get must hit");
        assert_eq!(found.value(), b"bar");
        assert_eq!(found.flags(), 7);

        assert!(table.get(b"missing").await.is_none());
    });
}

#[test]
fn set_get_roundtrip_lock() {
    set_get_roundtrip(Strategy::Lock);
}

#[test]
fn set_get_roundtrip_delegate() {
    set_get_roundtrip(Strategy::Delegate);
}

#[test]
fn set_get_roundtrip_combine() {
    set_get_roundtrip(Strategy::Combine);
}

#[test]
fn add_and_replace_respect_presence() {
    run_with_table(Strategy::Lock, 1, async move |table| {
        assert_eq!(
            table.replace(entry(&table, b"k", b"v", 0)).await.unwrap(),
            StoreOutcome::NotStored
        );
        assert_eq!(
            table.add(entry(&table, b"k", b"v1", 0)).await.unwrap(),
            StoreOutcome::Stored
        );
        assert_eq!(
            table.add(entry(&table, b"k", b"v2", 0)).await.unwrap(),
            StoreOutcome::NotStored
        );
        assert_eq!(
            table.replace(entry(&table, b"k", b"v3", 0)).await.unwrap(),
            StoreOutcome::Stored
        );
        assert_eq!(table.get(b"k").await.unwrap().value(), b"v3");
    });
}

#[test]
fn delete_is_idempotent_in_reply_terms() {
    run_with_table(Strategy::Delegate, 2, async move |table| {
        table.set(entry(&table, b"k", b"v", 0)).await.unwrap();
        assert!(table.delete(b"k").await, "first delete hits");
        assert!(!table.delete(b"k").await, "second delete misses");
    });
}

#[test]
fn cas_stores_only_on_matching_stamp() {
    run_with_table(Strategy::Lock, 1, async move |table| {
        table.set(entry(&table, b"k", b"a", 0)).await.unwrap();
        let current = table.get(b"k").await.unwrap();
        let stamp = current.stamp();
        drop(current);

        // wrong stamp: EXISTS, value unchanged
        assert_eq!(
            table.cas(entry(&table, b"k", b"b", 0), stamp + 1).await.unwrap(),
            StoreOutcome::Exists
        );
        assert_eq!(table.get(b"k").await.unwrap().value(), b"a");

        // matching stamp: stored, and the new stamp is strictly greater
        assert_eq!(
            table.cas(entry(&table, b"k", b"b", 0), stamp).await.unwrap(),
            StoreOutcome::Stored
        );
        let updated = table.get(b"k").await.unwrap();
        assert_eq!(updated.value(), b"b");
        assert!(updated.stamp() > stamp);

        // cas against a missing key
        assert_eq!(
            table.cas(entry(&table, b"gone", b"x", 0), 1).await.unwrap(),
            StoreOutcome::NotFound
        );
    });
}

#[test]
fn incr_decr_semantics() {
    run_with_table(Strategy::Lock, 1, async move |table| {
        table.set(entry(&table, b"n", b"0", 0)).await.unwrap();
        assert_eq!(
            table.incr(b"n", 1, false).await.unwrap(),
            IncrOutcome::Value(1)
        );
        assert_eq!(
            table.incr(b"n", 41, false).await.unwrap(),
            IncrOutcome::Value(42)
        );
        assert_eq!(table.get(b"n").await.unwrap().value(), b"42");

        // decrement saturates at zero
        assert_eq!(
            table.incr(b"n", 100, true).await.unwrap(),
            IncrOutcome::Value(0)
        );

        table.set(entry(&table, b"s", b"abc", 0)).await.unwrap();
        assert_eq!(
            table.incr(b"s", 1, false).await.unwrap(),
            IncrOutcome::NonNumeric
        );
        assert_eq!(
            table.incr(b"gone", 1, false).await.unwrap(),
            IncrOutcome::NotFound
        );
    });
}

#[test]
fn append_and_prepend_concatenate() {
    run_with_table(Strategy::Combine, 2, async move |table| {
        assert_eq!(
            table.concat(b"k", b"x", false).await.unwrap(),
            StoreOutcome::NotStored
        );

        table.set(entry(&table, b"k", b"mid", 9)).await.unwrap();
        assert_eq!(
            table.concat(b"k", b"-end", false).await.unwrap(),
            StoreOutcome::Stored
        );
        assert_eq!(
            table.concat(b"k", b"start-", true).await.unwrap(),
            StoreOutcome::Stored
        );

        let found = table.get(b"k").await.unwrap();
        assert_eq!(found.value(), b"start-mid-end");
        // append/prepend keep the stored flags
        assert_eq!(found.flags(), 9);
    });
}

#[test]
fn flush_under_lock_defers_foreign_frees_to_their_home_core() {
    // Two cores, four partitions: partitions 1 and 3 are homed on core 1,
    // while this whole test body runs on core 0. Under the Lock strategy
    // the flush itself also executes on core 0, so the entries it unlinks
    // from core-1-homed partitions must not be dropped here: each one has
    // to travel through core 1's chunk ring instead.
    let runtime = Runtime::new(RtConfig {
        cores: 2,
        max_workers: 16,
        ring_capacity: 256,
    })
    .unwrap();
    let handle = runtime.handle();

    let table = Table::new(
        Config {
            partitions: 4,
            volume: 16 << 20,
            strategy: Strategy::Lock,
            ..Config::default()
        },
        handle.clone(),
    );

    let stop_handle = handle.clone();
    runtime.run(async move {
        // store only keys that route to an odd partition (homed on core 1)
        let mut stored = 0u64;
        for i in 0..64u32 {
            let key = format!("foreign-{i}");
            if mm_store::hash::Route::new(key.as_bytes(), 2).part % 2 == 1 {
                table
                    .set(entry(&table, key.as_bytes(), b"v", 0))
                    .await
                    .unwrap();
                stored += 1;
            }
        }
        assert!(stored > 0, "no key routed to a core-1 partition");

        let before = stop_handle.core(1).deferred_frees();
        table.flush_all().await;
        let after = stop_handle.core(1).deferred_frees();

        assert!(
            after - before >= stored,
            "expected {stored} frees deferred to core 1, saw {}",
            after - before
        );
        assert_eq!(table.stats().curr_items, 0);

        stop_handle.stop();
    });
}

#[test]
fn flush_all_empties_the_table() {
    run_with_table(Strategy::Delegate, 2, async move |table| {
        for i in 0..100u32 {
            let key = format!("key-{i}");
            table
                .set(entry(&table, key.as_bytes(), b"v", 0))
                .await
                .unwrap();
        }
        assert!(table.get(b"key-50").await.is_some());

        table.flush_all().await;

        for i in 0..100u32 {
            let key = format!("key-{i}");
            assert!(table.get(key.as_bytes()).await.is_none());
        }
        assert_eq!(table.stats().curr_items, 0);
    });
}

#[test]
fn expand_under_load_keeps_every_key() {
    // 100k unique keys force repeated in-place expansion; every key must
    // stay resolvable and the item accounting must agree.
    run_with_table(Strategy::Lock, 2, async move |table| {
        const N: u32 = 100_000;

        for i in 0..N {
            let key = format!("load-{i}");
            let value = format!("value-{i}");
            let outcome = table
                .set(entry(&table, key.as_bytes(), value.as_bytes(), 0))
                .await
                .unwrap();
            assert_eq!(outcome, StoreOutcome::Stored);
        }

        // give background striding a moment to finish its incremental steps
        mm_runtime::time::sleep(core::time::Duration::from_millis(100)).await;

        for i in 0..N {
            let key = format!("load-{i}");
            let value = format!("value-{i}");
            let found = table
                .get(key.as_bytes())
                .await
                .unwrap_or_else(|| panic!("lost {key} during expansion"));
            assert_eq!(found.value(), value.as_bytes());
        }

        assert_eq!(table.stats().curr_items, u64::from(N));
    });
}
