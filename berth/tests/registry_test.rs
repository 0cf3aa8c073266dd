//! Concurrency properties of the rendezvous protocol.
//!
//! These tests verify that:
//! - Exactly one of N concurrent callers for a token becomes the creator
//! - Unaffiliated work items never share a slot
//! - The busy-count bracket balances to zero under interleaving
//! - A removed token is never reused; later callers get a fresh slot
//! - A failed creation releases every waiter and frees the token

use berth::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;

fn test_registry() -> Arc<AffinityRegistry<String>> {
    Arc::new(AffinityRegistry::new(
        RegistryConfig::with_slow_creation_warning(None),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_creation() {
    const CONTENDERS: usize = 16;

    let registry = test_registry();
    let token = AffinityToken::from("A");
    let barrier = Arc::new(Barrier::new(CONTENDERS));
    let creations = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..CONTENDERS {
        let registry = Arc::clone(&registry);
        let token = token.clone();
        let barrier = Arc::clone(&barrier);
        let creations = Arc::clone(&creations);

        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            let mut reservation = registry.resolve_or_reserve(Some(&token));
            if let Some(installer) = reservation.take_installer() {
                creations.fetch_add(1, Ordering::SeqCst);
                // Slow creator: everyone else must park, not create.
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                installer.install("shared".to_string()).unwrap();
            }
            let context = reservation.slot().await_context().await.unwrap();
            reservation.into_lease().complete();
            Arc::as_ptr(&context) as usize
        }));
    }

    let mut observed = HashSet::new();
    for task in tasks {
        observed.insert(task.await.unwrap());
    }

    // Exactly one creator; all contenders observed the same context.
    assert_eq!(creations.load(Ordering::SeqCst), 1);
    assert_eq!(observed.len(), 1);

    // Every bracket closed: the slot is idle again.
    assert!(registry.is_idle(&token));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_absent_token_never_shares() {
    const ITEMS: usize = 8;

    let registry = test_registry();
    let barrier = Arc::new(Barrier::new(ITEMS));

    let mut tasks = Vec::new();
    for n in 0..ITEMS {
        let registry = Arc::clone(&registry);
        let barrier = Arc::clone(&barrier);

        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            let mut reservation = registry.resolve_or_reserve(None);
            // Every unaffiliated item is its own creator.
            let installer = reservation.take_installer().expect("must be creator");
            installer.install(format!("ctx-{n}")).unwrap();
            let context = reservation.slot().await_context().await.unwrap();
            reservation.into_lease().complete();
            Arc::as_ptr(&context) as usize
        }));
    }

    let mut observed = HashSet::new();
    for task in tasks {
        observed.insert(task.await.unwrap());
    }

    // N distinct contexts, and nothing entered into the map.
    assert_eq!(observed.len(), ITEMS);
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_busy_bracket_balances_under_interleaving() {
    const WORKERS: usize = 8;
    const ROUNDS: usize = 50;

    let registry = test_registry();
    let token = AffinityToken::from("A");

    let mut reservation = registry.resolve_or_reserve(Some(&token));
    reservation
        .take_installer()
        .unwrap()
        .install("ctx".to_string())
        .unwrap();
    let slot = Arc::clone(reservation.slot());
    reservation.into_lease().complete();

    let mut tasks = Vec::new();
    for _ in 0..WORKERS {
        let slot = Arc::clone(&slot);
        tasks.push(tokio::spawn(async move {
            for _ in 0..ROUNDS {
                let lease = slot.try_acquire().expect("slot must stay open");
                tokio::task::yield_now().await;
                lease.complete();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // All acquire/release pairs balanced out.
    assert_eq!(slot.busy_count(), 0);
    assert!(registry.is_idle(&token));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_reuse_after_removal() {
    let registry = test_registry();
    let token = AffinityToken::from("A");

    let mut reservation = registry.resolve_or_reserve(Some(&token));
    reservation
        .take_installer()
        .unwrap()
        .install("old".to_string())
        .unwrap();
    let old_slot = Arc::clone(reservation.slot());
    reservation.into_lease().complete();

    assert!(registry
        .retire_if_idle(&token, |context| assert_eq!(*context, "old"))
        .is_retired());

    // A later caller gets a brand-new slot, never the removed one.
    let fresh = registry.resolve_or_reserve(Some(&token));
    assert!(fresh.is_newly_created());
    assert!(!Arc::ptr_eq(fresh.slot(), &old_slot));
    assert_eq!(old_slot.phase(), SlotPhase::Closing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_two_items_share_one_creation() {
    // Token "A" absent; two items arrive concurrently. One creates C, the
    // other blocks in await_context and then observes C. Both complete;
    // final busy count is zero.
    let registry = test_registry();
    let token = AffinityToken::from("A");

    let mut first = registry.resolve_or_reserve(Some(&token));
    let second = registry.resolve_or_reserve(Some(&token));
    assert!(first.is_newly_created());
    assert!(!second.is_newly_created());

    let second_slot = Arc::clone(second.slot());
    let waiter = tokio::spawn(async move { second_slot.await_context().await });
    tokio::task::yield_now().await;

    let installed = first
        .take_installer()
        .unwrap()
        .install("C".to_string())
        .unwrap();
    let first_view = first.slot().await_context().await.unwrap();
    let second_view = waiter.await.unwrap().unwrap();

    assert!(Arc::ptr_eq(&installed, &first_view));
    assert!(Arc::ptr_eq(&installed, &second_view));

    first.into_lease().complete();
    second.into_lease().complete();
    assert!(registry.is_idle(&token));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_creation_failure_releases_all_waiters() {
    const WAITERS: usize = 4;

    let registry = test_registry();
    let token = AffinityToken::from("C");

    let mut creator = registry.resolve_or_reserve(Some(&token));
    let installer = creator.take_installer().unwrap();

    let mut waiters = Vec::new();
    for _ in 0..WAITERS {
        let follower = registry.resolve_or_reserve(Some(&token));
        assert!(!follower.is_newly_created());
        waiters.push(tokio::spawn(async move {
            let outcome = follower.slot().await_context().await;
            follower.into_lease().complete();
            outcome
        }));
    }
    tokio::task::yield_now().await;

    installer.fail("backend unavailable");

    for waiter in waiters {
        let outcome = waiter.await.unwrap();
        assert!(matches!(
            outcome,
            Err(AffinityError::CreationFailed { reason, .. }) if reason == "backend unavailable"
        ));
    }

    // The slot is gone immediately; the token can be retried.
    assert!(registry.is_empty());
    let retry = registry.resolve_or_reserve(Some(&token));
    assert!(retry.is_newly_created());
}
