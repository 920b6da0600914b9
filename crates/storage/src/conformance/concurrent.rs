use std::future::Future;
use std::sync::Arc;

use super::{seed, update_of, TestResult, MODEL};
use crate::{EntityStore, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "concurrent_saves_exactly_one_wins",
            concurrent_saves_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_creates_exactly_one_wins",
            concurrent_creates_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_saves_different_entities_all_succeed",
            concurrent_saves_different_entities_all_succeed(factory).await,
        ),
    ]
}

// ── Concurrent save: exactly one wins ────────────────────────────────────────

/// N tasks each try to save the same entity from version 1. Exactly one
/// succeeds; the rest must get OutdatedVersion.
///
/// This exercises real concurrency: `tokio::spawn` creates parallel tasks
/// that race against the compare-and-swap.
async fn concurrent_saves_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(factory().await);
    let v1 = seed(store.as_ref(), "c1", "alpha").await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = store.clone();
        let update = update_of(&v1, &format!("writer-{i}"));
        handles.push(tokio::spawn(async move {
            match s.save(update).await {
                Ok(_) => Ok(true),
                Err(StorageError::OutdatedVersion { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }

    let current = store
        .find(MODEL, "c1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("entity vanished")?;
    if current.version != 2 {
        return Err(format!("expected version 2, got {}", current.version));
    }
    Ok(())
}

async fn concurrent_creates_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = store.clone();
        handles.push(tokio::spawn(async move {
            match s.create(super::new_record(&format!("c{i}"), "shared")).await {
                Ok(_) => Ok(true),
                Err(StorageError::UniqueConstraintViolation { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        if handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?
        {
            winners += 1;
        }
    }
    if winners != 1 {
        return Err(format!("expected exactly 1 creator of 'shared', got {winners}"));
    }
    Ok(())
}

async fn concurrent_saves_different_entities_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let store = Arc::new(factory().await);
    let mut seeded = Vec::new();
    for i in 0..N {
        seeded.push(seed(store.as_ref(), &format!("c{i}"), &format!("name-{i}")).await?);
    }

    let mut handles = Vec::new();
    for (i, record) in seeded.iter().enumerate() {
        let s = store.clone();
        let update = update_of(record, &format!("renamed-{i}"));
        handles.push(tokio::spawn(async move { s.save(update).await }));
    }
    for handle in handles {
        let saved = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if saved.version != 2 {
            return Err(format!("{} ended at version {}", saved.id, saved.version));
        }
    }
    Ok(())
}
