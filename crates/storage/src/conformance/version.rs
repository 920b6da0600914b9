use std::future::Future;

use super::{seed, update_of, TestResult, MODEL};
use crate::{EntityStore, StorageError};

pub(super) async fn run_version_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "version",
            "save_increments_version",
            save_increments_version(factory).await,
        ),
        TestResult::from_result(
            "version",
            "save_preserves_time_created",
            save_preserves_time_created(factory).await,
        ),
        TestResult::from_result(
            "version",
            "stale_version_after_intervening_save",
            stale_version_after_intervening_save(factory).await,
        ),
        TestResult::from_result(
            "version",
            "conflict_reports_versions",
            conflict_reports_versions(factory).await,
        ),
        TestResult::from_result(
            "version",
            "conflict_does_not_change_state",
            conflict_does_not_change_state(factory).await,
        ),
        TestResult::from_result(
            "version",
            "save_unique_key_collision_rejected",
            save_unique_key_collision_rejected(factory).await,
        ),
        TestResult::from_result(
            "version",
            "save_same_unique_key_on_self_allowed",
            save_same_unique_key_on_self_allowed(factory).await,
        ),
        TestResult::from_result(
            "version",
            "version_per_entity_independent",
            version_per_entity_independent(factory).await,
        ),
    ]
}

async fn save_increments_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut r = seed(&s, "c1", "alpha").await?;
    for expected in 2..=5 {
        r = s
            .save(update_of(&r, &format!("alpha-{expected}")))
            .await
            .map_err(|e| format!("save to v{expected}: {e}"))?;
        if r.version != expected {
            return Err(format!("expected version {expected}, got {}", r.version));
        }
    }
    Ok(())
}

async fn save_preserves_time_created<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let v1 = seed(&s, "c1", "alpha").await?;
    let v2 = s
        .save(update_of(&v1, "beta"))
        .await
        .map_err(|e| format!("save: {e}"))?;
    if v2.time_created != v1.time_created {
        return Err(format!(
            "time_created changed from {} to {}",
            v1.time_created, v2.time_created
        ));
    }
    if v2.time_updated < v1.time_updated {
        return Err("time_updated went backwards".into());
    }
    Ok(())
}

/// Two writers read version 1; the second to write loses.
async fn stale_version_after_intervening_save<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let v1 = seed(&s, "c1", "alpha").await?;
    s.save(update_of(&v1, "winner"))
        .await
        .map_err(|e| format!("first save: {e}"))?;
    match s.save(update_of(&v1, "loser")).await {
        Err(StorageError::OutdatedVersion { .. }) => {}
        other => return Err(format!("expected OutdatedVersion, got {other:?}")),
    }
    let current = s
        .find(MODEL, "c1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("entity vanished")?;
    if current.data["name"] != "winner" || current.version != 2 {
        return Err(format!("winner not current: {current:?}"));
    }
    Ok(())
}

async fn conflict_reports_versions<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let v1 = seed(&s, "c1", "alpha").await?;
    let v2 = s
        .save(update_of(&v1, "beta"))
        .await
        .map_err(|e| format!("save: {e}"))?;
    s.save(update_of(&v2, "gamma"))
        .await
        .map_err(|e| format!("save: {e}"))?;
    match s.save(update_of(&v1, "delta")).await {
        Err(StorageError::OutdatedVersion {
            model,
            id,
            expected_version: 1,
            current_version: 3,
        }) if model == MODEL && id == "c1" => Ok(()),
        other => Err(format!("expected OutdatedVersion 1 vs 3, got {other:?}")),
    }
}

async fn conflict_does_not_change_state<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let v1 = seed(&s, "c1", "alpha").await?;
    let v2 = s
        .save(update_of(&v1, "beta"))
        .await
        .map_err(|e| format!("save: {e}"))?;
    let _ = s.save(update_of(&v1, "stale")).await;
    let current = s
        .find(MODEL, "c1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("entity vanished")?;
    if current != v2 {
        return Err(format!("conflicting save changed state: {current:?}"));
    }
    Ok(())
}

async fn save_unique_key_collision_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, "c1", "alpha").await?;
    let other = seed(&s, "c2", "beta").await?;
    match s.save(update_of(&other, "alpha")).await {
        Err(StorageError::UniqueConstraintViolation { .. }) => Ok(()),
        other => Err(format!("expected UniqueConstraintViolation, got {other:?}")),
    }
}

async fn save_same_unique_key_on_self_allowed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let r = seed(&s, "c1", "alpha").await?;
    s.save(update_of(&r, "alpha"))
        .await
        .map(|_| ())
        .map_err(|e| format!("re-saving own key rejected: {e}"))
}

async fn version_per_entity_independent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = seed(&s, "c1", "alpha").await?;
    let b = seed(&s, "c2", "beta").await?;
    let a2 = s
        .save(update_of(&a, "alpha-2"))
        .await
        .map_err(|e| format!("save a: {e}"))?;
    let b2 = s
        .save(update_of(&b, "beta-2"))
        .await
        .map_err(|e| format!("save b: {e}"))?;
    if a2.version != 2 || b2.version != 2 {
        return Err(format!("versions leaked: a={} b={}", a2.version, b2.version));
    }
    Ok(())
}
