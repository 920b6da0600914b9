use std::future::Future;

use super::{new_record, seed, TestResult, MODEL};
use crate::{EntityStore, StorageError};

pub(super) async fn run_create_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "create",
            "create_starts_at_version_1",
            create_starts_at_version_1(factory).await,
        ),
        TestResult::from_result(
            "create",
            "create_is_visible_through_find",
            create_is_visible_through_find(factory).await,
        ),
        TestResult::from_result(
            "create",
            "create_duplicate_id_rejected",
            create_duplicate_id_rejected(factory).await,
        ),
        TestResult::from_result(
            "create",
            "create_duplicate_unique_key_rejected",
            create_duplicate_unique_key_rejected(factory).await,
        ),
        TestResult::from_result(
            "create",
            "unique_key_reusable_after_delete",
            unique_key_reusable_after_delete(factory).await,
        ),
        TestResult::from_result(
            "create",
            "unique_key_scoped_per_model",
            unique_key_scoped_per_model(factory).await,
        ),
    ]
}

async fn create_starts_at_version_1<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let r = seed(&s, "c1", "alpha").await?;
    if r.version != 1 {
        return Err(format!("expected version 1, got {}", r.version));
    }
    if r.time_deleted != 0 {
        return Err(format!("expected time_deleted 0, got {}", r.time_deleted));
    }
    if r.time_created != r.time_updated {
        return Err("time_created and time_updated differ on version 1".into());
    }
    if r.initiator_id.as_deref() != Some("tester") {
        return Err(format!("initiator not recorded: {:?}", r.initiator_id));
    }
    Ok(())
}

async fn create_is_visible_through_find<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let created = seed(&s, "c1", "alpha").await?;
    let found = s
        .find(MODEL, "c1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("created entity not found")?;
    if found != created {
        return Err(format!("find returned {found:?}, expected {created:?}"));
    }
    Ok(())
}

async fn create_duplicate_id_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, "c1", "alpha").await?;
    match s.create(new_record("c1", "beta")).await {
        Err(StorageError::UniqueConstraintViolation { .. }) => Ok(()),
        other => Err(format!("expected UniqueConstraintViolation, got {other:?}")),
    }
}

async fn create_duplicate_unique_key_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, "c1", "alpha").await?;
    match s.create(new_record("c2", "alpha")).await {
        Err(StorageError::UniqueConstraintViolation { key, .. }) if key == "alpha" => Ok(()),
        other => Err(format!("expected UniqueConstraintViolation on alpha, got {other:?}")),
    }
}

async fn unique_key_reusable_after_delete<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let r = seed(&s, "c1", "alpha").await?;
    s.delete(MODEL, "c1", r.version, None)
        .await
        .map_err(|e| format!("delete: {e}"))?;
    seed(&s, "c2", "alpha").await.map(|_| ())
}

async fn unique_key_scoped_per_model<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, "c1", "alpha").await?;
    let mut other = new_record("r1", "alpha");
    other.model = "role".to_string();
    s.create(other)
        .await
        .map(|_| ())
        .map_err(|e| format!("same key in another model rejected: {e}"))
}
