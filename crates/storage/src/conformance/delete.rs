use std::future::Future;

use super::{seed, update_of, TestResult, MODEL};
use crate::{EntityStore, Pagination, StorageError};

pub(super) async fn run_delete_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "delete",
            "delete_appends_deleted_version",
            delete_appends_deleted_version(factory).await,
        ),
        TestResult::from_result(
            "delete",
            "second_delete_rejected",
            second_delete_rejected(factory).await,
        ),
        TestResult::from_result(
            "delete",
            "save_after_delete_rejected",
            save_after_delete_rejected(factory).await,
        ),
        TestResult::from_result(
            "delete",
            "delete_with_stale_version_is_outdated",
            delete_with_stale_version_is_outdated(factory).await,
        ),
        TestResult::from_result(
            "delete",
            "deleted_excluded_from_list",
            deleted_excluded_from_list(factory).await,
        ),
        TestResult::from_result(
            "delete",
            "deleted_still_found",
            deleted_still_found(factory).await,
        ),
    ]
}

async fn delete_appends_deleted_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let r = seed(&s, "c1", "alpha").await?;
    let deleted = s
        .delete(MODEL, "c1", r.version, Some("admin"))
        .await
        .map_err(|e| format!("delete: {e}"))?;
    if deleted.version != 2 {
        return Err(format!("expected version 2, got {}", deleted.version));
    }
    if deleted.time_deleted == 0 {
        return Err("time_deleted not set".into());
    }
    if deleted.data != r.data {
        return Err("delete altered the payload".into());
    }
    if deleted.initiator_id.as_deref() != Some("admin") {
        return Err(format!("initiator not recorded: {:?}", deleted.initiator_id));
    }
    Ok(())
}

/// Deletion is not idempotent: the repeat must fail, not succeed silently.
async fn second_delete_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let r = seed(&s, "c1", "alpha").await?;
    let deleted = s
        .delete(MODEL, "c1", r.version, None)
        .await
        .map_err(|e| format!("delete: {e}"))?;
    match s.delete(MODEL, "c1", deleted.version, None).await {
        Err(StorageError::CannotUpdateDeleted { .. }) => Ok(()),
        other => Err(format!("expected CannotUpdateDeleted, got {other:?}")),
    }
}

async fn save_after_delete_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let r = seed(&s, "c1", "alpha").await?;
    let deleted = s
        .delete(MODEL, "c1", r.version, None)
        .await
        .map_err(|e| format!("delete: {e}"))?;
    // Both the pre-delete version and the deleted one must be refused.
    for base in [&r, &deleted] {
        match s.save(update_of(base, "beta")).await {
            Err(StorageError::CannotUpdateDeleted { .. }) => {}
            other => {
                return Err(format!(
                    "save from v{} expected CannotUpdateDeleted, got {other:?}",
                    base.version
                ))
            }
        }
    }
    Ok(())
}

async fn delete_with_stale_version_is_outdated<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let r = seed(&s, "c1", "alpha").await?;
    s.save(update_of(&r, "beta"))
        .await
        .map_err(|e| format!("save: {e}"))?;
    match s.delete(MODEL, "c1", r.version, None).await {
        Err(StorageError::OutdatedVersion { .. }) => Ok(()),
        other => Err(format!("expected OutdatedVersion, got {other:?}")),
    }
}

async fn deleted_excluded_from_list<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = seed(&s, "c1", "alpha").await?;
    seed(&s, "c2", "beta").await?;
    s.delete(MODEL, "c1", a.version, None)
        .await
        .map_err(|e| format!("delete: {e}"))?;
    let page = s
        .list(MODEL, None, Pagination::default())
        .await
        .map_err(|e| format!("list: {e}"))?;
    let ids: Vec<&str> = page.items.iter().map(|r| r.id.as_str()).collect();
    if page.total != 1 || ids != ["c2"] {
        return Err(format!("expected only c2, got {ids:?} (total {})", page.total));
    }
    Ok(())
}

async fn deleted_still_found<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let found = s
        .find(MODEL, "c1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("deleted entity no longer found")?;
    if !found.is_deleted() {
        return Err("find did not return the deleted snapshot".into());
    }
    Ok(())
}
