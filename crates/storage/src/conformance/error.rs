use std::future::Future;

use super::{TestResult, MODEL};
use crate::{EntityStore, Pagination, RecordUpdate, StorageError};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "error",
            "find_nonexistent_is_none",
            find_nonexistent_is_none(factory).await,
        ),
        TestResult::from_result(
            "error",
            "save_nonexistent_not_found",
            save_nonexistent_not_found(factory).await,
        ),
        TestResult::from_result(
            "error",
            "delete_nonexistent_not_found",
            delete_nonexistent_not_found(factory).await,
        ),
        TestResult::from_result(
            "error",
            "list_versions_nonexistent_empty",
            list_versions_nonexistent_empty(factory).await,
        ),
    ]
}

async fn find_nonexistent_is_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.find(MODEL, "missing").await {
        Ok(None) => Ok(()),
        other => Err(format!("expected Ok(None), got {other:?}")),
    }
}

async fn save_nonexistent_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let update = RecordUpdate {
        model: MODEL.to_string(),
        id: "missing".to_string(),
        expected_version: 1,
        initiator_id: None,
        unique_key: None,
        data: serde_json::json!({}),
    };
    match s.save(update).await {
        Err(StorageError::EntityNotFound { model, id }) if model == MODEL && id == "missing" => {
            Ok(())
        }
        other => Err(format!("expected EntityNotFound, got {other:?}")),
    }
}

async fn delete_nonexistent_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.delete(MODEL, "missing", 1, None).await {
        Err(StorageError::EntityNotFound { .. }) => Ok(()),
        other => Err(format!("expected EntityNotFound, got {other:?}")),
    }
}

async fn list_versions_nonexistent_empty<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let page = s
        .list_versions(MODEL, "missing", Pagination::default())
        .await
        .map_err(|e| format!("list_versions: {e}"))?;
    if page.total != 0 || !page.items.is_empty() {
        return Err(format!("expected empty history, got {page:?}"));
    }
    Ok(())
}
