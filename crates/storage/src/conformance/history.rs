use std::future::Future;

use super::{seed, update_of, TestResult, MODEL};
use crate::{EntityStore, Pagination};

pub(super) async fn run_history_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "history",
            "history_counts_every_mutation",
            history_counts_every_mutation(factory).await,
        ),
        TestResult::from_result(
            "history",
            "history_newest_first",
            history_newest_first(factory).await,
        ),
        TestResult::from_result(
            "history",
            "find_version_matches_snapshot",
            find_version_matches_snapshot(factory).await,
        ),
        TestResult::from_result(
            "history",
            "find_version_out_of_range_is_none",
            find_version_out_of_range_is_none(factory).await,
        ),
        TestResult::from_result(
            "history",
            "history_paginates",
            history_paginates(factory).await,
        ),
        TestResult::from_result(
            "history",
            "list_in_insertion_order",
            list_in_insertion_order(factory).await,
        ),
    ]
}

/// create + 2 saves + delete = 4 versions.
async fn history_counts_every_mutation<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let v3 = s
        .save(update_of(&v2, "gamma"))
        .await
        .map_err(|e| format!("save: {e}"))?;
    s.delete(MODEL, "c1", v3.version, None)
        .await
        .map_err(|e| format!("delete: {e}"))?;
    let page = s
        .list_versions(MODEL, "c1", Pagination::default())
        .await
        .map_err(|e| format!("list_versions: {e}"))?;
    if page.total != 4 || page.items.len() != 4 {
        return Err(format!(
            "expected 4 versions, got total {} / {} items",
            page.total,
            page.items.len()
        ));
    }
    Ok(())
}

async fn history_newest_first<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut r = seed(&s, "c1", "alpha").await?;
    for i in 0..3 {
        r = s
            .save(update_of(&r, &format!("n{i}")))
            .await
            .map_err(|e| format!("save: {e}"))?;
    }
    let page = s
        .list_versions(MODEL, "c1", Pagination::default())
        .await
        .map_err(|e| format!("list_versions: {e}"))?;
    let versions: Vec<i64> = page.items.iter().map(|r| r.version).collect();
    if versions != [4, 3, 2, 1] {
        return Err(format!("expected [4, 3, 2, 1], got {versions:?}"));
    }
    Ok(())
}

async fn find_version_matches_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
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
    for expected in [&v1, &v2] {
        let found = s
            .find_version(MODEL, "c1", expected.version)
            .await
            .map_err(|e| format!("find_version: {e}"))?
            .ok_or_else(|| format!("version {} missing", expected.version))?;
        if &found != expected {
            return Err(format!("snapshot mismatch: {found:?} vs {expected:?}"));
        }
    }
    let current = s
        .find(MODEL, "c1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("entity vanished")?;
    if current != v2 {
        return Err("find disagrees with latest find_version".into());
    }
    Ok(())
}

async fn find_version_out_of_range_is_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed(&s, "c1", "alpha").await?;
    for version in [0, 2, 20] {
        match s.find_version(MODEL, "c1", version).await {
            Ok(None) => {}
            other => return Err(format!("version {version}: expected None, got {other:?}")),
        }
    }
    Ok(())
}

async fn history_paginates<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut r = seed(&s, "c1", "alpha").await?;
    for i in 0..4 {
        r = s
            .save(update_of(&r, &format!("n{i}")))
            .await
            .map_err(|e| format!("save: {e}"))?;
    }
    let page = s
        .list_versions(MODEL, "c1", Pagination::new(2, 2))
        .await
        .map_err(|e| format!("list_versions: {e}"))?;
    let versions: Vec<i64> = page.items.iter().map(|r| r.version).collect();
    if page.total != 5 || versions != [3, 2] {
        return Err(format!("expected [3, 2] of 5, got {versions:?} of {}", page.total));
    }
    Ok(())
}

async fn list_in_insertion_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let first = seed(&s, "zz", "first").await?;
    seed(&s, "aa", "second").await?;
    seed(&s, "mm", "third").await?;
    // Updating an entity must not move it.
    s.save(update_of(&first, "first-renamed"))
        .await
        .map_err(|e| format!("save: {e}"))?;
    let page = s
        .list(MODEL, None, Pagination::default())
        .await
        .map_err(|e| format!("list: {e}"))?;
    let ids: Vec<&str> = page.items.iter().map(|r| r.id.as_str()).collect();
    if ids != ["zz", "aa", "mm"] {
        return Err(format!("expected insertion order, got {ids:?}"));
    }
    Ok(())
}
