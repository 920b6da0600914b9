//! Conformance test suite for `EntityStore` implementations.
//!
//! This module provides a backend-agnostic test suite that any `EntityStore`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Creation**: version 1, id and unique-key collisions
//! - **Version validation / OCC**: compare-and-swap conflict detection
//! - **Soft deletion**: deleted entities refuse every further mutation
//! - **History**: append-only versions, newest first, exact snapshots
//! - **Concurrency**: racing writers on the same version, exactly one wins
//! - **Error handling**: correct error variants for missing entities
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty store for each test:
//!
//! ```ignore
//! use strata_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_postgres_store().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod concurrent;
mod create;
mod delete;
mod error;
mod history;
mod version;

use std::fmt;
use std::future::Future;

use crate::record::{NewRecord, RecordUpdate, VersionedRecord};
use crate::EntityStore;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "create", "version", "delete").
    pub category: String,
    /// Test name (e.g. "create_starts_at_version_1").
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a store backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// store, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: EntityStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(create::run_create_tests(&factory).await);
    results.extend(error::run_error_tests(&factory).await);
    results.extend(version::run_version_tests(&factory).await);
    results.extend(delete::run_delete_tests(&factory).await);
    results.extend(history::run_history_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

const MODEL: &str = "cluster";

fn new_record(id: &str, name: &str) -> NewRecord {
    NewRecord {
        model: MODEL.to_string(),
        id: id.to_string(),
        initiator_id: Some("tester".to_string()),
        unique_key: Some(name.to_string()),
        data: serde_json::json!({"name": name}),
    }
}

fn update_of(record: &VersionedRecord, name: &str) -> RecordUpdate {
    RecordUpdate {
        model: record.model.clone(),
        id: record.id.clone(),
        expected_version: record.version,
        initiator_id: Some("tester".to_string()),
        unique_key: Some(name.to_string()),
        data: serde_json::json!({"name": name}),
    }
}

async fn seed<S: EntityStore>(store: &S, id: &str, name: &str) -> Result<VersionedRecord, String> {
    store
        .create(new_record(id, name))
        .await
        .map_err(|e| format!("create {id}: {e}"))
}
