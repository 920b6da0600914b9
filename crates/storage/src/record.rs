use serde::{Deserialize, Serialize};

/// One immutable snapshot of an entity, keyed by `(model, id, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub model: String,
    pub id: String,
    /// Starts at 1 and grows by exactly one per successful mutation.
    pub version: i64,
    /// UNIX seconds of version 1; carried unchanged into later versions.
    pub time_created: i64,
    pub time_updated: i64,
    /// 0 while the entity is live.
    pub time_deleted: i64,
    pub initiator_id: Option<String>,
    /// Value that must be unique among live entities of the same model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    pub data: serde_json::Value,
}

impl VersionedRecord {
    pub fn is_deleted(&self) -> bool {
        self.time_deleted != 0
    }
}

/// Payload for the first version of an entity.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub model: String,
    pub id: String,
    pub initiator_id: Option<String>,
    pub unique_key: Option<String>,
    pub data: serde_json::Value,
}

/// A compare-and-swap write: applied only if the stored version still
/// equals `expected_version`.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub model: String,
    pub id: String,
    pub expected_version: i64,
    pub initiator_id: Option<String>,
    pub unique_key: Option<String>,
    pub data: serde_json::Value,
}

/// 1-based page selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub per_page: usize,
}

impl Pagination {
    pub fn new(page: usize, per_page: usize) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.max(1),
        }
    }

    /// A single page large enough to hold everything.
    pub fn all() -> Self {
        Self {
            page: 1,
            per_page: usize::MAX,
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) - 1).saturating_mul(self.per_page)
    }

    /// Slice an already-ordered sequence into this page.
    pub fn apply<T, I>(&self, items: I) -> Page<T>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let iter = items.into_iter();
        let total = iter.len();
        let items = iter.skip(self.offset()).take(self.per_page).collect();
        Page {
            total,
            page: self.page,
            per_page: self.per_page,
            items,
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 25,
        }
    }
}

/// A page of results plus the size of the full result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            total: self.total,
            page: self.page,
            per_page: self.per_page,
            items: self.items.into_iter().map(f).collect(),
        }
    }

    pub fn try_map<U, E, F>(self, f: F) -> Result<Page<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        Ok(Page {
            total: self.total,
            page: self.page,
            per_page: self.per_page,
            items: self.items.into_iter().map(f).collect::<Result<_, _>>()?,
        })
    }
}

/// Equality filter on a top-level field of `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFilter {
    pub field: String,
    pub value: serde_json::Value,
}

impl RecordFilter {
    pub fn field_eq(field: &str, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &VersionedRecord) -> bool {
        record.data.get(&self.field) == Some(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_slices_and_counts() {
        let page = Pagination::new(2, 2).apply(vec![1, 2, 3, 4, 5]);
        assert_eq!(page.total, 5);
        assert_eq!(page.items, vec![3, 4]);

        let last = Pagination::new(3, 2).apply(vec![1, 2, 3, 4, 5]);
        assert_eq!(last.items, vec![5]);

        let beyond = Pagination::new(9, 2).apply(vec![1, 2, 3]);
        assert_eq!(beyond.total, 3);
        assert!(beyond.items.is_empty());
    }

    #[test]
    fn pagination_clamps_zero_page() {
        let p = Pagination::new(0, 0);
        assert_eq!(p.page, 1);
        assert_eq!(p.per_page, 1);
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn filter_matches_top_level_field() {
        let record = VersionedRecord {
            model: "execution_step".into(),
            id: "s1".into(),
            version: 1,
            time_created: 1,
            time_updated: 1,
            time_deleted: 0,
            initiator_id: None,
            unique_key: None,
            data: serde_json::json!({"execution_id": "e1"}),
        };
        assert!(RecordFilter::field_eq("execution_id", "e1").matches(&record));
        assert!(!RecordFilter::field_eq("execution_id", "e2").matches(&record));
        assert!(!RecordFilter::field_eq("missing", "e1").matches(&record));
    }
}
