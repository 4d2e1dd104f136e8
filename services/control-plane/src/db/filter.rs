//! Query filters and document patches.
//!
//! Both are plain data. The in-memory store evaluates them directly; the
//! Postgres store translates them into `jsonb` predicates.

use serde_json::Value;

use super::path::get_path;

/// A predicate over one dotted path of a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals the value.
    Eq(String, Value),
    /// Field equals one of the values.
    In(String, Vec<Value>),
    /// Field is absent or equals none of the values.
    NotIn(String, Vec<Value>),
    /// Field is absent or null.
    Missing(String),
    /// Field is present and not null.
    Exists(String),
    /// At least one of the conditions holds.
    AnyOf(Vec<Condition>),
}

impl Condition {
    pub fn matches(&self, doc: &Value) -> bool {
        let field = |path: &str| get_path(doc, path).filter(|v| !v.is_null());
        match self {
            Self::Eq(path, value) => field(path) == Some(value),
            Self::In(path, values) => field(path).is_some_and(|f| values.contains(f)),
            Self::NotIn(path, values) => field(path).is_none_or(|f| !values.contains(f)),
            Self::Missing(path) => field(path).is_none(),
            Self::Exists(path) => field(path).is_some(),
            Self::AnyOf(conditions) => conditions.iter().any(|c| c.matches(doc)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Newest first.
    #[default]
    CreatedAtDesc,
    CreatedAtAsc,
}

/// Zero-based page of results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Pagination {
    pub fn offset(&self) -> usize {
        self.page as usize * self.page_size as usize
    }
}

/// Selection of documents within one collection.
///
/// Soft-deleted documents are excluded unless [`Filter::with_deleted`] is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
    pub include_deleted: bool,
    pub sort: SortOrder,
    pub pagination: Option<Pagination>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(path.into(), value.into()));
        self
    }

    pub fn with_in<V: Into<Value>>(
        mut self,
        path: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.conditions.push(Condition::In(path.into(), values));
        self
    }

    pub fn with_not_in<V: Into<Value>>(
        mut self,
        path: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.conditions.push(Condition::NotIn(path.into(), values));
        self
    }

    pub fn with_missing(mut self, path: impl Into<String>) -> Self {
        self.conditions.push(Condition::Missing(path.into()));
        self
    }

    pub fn with_exists(mut self, path: impl Into<String>) -> Self {
        self.conditions.push(Condition::Exists(path.into()));
        self
    }

    /// Require at least one of `conditions`. An empty list matches nothing.
    pub fn with_any_of(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions.push(Condition::AnyOf(conditions.into_iter().collect()));
        self
    }

    pub fn with_owner(self, owner_id: impl Into<String>) -> Self {
        self.with_eq("ownerId", owner_id.into())
    }

    pub fn with_owners<S: Into<String>>(self, owner_ids: impl IntoIterator<Item = S>) -> Self {
        self.with_in("ownerId", owner_ids.into_iter().map(Into::into))
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.with_eq("name", name.into())
    }

    pub fn with_ids<S: Into<String>>(self, ids: impl IntoIterator<Item = S>) -> Self {
        self.with_in("id", ids.into_iter().map(Into::into))
    }

    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_pagination(mut self, pagination: Option<Pagination>) -> Self {
        self.pagination = pagination;
        self
    }

    /// Whether `doc` passes the conditions and the deleted check.
    pub fn matches(&self, doc: &Value) -> bool {
        if !self.include_deleted && is_deleted(doc) {
            return false;
        }
        self.conditions.iter().all(|c| c.matches(doc))
    }
}

/// A document is soft-deleted when `deletedAt` is set.
pub fn is_deleted(doc: &Value) -> bool {
    doc.get("deletedAt").is_some_and(|v| !v.is_null())
}

/// A field-level update of one document, applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    /// Compare-and-set guards: the patch applies only if all hold.
    pub guards: Vec<Condition>,
    pub set: Vec<(String, Value)>,
    pub unset: Vec<String>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((path.into(), value.into()));
        self
    }

    /// Sets `path` when `value` is present; leaves the field alone otherwise.
    pub fn set_some(self, path: impl Into<String>, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.set(path, value),
            None => self,
        }
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    pub fn when(mut self, guard: Condition) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }
}

/// Result of applying a [`Patch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    NotFound,
    GuardFailed,
    Applied,
}

impl PatchOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "id": "a",
            "name": "web",
            "ownerId": "u1",
            "activities": {"updating": {"name": "updating"}},
            "vmId": null,
        })
    }

    #[rstest]
    #[case(Condition::Eq("name".into(), json!("web")), true)]
    #[case(Condition::Eq("name".into(), json!("api")), false)]
    #[case(Condition::In("ownerId".into(), vec![json!("u1"), json!("u2")]), true)]
    #[case(Condition::In("ownerId".into(), vec![]), false)]
    #[case(Condition::NotIn("ownerId".into(), vec![json!("u2")]), true)]
    #[case(Condition::NotIn("missing".into(), vec![json!("u2")]), true)]
    #[case(Condition::Missing("vmId".into()), true)]
    #[case(Condition::Missing("activities.updating".into()), false)]
    #[case(Condition::Exists("activities.updating".into()), true)]
    #[case(Condition::Exists("activities.repairing".into()), false)]
    #[case(Condition::AnyOf(vec![Condition::Eq("name".into(), json!("api")), Condition::Eq("ownerId".into(), json!("u1"))]), true)]
    #[case(Condition::AnyOf(vec![Condition::Eq("name".into(), json!("api")), Condition::Exists("vmId".into())]), false)]
    #[case(Condition::AnyOf(vec![]), false)]
    fn test_condition_matches(#[case] condition: Condition, #[case] expected: bool) {
        assert_eq!(condition.matches(&doc()), expected);
    }

    #[test]
    fn test_filter_hides_deleted() {
        let mut deleted = doc();
        deleted["deletedAt"] = json!("2024-01-01T00:00:00Z");

        let filter = Filter::new().with_owner("u1");
        assert!(filter.matches(&doc()));
        assert!(!filter.matches(&deleted));
        assert!(filter.with_deleted().matches(&deleted));
    }

    #[test]
    fn test_pagination_offset() {
        let page = Pagination {
            page: 3,
            page_size: 20,
        };
        assert_eq!(page.offset(), 60);
    }

    #[test]
    fn test_patch_set_some_skips_none() {
        let patch = Patch::new()
            .set_some("replicas", Some(2))
            .set_some("image", None::<String>);
        assert_eq!(patch.set, vec![("replicas".to_string(), json!(2))]);
    }
}
