//! Types for paging through a container's objects.

use super::{container::Container, object::ObjectMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hard cap on a single enumeration page.
pub const MAX_PAGE_SIZE: i64 = 1000;

/// Page size used when the caller gives neither an index nor a maximum.
pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// Optional predicates applied when enumerating a container.
///
/// Every populated field narrows the result; an empty filter matches
/// every object.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EnumerationFilter {
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub accessed_after: Option<DateTime<Utc>>,
    pub accessed_before: Option<DateTime<Utc>>,
    pub prefix: Option<String>,
    pub md5: Option<String>,
    pub content_type: Option<String>,
    pub size_min: Option<i64>,
    pub size_max: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub key_values: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OrderBy {
    #[default]
    LastUpdateDescending,
    LastUpdateAscending,
    CreatedDescending,
    CreatedAscending,
    KeyAscending,
    KeyDescending,
    SizeDescending,
    SizeAscending,
}

impl OrderBy {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            Self::LastUpdateDescending => " ORDER BY last_update_utc DESC, object_key ASC",
            Self::LastUpdateAscending => " ORDER BY last_update_utc ASC, object_key ASC",
            Self::CreatedDescending => " ORDER BY created_utc DESC, object_key ASC",
            Self::CreatedAscending => " ORDER BY created_utc ASC, object_key ASC",
            Self::KeyAscending => " ORDER BY object_key ASC",
            Self::KeyDescending => " ORDER BY object_key DESC",
            Self::SizeDescending => " ORDER BY content_length DESC, object_key ASC",
            Self::SizeAscending => " ORDER BY content_length ASC, object_key ASC",
        }
    }
}

/// Cursor plus filter for one enumeration request.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EnumerationQuery {
    pub index_start: Option<i64>,
    pub max_results: Option<i64>,
    #[serde(default)]
    pub filter: EnumerationFilter,
    #[serde(default)]
    pub order_by: OrderBy,
}

impl EnumerationQuery {
    pub fn page(index_start: i64, max_results: i64) -> Self {
        Self {
            index_start: Some(index_start),
            max_results: Some(max_results),
            ..Default::default()
        }
    }

    /// Resolve the cursor into a concrete `(offset, limit)` pair.
    ///
    /// With neither field set the default page size applies; the limit is
    /// always clamped to `1..=MAX_PAGE_SIZE`.
    pub fn resolved_page(&self) -> (i64, i64) {
        let offset = self.index_start.unwrap_or(0).max(0);
        let limit = match (self.index_start, self.max_results) {
            (None, None) => DEFAULT_PAGE_SIZE,
            (_, Some(max)) => max,
            (Some(_), None) => MAX_PAGE_SIZE,
        };
        (offset, limit.clamp(1, MAX_PAGE_SIZE))
    }
}

/// One page of a container listing plus container-wide aggregates.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContainerMetadata {
    pub container: Container,
    pub index_start: i64,
    pub max_results: i64,
    /// Objects in the whole container, ignoring the filter.
    pub object_count: i64,
    /// Bytes in the whole container, ignoring the filter.
    pub bytes_total: i64,
    pub filter: EnumerationFilter,
    pub objects: Vec<ObjectMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_page_is_one_hundred() {
        assert_eq!(EnumerationQuery::default().resolved_page(), (0, 100));
    }

    #[test]
    fn page_size_is_clamped() {
        assert_eq!(EnumerationQuery::page(5, 5000).resolved_page(), (5, 1000));
        assert_eq!(EnumerationQuery::page(-3, 0).resolved_page(), (0, 1));
    }

    #[test]
    fn index_without_max_uses_page_cap() {
        let q = EnumerationQuery {
            index_start: Some(10),
            ..Default::default()
        };
        assert_eq!(q.resolved_page(), (10, 1000));
    }
}
