//! Identity searches passed through to the storage driver
//!
//! Queries select identities of one kind. Drivers translate them into their
//! own scan or filter language; [`Query::matches`] gives the reference
//! semantics used by the in-memory driver.

use crate::record::Record;
use chrono::{DateTime, Utc};
use persistio_common::{Error, Identity, Result};
use serde_json::Value;

/// Selection criteria within one kind
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every record of the kind
    All,
    /// Records whose key is listed
    Ids(Vec<String>),
    /// Keys starting with the prefix
    Prefix(String),
    /// Keys in `[from, to)`; a missing bound is open
    Range {
        from: Option<String>,
        to: Option<String>,
    },
    /// Last modification in `[after, before)`; a missing bound is open
    Modified {
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    },
    /// A user field equal to a value
    FieldEq { name: String, value: Value },
}

/// Identity search over one kind
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    kind: String,
    filter: Filter,
    limit: Option<usize>,
}

impl Query {
    pub fn new(kind: impl Into<String>, filter: Filter) -> Self {
        Self {
            kind: kind.into(),
            filter,
            limit: None,
        }
    }

    pub fn all(kind: impl Into<String>) -> Self {
        Self::new(kind, Filter::All)
    }

    pub fn ids<I, S>(kind: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(kind, Filter::Ids(keys.into_iter().map(Into::into).collect()))
    }

    pub fn prefix(kind: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::new(kind, Filter::Prefix(prefix.into()))
    }

    pub fn range(kind: impl Into<String>, from: Option<String>, to: Option<String>) -> Self {
        Self::new(kind, Filter::Range { from, to })
    }

    pub fn modified_between(
        kind: impl Into<String>,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        Self::new(kind, Filter::Modified { after, before })
    }

    /// Filter on a user field; reserved attributes are rejected
    pub fn field_eq(
        kind: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Self> {
        let query = Self::new(
            kind,
            Filter::FieldEq {
                name: name.into(),
                value: value.into(),
            },
        );
        query.validate()?;
        Ok(query)
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub const fn filter(&self) -> &Filter {
        &self.filter
    }

    pub const fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn validate(&self) -> Result<()> {
        if let Filter::FieldEq { name, .. } = &self.filter {
            if Record::is_reserved(name) {
                return Err(Error::invalid_argument(format!(
                    "cannot filter on reserved attribute {name:?}"
                )));
            }
        }
        Ok(())
    }

    /// Whether a stored record satisfies this query
    pub fn matches(&self, id: &Identity, record: &Record) -> bool {
        if id.kind() != self.kind {
            return false;
        }
        let key = id.key();
        match &self.filter {
            Filter::All => true,
            Filter::Ids(keys) => keys.iter().any(|k| k == key),
            Filter::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Filter::Range { from, to } => {
                from.as_deref().is_none_or(|from| key >= from)
                    && to.as_deref().is_none_or(|to| key < to)
            }
            Filter::Modified { after, before } => record.modified().is_some_and(|modified| {
                after.is_none_or(|after| modified >= after)
                    && before.is_none_or(|before| modified < before)
            }),
            Filter::FieldEq { name, value } => record.get(name) == Some(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use persistio_version::VersionLineage;
    use serde_json::json;

    fn stored(key: &str, modified: DateTime<Utc>) -> (Identity, Record) {
        let id = Identity::new("user", key).unwrap();
        let mut record = Record::new().with("tier", "gold").unwrap();
        record.stamp(&id, &VersionLineage::parse("a+1"), modified, None);
        (id, record)
    }

    #[test]
    fn test_key_filters() {
        let when = Utc::now();
        let (id, record) = stored("acct-17", when);

        assert!(Query::all("user").matches(&id, &record));
        assert!(!Query::all("order").matches(&id, &record));
        assert!(Query::prefix("user", "acct-").matches(&id, &record));
        assert!(!Query::prefix("user", "org-").matches(&id, &record));
        assert!(Query::ids("user", ["x", "acct-17"]).matches(&id, &record));
        assert!(Query::range("user", Some("acct-1".into()), Some("acct-2".into())).matches(&id, &record));
        assert!(!Query::range("user", None, Some("acct-17".into())).matches(&id, &record));
    }

    #[test]
    fn test_modified_window() {
        let when = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let (id, record) = stored("1", when);
        let before = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();

        assert!(Query::modified_between("user", Some(before), Some(after)).matches(&id, &record));
        assert!(Query::modified_between("user", Some(when), None).matches(&id, &record));
        assert!(!Query::modified_between("user", None, Some(when)).matches(&id, &record));
    }

    #[test]
    fn test_field_filter() {
        let (id, record) = stored("1", Utc::now());
        assert!(Query::field_eq("user", "tier", "gold").unwrap().matches(&id, &record));
        assert!(!Query::field_eq("user", "tier", json!("silver")).unwrap().matches(&id, &record));
    }

    #[test]
    fn test_reserved_field_filter_rejected() {
        let err = Query::field_eq("user", "__owner", "a").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let raw = Query::new(
            "user",
            Filter::FieldEq {
                name: "__version".into(),
                value: json!("a+1"),
            },
        );
        assert!(raw.validate().is_err());
    }
}
