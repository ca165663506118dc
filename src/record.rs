//! Wire-neutral records, collections, queries and change events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A named collection of records on the remote data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
  Posts,
  Profiles,
  Notifications,
  Messages,
  Groups,
}

impl Collection {
  pub const ALL: [Collection; 5] = [
    Collection::Posts,
    Collection::Profiles,
    Collection::Notifications,
    Collection::Messages,
    Collection::Groups,
  ];

  /// Table / namespace name.
  pub fn name(&self) -> &'static str {
    match self {
      Self::Posts => "posts",
      Self::Profiles => "profiles",
      Self::Notifications => "notifications",
      Self::Messages => "messages",
      Self::Groups => "groups",
    }
  }

  /// Default time-to-live of cached records.
  ///
  /// Volatile collections expire quickly so a live conversation never shows
  /// data old enough to visibly desync; low-churn ones are kept longer.
  pub fn default_ttl(&self) -> Duration {
    match self {
      Self::Posts => Duration::from_secs(5 * 60),
      Self::Profiles => Duration::from_secs(30 * 60),
      Self::Notifications => Duration::from_secs(2 * 60),
      Self::Messages => Duration::from_secs(60),
      Self::Groups => Duration::from_secs(10 * 60),
    }
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Collection {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Collection::ALL
      .into_iter()
      .find(|c| c.name().eq_ignore_ascii_case(s.trim()))
      .ok_or_else(|| format!("unknown collection '{}'", s))
  }
}

/// A single record as exchanged with the remote source.
///
/// `version` is the server's monotonic version (or `updated_at` in epoch
/// millis) and drives last-write-wins reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: String,
  pub version: i64,
  pub data: Value,
}

impl Record {
  pub fn new(id: impl Into<String>, version: i64, data: Value) -> Self {
    Self {
      id: id.into(),
      version,
      data,
    }
  }

  /// Bare record carrying only an id (delete events).
  pub fn tombstone(id: impl Into<String>) -> Self {
    Self::new(id, 0, Value::Null)
  }

  pub fn field(&self, name: &str) -> Option<&Value> {
    self.data.get(name)
  }
}

/// Field equality predicate evaluated against `Record::data`.
///
/// The pseudo-field `id` matches the record id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
  pub field: String,
  pub value: Value,
}

impl Filter {
  pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self {
      field: field.into(),
      value: value.into(),
    }
  }

  pub fn matches(&self, record: &Record) -> bool {
    if self.field == "id" {
      return self.value.as_str() == Some(record.id.as_str());
    }
    record.field(&self.field) == Some(&self.value)
  }

  /// Stable textual form, used in cache and channel keys.
  pub fn describe(&self) -> String {
    format!("{}={}", self.field, self.value)
  }
}

/// A collection query: filters plus paging, or an opaque remote procedure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
  #[serde(default)]
  pub filters: Vec<Filter>,
  pub limit: Option<usize>,
  #[serde(default)]
  pub offset: usize,
  /// Remote procedure computing the result set (e.g. `get_user_feed`).
  #[serde(default)]
  pub procedure: Option<Procedure>,
}

/// Opaque remote procedure call returning a record set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
  pub name: String,
  pub args: Value,
}

impl Query {
  /// Every record of the collection.
  pub fn all() -> Self {
    Self::default()
  }

  pub fn by_id(id: &str) -> Self {
    Self::all().filter(Filter::equals("id", id))
  }

  pub fn procedure(name: impl Into<String>, args: Value) -> Self {
    Self {
      procedure: Some(Procedure {
        name: name.into(),
        args,
      }),
      ..Self::default()
    }
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn offset(mut self, offset: usize) -> Self {
    self.offset = offset;
    self
  }

  pub fn matches(&self, record: &Record) -> bool {
    self.filters.iter().all(|f| f.matches(record))
  }

  /// Human-readable description; filters are sorted so equivalent queries
  /// describe identically.
  pub fn description(&self, collection: Collection) -> String {
    let mut filters: Vec<String> = self.filters.iter().map(Filter::describe).collect();
    filters.sort();

    let mut out = format!("{} where [{}]", collection, filters.join(", "));
    if let Some(limit) = self.limit {
      out.push_str(&format!(" limit {}", limit));
    }
    if self.offset > 0 {
      out.push_str(&format!(" offset {}", self.offset));
    }
    if let Some(call) = &self.procedure {
      out.push_str(&format!(" via {}({})", call.name, call.args));
    }
    out
  }

  /// SHA256 of the description for stable, fixed-length keys.
  pub fn cache_key(&self, collection: Collection) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description(collection).as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Kind of write requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

/// Kind of change pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
  Insert,
  Update,
  Delete,
}

/// Server-pushed change of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
  pub kind: ChangeKind,
  pub collection: Collection,
  pub record: Record,
}

impl ChangeEvent {
  pub fn insert(collection: Collection, record: Record) -> Self {
    Self {
      kind: ChangeKind::Insert,
      collection,
      record,
    }
  }

  pub fn update(collection: Collection, record: Record) -> Self {
    Self {
      kind: ChangeKind::Update,
      collection,
      record,
    }
  }

  pub fn delete(collection: Collection, id: impl Into<String>) -> Self {
    Self {
      kind: ChangeKind::Delete,
      collection,
      record: Record::tombstone(id),
    }
  }
}
