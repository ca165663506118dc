//! Typed views of the social collections.
//!
//! The engine stores untyped [`Record`]s; these types give view code
//! structured access to them.

mod types;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageError;
use crate::record::{Collection, Record};

pub use types::{Group, Message, Notification, NotificationKind, Post, Profile};

/// A typed record of one collection.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync {
  fn collection() -> Collection;

  fn id(&self) -> &str;

  /// Last-write-wins version (`updated_at` in epoch millis).
  fn version(&self) -> i64;

  fn to_record(&self) -> Result<Record, StorageError> {
    Ok(Record::new(
      self.id(),
      self.version(),
      serde_json::to_value(self)?,
    ))
  }

  fn from_record(record: &Record) -> Result<Self, StorageError> {
    Ok(serde_json::from_value(record.data.clone())?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{TimeZone, Utc};
  use serde_json::json;

  fn post() -> Post {
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    Post {
      id: "p1".into(),
      content: "hello".into(),
      image_url: None,
      created_at: at,
      updated_at: at,
      user_id: "u1".into(),
      user_name: Some("Ada".into()),
      user_username: Some("ada".into()),
      user_avatar: None,
      likes_count: 3,
      comments_count: 0,
      is_liked: false,
    }
  }

  #[test]
  fn test_post_record_conversion() {
    let post = post();
    let record = post.to_record().unwrap();
    assert_eq!(record.id, "p1");
    assert_eq!(record.version, post.updated_at.timestamp_millis());
    assert_eq!(record.data["likes_count"], 3);
    assert_eq!(Post::from_record(&record).unwrap(), post);
  }

  #[test]
  fn test_toggle_like_moves_counter_with_flag() {
    let mut post = post();
    post.toggle_like();
    assert!(post.is_liked);
    assert_eq!(post.likes_count, 4);
    post.toggle_like();
    assert!(!post.is_liked);
    assert_eq!(post.likes_count, 3);

    post.likes_count = 0;
    post.is_liked = true;
    post.toggle_like();
    assert_eq!(post.likes_count, 0);
  }

  #[test]
  fn test_notification_kind_from_wire() {
    let record = Record::new(
      "n1",
      1,
      json!({
        "id": "n1",
        "type": "friend_request",
        "content": "Bob wants to be friends",
        "read": false,
        "created_at": "2024-03-01T12:00:00Z",
        "user_id": "u1"
      }),
    );
    let notification = Notification::from_record(&record).unwrap();
    assert_eq!(notification.kind, NotificationKind::FriendRequest);
    assert_eq!(notification.reference_id, None);
    assert_eq!(notification.version(), notification.created_at.timestamp_millis());

    let unknown = Record::new("n2", 1, json!({
      "id": "n2", "type": "story_view", "content": "", "created_at": "2024-03-01T12:00:00Z", "user_id": "u1"
    }));
    assert_eq!(
      Notification::from_record(&unknown).unwrap().kind,
      NotificationKind::Other
    );
  }

  #[test]
  fn test_malformed_record_is_serialization_error() {
    let record = Record::new("g1", 1, json!({ "id": "g1" }));
    assert!(matches!(
      Group::from_record(&record),
      Err(StorageError::Serialization(_))
    ));
  }
}
