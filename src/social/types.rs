use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Entity;
use crate::record::Collection;

/// A feed post with its author denormalized for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
  pub id: String,
  pub content: String,
  #[serde(default)]
  pub image_url: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub user_id: String,
  #[serde(default)]
  pub user_name: Option<String>,
  #[serde(default)]
  pub user_username: Option<String>,
  #[serde(default)]
  pub user_avatar: Option<String>,
  #[serde(default)]
  pub likes_count: u64,
  #[serde(default)]
  pub comments_count: u64,
  /// Whether the current user likes the post
  #[serde(default)]
  pub is_liked: bool,
}

impl Post {
  /// Flip the like flag and move the counter with it.
  pub fn toggle_like(&mut self) {
    if self.is_liked {
      self.likes_count = self.likes_count.saturating_sub(1);
    } else {
      self.likes_count = self.likes_count.saturating_add(1);
    }
    self.is_liked = !self.is_liked;
  }
}

impl Entity for Post {
  fn collection() -> Collection {
    Collection::Posts
  }

  fn id(&self) -> &str {
    &self.id
  }

  fn version(&self) -> i64 {
    self.updated_at.timestamp_millis()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
  pub id: String,
  pub name: String,
  pub username: String,
  #[serde(default)]
  pub avatar: Option<String>,
  #[serde(default)]
  pub bio: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Entity for Profile {
  fn collection() -> Collection {
    Collection::Profiles
  }

  fn id(&self) -> &str {
    &self.id
  }

  fn version(&self) -> i64 {
    self.updated_at.timestamp_millis()
  }
}

/// Notification category as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
  Message,
  FriendRequest,
  FriendAccepted,
  Like,
  Comment,
  System,
  GroupJoinApproved,
  GroupJoinRejected,
  GroupMessage,
  #[serde(other)]
  Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: NotificationKind,
  pub content: String,
  /// Post, message or group the notification points at
  #[serde(default)]
  pub reference_id: Option<String>,
  #[serde(default)]
  pub read: bool,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
  pub user_id: String,
}

impl Entity for Notification {
  fn collection() -> Collection {
    Collection::Notifications
  }

  fn id(&self) -> &str {
    &self.id
  }

  fn version(&self) -> i64 {
    self.updated_at.unwrap_or(self.created_at).timestamp_millis()
  }
}

/// Direct message between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
  pub id: String,
  pub sender_id: String,
  pub receiver_id: String,
  pub content: String,
  #[serde(default)]
  pub read: bool,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for Message {
  fn collection() -> Collection {
    Collection::Messages
  }

  fn id(&self) -> &str {
    &self.id
  }

  fn version(&self) -> i64 {
    self.updated_at.unwrap_or(self.created_at).timestamp_millis()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub avatar: Option<String>,
  #[serde(default)]
  pub is_private: bool,
  pub created_by: String,
  #[serde(default)]
  pub member_count: u64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Entity for Group {
  fn collection() -> Collection {
    Collection::Groups
  }

  fn id(&self) -> &str {
    &self.id
  }

  fn version(&self) -> i64 {
    self.updated_at.timestamp_millis()
  }
}
