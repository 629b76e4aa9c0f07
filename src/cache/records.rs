//! Records kept in the local store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::db::{Collection, Key, Record};
use crate::net::{Method, Request};

/// Key of the restaurant record holding the full list.
pub const AGGREGATE_KEY: &str = "-1";

/// Cached restaurant JSON: the full list under [`AGGREGATE_KEY`], or one
/// restaurant's detail object under its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestaurantRecord {
  pub id: String,
  pub data: Value,
}

impl RestaurantRecord {
  pub fn new(id: impl Into<String>, data: Value) -> Self {
    Self {
      id: id.into(),
      data,
    }
  }
}

impl Record for RestaurantRecord {
  fn collection() -> Collection {
    Collection::Restaurants
  }

  fn key(&self) -> Option<Key> {
    Some(Key::Text(self.id.clone()))
  }
}

/// A review wrapped with the fields it is stored and indexed by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
  pub id: i64,
  pub restaurant_id: i64,
  pub data: Value,
}

impl ReviewRecord {
  /// Wrap a review as returned by the server. `None` if it has no usable ids.
  pub fn from_server(review: Value) -> Option<Self> {
    let id = review.get("id").and_then(id_value)?;
    let restaurant_id = review.get("restaurant_id").and_then(id_value)?;
    Some(Self {
      id,
      restaurant_id,
      data: review,
    })
  }
}

impl Record for ReviewRecord {
  fn collection() -> Collection {
    Collection::Reviews
  }

  fn key(&self) -> Option<Key> {
    Some(Key::Int(self.id))
  }

  fn index_value(&self, index: &str) -> Option<Key> {
    match index {
      "restaurant_id" => Some(Key::Int(self.restaurant_id)),
      _ => None,
    }
  }
}

/// A write waiting to reach the server.
///
/// Every field is optional so that damaged records still load and can be
/// recognized as malformed instead of blocking the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
  #[serde(default)]
  pub url: Option<String>,
  #[serde(default)]
  pub method: Option<String>,
  #[serde(default)]
  pub body: Option<Value>,
}

impl PendingMutation {
  pub fn new(url: impl Into<String>, method: Method, body: Option<Value>) -> Self {
    Self {
      url: Some(url.into()),
      method: Some(method.to_string()),
      body,
    }
  }

  /// Has a URL and a method, and carries a body if it is a POST.
  pub fn is_well_formed(&self) -> bool {
    let has_url = self.url.as_deref().is_some_and(|u| !u.is_empty());
    let method = self.method.as_deref().unwrap_or("");
    let has_body = self.body.as_ref().is_some_and(|b| !b.is_null());

    has_url && !method.is_empty() && !(method.eq_ignore_ascii_case("POST") && !has_body)
  }

  /// The request to replay, or `None` if this mutation cannot be sent.
  pub fn to_request(&self) -> Option<Request> {
    if !self.is_well_formed() {
      return None;
    }

    let url = Url::parse(self.url.as_deref()?).ok()?;
    let method = Method::from_bytes(self.method.as_deref()?.to_ascii_uppercase().as_bytes()).ok()?;

    let request = Request::new(method, url);
    Some(match &self.body {
      Some(body) if !body.is_null() => request.with_json(body.clone()),
      _ => request,
    })
  }
}

/// Queue entry: an auto-assigned, monotonic id plus the mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
  #[serde(default, skip_serializing)]
  pub id: Option<i64>,
  #[serde(default)]
  pub data: PendingMutation,
}

impl PendingRecord {
  pub fn new(data: PendingMutation) -> Self {
    Self { id: None, data }
  }
}

impl Record for PendingRecord {
  fn collection() -> Collection {
    Collection::Pending
  }

  fn key(&self) -> Option<Key> {
    self.id.map(Key::Int)
  }

  fn assign_key(&mut self, key: Key) {
    if let Key::Int(id) = key {
      self.id = Some(id);
    }
  }
}

/// Numeric id from a JSON number or a numeric string.
pub fn id_value(value: &Value) -> Option<i64> {
  match value {
    Value::Number(n) => n.as_i64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}
