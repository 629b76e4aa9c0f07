use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::cache::records::id_value;

/// A restaurant as served by the API. Fields the client does not use are
/// kept in `extra` so records survive a round trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restaurant {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: i64,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub neighborhood: String,
  #[serde(default)]
  pub cuisine_type: String,
  #[serde(default, deserialize_with = "deserialize_flag")]
  pub is_favorite: bool,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
  #[serde(default, deserialize_with = "deserialize_optional_id")]
  pub id: Option<i64>,
  #[serde(deserialize_with = "deserialize_id")]
  pub restaurant_id: i64,
  #[serde(default)]
  pub name: String,
  #[serde(default, deserialize_with = "deserialize_optional_id")]
  pub rating: Option<i64>,
  #[serde(default)]
  pub comments: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Review body as submitted by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReview {
  pub restaurant_id: i64,
  pub name: String,
  pub rating: u8,
  pub comments: String,
}

/// The API sends ids as numbers but echoes them back as strings after writes.
fn deserialize_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
  D: Deserializer<'de>,
{
  let value = Value::deserialize(deserializer)?;
  id_value(&value).ok_or_else(|| serde::de::Error::custom(format!("invalid id: {}", value)))
}

fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
  D: Deserializer<'de>,
{
  let value = Value::deserialize(deserializer)?;
  Ok(id_value(&value))
}

/// Favorites come back as `true` or `"true"` depending on how they were set.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(match Value::deserialize(deserializer)? {
    Value::Bool(b) => b,
    Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
    _ => false,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_restaurant_accepts_string_favorite() {
    let restaurant: Restaurant = serde_json::from_value(json!({
      "id": 3,
      "name": "Kang Ho Dong Baekjeong",
      "neighborhood": "Manhattan",
      "cuisine_type": "Asian",
      "is_favorite": "true",
      "photograph": "3.jpg"
    }))
    .unwrap();

    assert!(restaurant.is_favorite);
    assert_eq!(restaurant.extra["photograph"], "3.jpg");
  }

  #[test]
  fn test_restaurant_missing_favorite_defaults_false() {
    let restaurant: Restaurant = serde_json::from_value(json!({"id": "4"})).unwrap();
    assert_eq!(restaurant.id, 4);
    assert!(!restaurant.is_favorite);
  }

  #[test]
  fn test_review_with_string_ids() {
    let review: Review = serde_json::from_value(json!({
      "id": 30,
      "restaurant_id": "2",
      "name": "Lee",
      "rating": "4",
      "comments": "Great"
    }))
    .unwrap();

    assert_eq!(review.restaurant_id, 2);
    assert_eq!(review.rating, Some(4));
  }
}
