//! Local cache patches applied before the server confirms a change.

use chrono::Utc;
use color_eyre::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::cache::records::{id_value, RestaurantRecord, ReviewRecord, AGGREGATE_KEY};
use crate::db::{Key, Store};

/// Which cached representations an update touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Patched {
  pub aggregate: bool,
  pub detail: bool,
}

impl Patched {
  pub fn any(&self) -> bool {
    self.aggregate || self.detail
  }
}

#[derive(Clone)]
pub struct OptimisticUpdater {
  store: Arc<Store>,
}

impl OptimisticUpdater {
  pub fn new(store: Arc<Store>) -> Self {
    Self { store }
  }

  /// Shallow-merge `changes` into the cached list entry and detail record for `id`.
  ///
  /// Both writes share one transaction, so the list and detail views never
  /// disagree. Representations that are not cached are left alone.
  pub fn update(&self, id: i64, changes: &Map<String, Value>) -> Result<Patched> {
    let patched = self.store.transaction(|tx| {
      let mut patched = Patched::default();

      if let Some(mut aggregate) = tx.get::<RestaurantRecord>(&Key::from(AGGREGATE_KEY))? {
        let merged = aggregate
          .data
          .as_array_mut()
          .and_then(|list| list.iter_mut().find(|entry| has_id(entry, id)))
          .is_some_and(|entry| merge(entry, changes));

        if merged {
          tx.put(&aggregate)?;
          patched.aggregate = true;
        }
      }

      if let Some(mut detail) = tx.get::<RestaurantRecord>(&Key::from(id.to_string()))? {
        if merge(&mut detail.data, changes) {
          tx.put(&detail)?;
          patched.detail = true;
        }
      }

      Ok(patched)
    })?;

    if !patched.any() {
      debug!(id, "No cached data to update");
    }
    Ok(patched)
  }

  /// Store a locally written review so it shows up before it is delivered.
  ///
  /// The id is the current time in milliseconds; reviews are append-only so
  /// it only has to be unique enough not to overwrite a neighbour.
  pub fn add_review(&self, restaurant_id: i64, review: Value) -> Result<i64> {
    let id = Utc::now().timestamp_millis();
    self.store.put(&ReviewRecord {
      id,
      restaurant_id,
      data: review,
    })?;
    Ok(id)
  }
}

fn has_id(entry: &Value, id: i64) -> bool {
  entry.get("id").and_then(id_value) == Some(id)
}

fn merge(target: &mut Value, changes: &Map<String, Value>) -> bool {
  match target.as_object_mut() {
    Some(object) => {
      for (field, value) in changes {
        object.insert(field.clone(), value.clone());
      }
      true
    }
    None => false,
  }
}
