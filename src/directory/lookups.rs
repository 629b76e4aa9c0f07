use std::sync::OnceLock;

use super::types::Restaurant;

/// Neighborhood and cuisine lists for filter menus.
///
/// Filled from the first non-empty restaurant list seen in a session and
/// never refreshed afterwards.
#[derive(Debug, Default)]
pub struct Lookups {
  neighborhoods: OnceLock<Vec<String>>,
  cuisines: OnceLock<Vec<String>>,
}

impl Lookups {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fill both lists if they are still empty. Returns whether anything was stored.
  pub fn populate(&self, restaurants: &[Restaurant]) -> bool {
    if restaurants.is_empty() {
      return false;
    }

    let neighborhoods = self
      .neighborhoods
      .set(unique(restaurants.iter().map(|r| r.neighborhood.as_str())))
      .is_ok();
    let cuisines = self
      .cuisines
      .set(unique(restaurants.iter().map(|r| r.cuisine_type.as_str())))
      .is_ok();

    neighborhoods || cuisines
  }

  pub fn neighborhoods(&self) -> Option<&[String]> {
    self.neighborhoods.get().map(Vec::as_slice)
  }

  pub fn cuisines(&self) -> Option<&[String]> {
    self.cuisines.get().map(Vec::as_slice)
  }
}

/// Distinct values in first-seen order.
fn unique<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
  let mut out: Vec<String> = Vec::new();
  for value in values {
    if !out.iter().any(|v| v == value) {
      out.push(value.to_string());
    }
  }
  out
}
