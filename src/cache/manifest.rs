//! Build-time asset manifest.
//!
//! The build step emits a script fragment of the form
//!
//! ```text
//! const assets = ["/index.html", "/main.1a2b.js"];
//! const cacheName = "offline-cache";
//! ...
//! //*invalidator:1a2b:3c4d
//! ```
//!
//! The asset list is what gets cached at install time; the footer lists one
//! content hash per asset and only serves as a fingerprint for staleness.

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::path::Path;
use url::Url;

pub const DEFAULT_CACHE_NAME: &str = "offline-cache";

const ASSETS_MARKER: &str = "const assets =";
const CACHE_NAME_MARKER: &str = "const cacheName =";
const INVALIDATOR_MARKER: &str = "//*invalidator:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
  /// Absolute asset paths, in manifest order
  pub assets: Vec<String>,
  pub cache_name: String,
  /// Per-asset content hashes from the footer
  pub hashes: Vec<String>,
}

impl Manifest {
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read manifest {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse manifest {}: {}", path.display(), e))
  }

  pub fn parse(text: &str) -> Result<Self> {
    let assets: Vec<String> = literal_after(text, ASSETS_MARKER)?
      .ok_or_else(|| eyre!("Missing `{}` declaration", ASSETS_MARKER))?;

    let cache_name: String = literal_after(text, CACHE_NAME_MARKER)?
      .unwrap_or_else(|| DEFAULT_CACHE_NAME.to_string());

    let hashes = text
      .lines()
      .rev()
      .find_map(|line| line.trim().strip_prefix(INVALIDATOR_MARKER))
      .map(|rest| {
        rest
          .split(':')
          .map(str::trim)
          .filter(|h| !h.is_empty())
          .map(String::from)
          .collect()
      })
      .unwrap_or_default();

    Ok(Self {
      assets,
      cache_name,
      hashes,
    })
  }

  /// SHA-256 of the colon-joined hash list. Changes whenever any asset changes.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.hashes.join(":").as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Asset URLs resolved against the site origin.
  pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>> {
    self
      .assets
      .iter()
      .map(|asset| {
        origin
          .join(asset)
          .map_err(|e| eyre!("Invalid asset URL {}: {}", asset, e))
      })
      .collect()
  }
}

/// Parse the JSON literal that follows `marker`, ignoring whatever comes after it.
fn literal_after<T: DeserializeOwned>(text: &str, marker: &str) -> Result<Option<T>> {
  let Some(start) = text.find(marker) else {
    return Ok(None);
  };

  let rest = &text[start + marker.len()..];
  serde_json::Deserializer::from_str(rest)
    .into_iter::<T>()
    .next()
    .transpose()
    .map_err(|e| eyre!("Invalid literal after `{}`: {}", marker, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  const FRAGMENT: &str = r#"
      const assets = ["/index.html","/main.4f1c.js","/styles.9ab0.css"];
      const cacheName = "offline-cache-v2";
self.addEventListener("install", () => {});
//*invalidator:4f1c:9ab0:77de"#;

  #[test]
  fn test_parse_generated_fragment() {
    let manifest = Manifest::parse(FRAGMENT).unwrap();
    assert_eq!(
      manifest.assets,
      vec!["/index.html", "/main.4f1c.js", "/styles.9ab0.css"]
    );
    assert_eq!(manifest.cache_name, "offline-cache-v2");
    assert_eq!(manifest.hashes, vec!["4f1c", "9ab0", "77de"]);
  }

  #[test]
  fn test_missing_cache_name_uses_default() {
    let manifest = Manifest::parse(r#"const assets = [];"#).unwrap();
    assert_eq!(manifest.cache_name, DEFAULT_CACHE_NAME);
    assert!(manifest.assets.is_empty());
    assert!(manifest.hashes.is_empty());
  }

  #[test]
  fn test_missing_asset_list_is_an_error() {
    assert!(Manifest::parse("//*invalidator:abc").is_err());
  }

  #[test]
  fn test_fingerprint_tracks_hashes() {
    let a = Manifest::parse(FRAGMENT).unwrap();
    let mut b = a.clone();
    assert_eq!(a.fingerprint(), b.fingerprint());

    b.hashes[1] = "9ab1".to_string();
    assert_ne!(a.fingerprint(), b.fingerprint());
    assert_eq!(a.fingerprint().len(), 64);
  }

  #[test]
  fn test_resolve_against_origin() {
    let manifest = Manifest::parse(FRAGMENT).unwrap();
    let origin = Url::parse("http://localhost:8000/").unwrap();
    let urls = manifest.resolve(&origin).unwrap();
    assert_eq!(urls[1].as_str(), "http://localhost:8000/main.4f1c.js");
  }
}
