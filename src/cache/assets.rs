//! Named cache of static responses, hydrated from the build manifest.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::manifest::Manifest;
use crate::db::Store;
use crate::net::{Request, Response, ResponseSource, Transport};

/// Key the application root document is stored under.
pub const ROOT_KEY: &str = "/";

/// Document fetched at install time and stored under [`ROOT_KEY`].
const ROOT_DOCUMENT: &str = "/index.html";

/// What an install pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
  pub stored: usize,
  pub failed: Vec<String>,
  /// The cache already matched the manifest fingerprint
  pub skipped: bool,
}

/// One named asset cache inside the store.
#[derive(Clone)]
pub struct AssetCache {
  store: Arc<Store>,
  name: String,
}

impl AssetCache {
  pub fn new(store: Arc<Store>, name: impl Into<String>) -> Self {
    Self {
      store,
      name: name.into(),
    }
  }

  /// Cached response stored under `key`.
  pub fn lookup(&self, key: &str) -> Result<Option<Response>> {
    self.store.transaction(|tx| {
      tx.connection()
        .query_row(
          "SELECT status, status_text, content_type, body FROM assets
           WHERE cache_name = ?1 AND url = ?2",
          params![self.name, key],
          |row| {
            Ok(Response {
              status: row.get(0)?,
              status_text: row.get(1)?,
              url: key.to_string(),
              redirected: false,
              content_type: row.get(2)?,
              body: row.get(3)?,
              source: ResponseSource::Cache,
            })
          },
        )
        .optional()
        .map_err(|e| eyre!("Failed to read cached asset {}: {}", key, e))
    })
  }

  pub fn put(&self, key: &str, response: &Response) -> Result<()> {
    self.store.transaction(|tx| {
      tx.connection()
        .execute(
          "INSERT OR REPLACE INTO assets (cache_name, url, status, status_text, content_type, body, cached_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
          params![
            self.name,
            key,
            response.status,
            response.status_text,
            response.content_type,
            response.body
          ],
        )
        .map_err(|e| eyre!("Failed to store asset {}: {}", key, e))?;
      Ok(())
    })
  }

  pub fn len(&self) -> Result<usize> {
    self.store.transaction(|tx| {
      let count: i64 = tx
        .connection()
        .query_row(
          "SELECT COUNT(*) FROM assets WHERE cache_name = ?1",
          params![self.name],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to count assets: {}", e))?;
      Ok(count as usize)
    })
  }

  /// Fingerprint recorded by the last completed install.
  pub fn fingerprint(&self) -> Result<Option<String>> {
    self.store.transaction(|tx| {
      tx.connection()
        .query_row(
          "SELECT fingerprint FROM asset_caches WHERE cache_name = ?1",
          params![self.name],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read cache fingerprint: {}", e))
    })
  }

  /// Drop every entry and the recorded fingerprint.
  pub fn clear(&self) -> Result<usize> {
    self.store.transaction(|tx| {
      let conn = tx.connection();
      let removed = conn
        .execute("DELETE FROM assets WHERE cache_name = ?1", params![self.name])
        .map_err(|e| eyre!("Failed to clear asset cache: {}", e))?;
      conn
        .execute(
          "DELETE FROM asset_caches WHERE cache_name = ?1",
          params![self.name],
        )
        .map_err(|e| eyre!("Failed to clear cache fingerprint: {}", e))?;
      Ok(removed)
    })
  }

  fn record_fingerprint(&self, fingerprint: &str) -> Result<()> {
    self.store.transaction(|tx| {
      tx.connection()
        .execute(
          "INSERT OR REPLACE INTO asset_caches (cache_name, fingerprint, installed_at)
           VALUES (?1, ?2, datetime('now'))",
          params![self.name, fingerprint],
        )
        .map_err(|e| eyre!("Failed to record cache fingerprint: {}", e))?;
      Ok(())
    })
  }

  /// Populate the cache from `manifest`.
  ///
  /// Skipped when the stored fingerprint already matches. Otherwise the cache
  /// is emptied, every asset plus the root document is fetched, and whatever
  /// succeeds is stored. Individual failures only end up in the report.
  pub async fn install(
    &self,
    manifest: &Manifest,
    origin: &Url,
    transport: &dyn Transport,
  ) -> Result<InstallReport> {
    let fingerprint = manifest.fingerprint();
    if self.fingerprint()?.as_deref() == Some(fingerprint.as_str()) {
      debug!(cache = %self.name, "Asset cache is current, skipping install");
      return Ok(InstallReport {
        skipped: true,
        ..InstallReport::default()
      });
    }

    let removed = self.clear()?;
    if removed > 0 {
      info!(cache = %self.name, removed, "Invalidated stale asset cache");
    }

    let mut targets: Vec<(String, Url)> = manifest
      .resolve(origin)?
      .into_iter()
      .map(|url| (url.to_string(), url))
      .collect();
    let root = origin
      .join(ROOT_DOCUMENT)
      .map_err(|e| eyre!("Invalid origin {}: {}", origin, e))?;
    targets.push((ROOT_KEY.to_string(), root));

    let fetches = targets.into_iter().map(|(key, url)| async move {
      let result = transport.send(&Request::get(url.clone())).await;
      (key, url, result)
    });

    let mut report = InstallReport::default();
    for (key, url, result) in join_all(fetches).await {
      match result {
        Ok(response) if response.is_ok() => match self.put(&key, &response) {
          Ok(()) => report.stored += 1,
          Err(e) => {
            warn!(url = %url, error = %e, "Failed to store asset");
            report.failed.push(url.to_string());
          }
        },
        Ok(response) => {
          warn!(url = %url, status = response.status, "Bad response status for asset");
          report.failed.push(url.to_string());
        }
        Err(e) => {
          warn!(url = %url, error = %e, "Failed to fetch asset");
          report.failed.push(url.to_string());
        }
      }
    }

    self.record_fingerprint(&fingerprint)?;
    info!(
      cache = %self.name,
      stored = report.stored,
      failed = report.failed.len(),
      "Installed asset cache"
    );

    Ok(report)
  }
}
