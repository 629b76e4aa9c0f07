//! Request interceptor that answers reads from the local store when it can.
//!
//! - API reads (GET to the API port) are served from the store, or fetched,
//!   stored, and returned.
//! - API writes always go straight to the network; queuing them on failure
//!   is the caller's job.
//! - Everything else is a static asset: cache first, then network with a
//!   copy kept for next time, then a synthesized offline page.

use color_eyre::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::assets::{AssetCache, InstallReport, ROOT_KEY};
use super::manifest::Manifest;
use super::records::{RestaurantRecord, ReviewRecord, AGGREGATE_KEY};
use crate::config::Config;
use crate::db::{Key, Store};
use crate::net::{Request, Response, ResponseSource, Transport};

/// Routing knobs taken from the configuration.
#[derive(Debug, Clone)]
pub struct InterceptSettings {
  /// Port that marks a request as an API call
  pub api_port: u16,
  /// Site origin used for shell pages and install
  pub origin: Url,
  /// Pages served from one shared cached shell regardless of query string
  pub shell_pages: Vec<String>,
  /// Hosts whose requests are never intercepted
  pub passthrough_hosts: Vec<String>,
  /// Responses whose URL contains one of these are never cached
  pub skip_cache_markers: Vec<String>,
}

impl InterceptSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      api_port: config.api_port,
      origin: config.origin_url()?,
      shell_pages: config.shell_pages.clone(),
      passthrough_hosts: config.passthrough_hosts.clone(),
      skip_cache_markers: config.skip_cache_markers.clone(),
    })
  }
}

/// How a request will be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
  Api(ApiRoute),
  /// Sent to the network untouched
  Passthrough,
  /// Static asset, cached under `cache_key`
  Static { cache_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRoute {
  /// Restaurant list (`key` = [`AGGREGATE_KEY`]) or one restaurant
  Restaurants { key: String },
  /// Reviews, cached only when the restaurant is known
  Reviews { restaurant_id: Option<i64> },
  /// Any non-GET API call
  Write,
}

pub struct Interceptor {
  store: Arc<Store>,
  assets: AssetCache,
  transport: Arc<dyn Transport>,
  settings: InterceptSettings,
}

impl Interceptor {
  pub fn new(
    store: Arc<Store>,
    assets: AssetCache,
    transport: Arc<dyn Transport>,
    settings: InterceptSettings,
  ) -> Self {
    Self {
      store,
      assets,
      transport,
      settings,
    }
  }

  pub fn assets(&self) -> &AssetCache {
    &self.assets
  }

  pub fn transport(&self) -> &Arc<dyn Transport> {
    &self.transport
  }

  pub fn classify(&self, request: &Request) -> Route {
    let url = &request.url;

    if url.port_or_known_default() == Some(self.settings.api_port) {
      if !request.is_read() {
        return Route::Api(ApiRoute::Write);
      }

      if url.path_segments().and_then(|mut s| s.next()) == Some("reviews") {
        let restaurant_id = url
          .query_pairs()
          .find(|(name, _)| name == "restaurant_id")
          .and_then(|(_, value)| value.trim().parse().ok());
        return Route::Api(ApiRoute::Reviews { restaurant_id });
      }

      let key = match url.path_segments().and_then(|s| s.filter(|s| !s.is_empty()).last()) {
        Some("restaurants") | None => AGGREGATE_KEY.to_string(),
        Some(id) => id.to_string(),
      };
      return Route::Api(ApiRoute::Restaurants { key });
    }

    let host = url.host_str().unwrap_or("");
    if !request.is_read()
      || self
        .settings
        .passthrough_hosts
        .iter()
        .any(|h| host.contains(h.as_str()))
    {
      return Route::Passthrough;
    }

    Route::Static {
      cache_key: self.cache_key(url),
    }
  }

  /// Shell pages share one key on the site origin and the site root uses the
  /// key install stored it under; everything else is keyed by its URL.
  fn cache_key(&self, url: &Url) -> String {
    if url.origin() == self.settings.origin.origin() && url.path() == ROOT_KEY {
      return ROOT_KEY.to_string();
    }

    let shell = self
      .settings
      .shell_pages
      .iter()
      .find(|page| url.as_str().contains(page.as_str()));

    match shell.and_then(|page| self.settings.origin.join(page).ok()) {
      Some(canonical) => canonical.to_string(),
      None => url.to_string(),
    }
  }

  /// Handle one request.
  ///
  /// Reads never fail: missing data turns into a synthesized response.
  /// Writes and passthrough requests surface network errors to the caller.
  pub async fn fetch(&self, request: Request) -> Result<Response> {
    match self.classify(&request) {
      Route::Api(ApiRoute::Restaurants { key }) => Ok(self.restaurants(&request, &key).await),
      Route::Api(ApiRoute::Reviews {
        restaurant_id: Some(id),
      }) => Ok(self.reviews(&request, id).await),
      Route::Api(ApiRoute::Reviews {
        restaurant_id: None,
      }) => Ok(match self.transport.send(&request).await {
        Ok(response) => response,
        Err(e) => {
          warn!(url = %request.url, error = %e, "Failed to fetch reviews");
          Response::fetch_error()
        }
      }),
      Route::Api(ApiRoute::Write) | Route::Passthrough => self.transport.send(&request).await,
      Route::Static { cache_key } => Ok(self.static_asset(&request, &cache_key).await),
    }
  }

  /// Populate the asset cache from the build manifest.
  pub async fn install(&self, manifest: &Manifest) -> Result<InstallReport> {
    self
      .assets
      .install(manifest, &self.settings.origin, self.transport.as_ref())
      .await
  }

  async fn restaurants(&self, request: &Request, key: &str) -> Response {
    if let Some(data) = self.cached_restaurant(key) {
      debug!(key, "Serving restaurants from store");
      return json_response(&data, ResponseSource::Cache);
    }

    let response = match self.transport.send(request).await {
      Ok(response) => response,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Failed to fetch restaurants");
        return Response::fetch_error();
      }
    };

    if !response.is_ok() {
      debug!(url = %request.url, status = response.status, "Not caching error response");
      return response;
    }

    match response.json_body::<Value>() {
      Ok(data) => {
        if let Err(e) = self.store.put(&RestaurantRecord::new(key, data.clone())) {
          warn!(key, error = %e, "Failed to cache restaurants");
        }
        json_response(&data, ResponseSource::Network)
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "Unreadable restaurants response");
        Response::fetch_error()
      }
    }
  }

  fn cached_restaurant(&self, key: &str) -> Option<Value> {
    match self.store.get::<RestaurantRecord>(&Key::from(key)) {
      Ok(record) => record.map(|r| r.data).filter(|data| !data.is_null()),
      Err(e) => {
        warn!(key, error = %e, "Store unavailable, treating as cache miss");
        None
      }
    }
  }

  async fn reviews(&self, request: &Request, restaurant_id: i64) -> Response {
    let cached = match self
      .store
      .get_all_by_index::<ReviewRecord>("restaurant_id", &Key::Int(restaurant_id))
    {
      Ok(records) => records,
      Err(e) => {
        warn!(restaurant_id, error = %e, "Store unavailable, treating as cache miss");
        Vec::new()
      }
    };

    if !cached.is_empty() {
      debug!(restaurant_id, count = cached.len(), "Serving reviews from store");
      let reviews: Vec<Value> = cached.into_iter().map(|r| r.data).collect();
      return json_response(&reviews, ResponseSource::Cache);
    }

    let response = match self.transport.send(request).await {
      Ok(response) => response,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Failed to fetch reviews");
        return Response::fetch_error();
      }
    };

    if !response.is_ok() {
      debug!(url = %request.url, status = response.status, "Not caching error response");
      return response;
    }

    let reviews: Vec<Value> = match response.json_body() {
      Ok(reviews) => reviews,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Unreadable reviews response");
        return Response::fetch_error();
      }
    };

    let stored = self.store.transaction(|tx| {
      for review in &reviews {
        match ReviewRecord::from_server(review.clone()) {
          Some(record) => {
            tx.put(&record)?;
          }
          None => debug!("Skipping review without ids"),
        }
      }
      Ok(())
    });
    if let Err(e) = stored {
      warn!(restaurant_id, error = %e, "Failed to cache reviews");
    }

    json_response(&reviews, ResponseSource::Network)
  }

  async fn static_asset(&self, request: &Request, cache_key: &str) -> Response {
    match self.assets.lookup(cache_key) {
      Ok(Some(response)) => return response,
      Ok(None) => {}
      Err(e) => warn!(key = cache_key, error = %e, "Asset cache unavailable"),
    }

    match self.transport.send(request).await {
      Ok(response) => {
        let skip = self
          .settings
          .skip_cache_markers
          .iter()
          .any(|marker| response.url.contains(marker.as_str()));

        if response.is_ok() && !skip {
          if let Err(e) = self.assets.put(cache_key, &response) {
            warn!(key = cache_key, error = %e, "Failed to cache asset");
          }
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Offline with no cached copy");
        Response::offline()
      }
    }
  }
}

fn json_response<T: Serialize + ?Sized>(data: &T, source: ResponseSource) -> Response {
  Response::json(200, data, source).unwrap_or_else(|e| {
    warn!(error = %e, "Failed to encode response");
    Response::fetch_error()
  })
}
