//! Restaurant directory client with offline reads and queued writes.

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;
use url::Url;

use super::lookups::Lookups;
use super::types::{NewReview, Restaurant, Review};
use crate::cache::records::PendingMutation;
use crate::cache::{AssetCache, InterceptSettings, Interceptor, Manifest};
use crate::config::Config;
use crate::db::Store;
use crate::net::{HttpTransport, Method, Request, Transport};
use crate::sync::{DrainOutcome, OptimisticUpdater, Patched, PendingQueue, Trigger};

/// Filter value that matches every restaurant.
pub const ANY: &str = "all";

/// A write that has been applied locally and queued for the server.
#[derive(Debug)]
pub struct Queued {
  pub pending_id: i64,
  pub patched: Patched,
  /// Drain pass started for this write
  pub drain: JoinHandle<DrainOutcome>,
}

/// Directory client with transparent caching and a write-behind queue.
#[derive(Clone)]
pub struct RestaurantClient {
  interceptor: Arc<Interceptor>,
  queue: PendingQueue,
  updater: OptimisticUpdater,
  lookups: Arc<Lookups>,
  api_url: Url,
  drain_delay: Duration,
}

impl RestaurantClient {
  /// Open the configured database and talk to the network over HTTP.
  pub fn open(config: &Config) -> Result<Self> {
    let store = Store::open_default(&config.database_path()?)?;
    let transport = HttpTransport::new()?;
    Self::new(config, Arc::new(store), Arc::new(transport))
  }

  pub fn new(config: &Config, store: Arc<Store>, transport: Arc<dyn Transport>) -> Result<Self> {
    let cache_name = match &config.manifest {
      Some(path) if path.exists() => Manifest::load(path)?.cache_name,
      _ => crate::cache::manifest::DEFAULT_CACHE_NAME.to_string(),
    };

    let assets = AssetCache::new(Arc::clone(&store), cache_name);
    let settings = InterceptSettings::from_config(config)?;
    let interceptor = Interceptor::new(Arc::clone(&store), assets, Arc::clone(&transport), settings);

    Ok(Self {
      interceptor: Arc::new(interceptor),
      queue: PendingQueue::new(Arc::clone(&store), transport),
      updater: OptimisticUpdater::new(store),
      lookups: Arc::new(Lookups::new()),
      api_url: config.api_url()?,
      drain_delay: config.drain_delay(),
    })
  }

  pub fn interceptor(&self) -> &Interceptor {
    &self.interceptor
  }

  pub fn queue(&self) -> &PendingQueue {
    &self.queue
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .api_url
      .join(path)
      .map_err(|e| eyre!("Invalid API path {}: {}", path, e))
  }

  async fn read<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
    let response = self.interceptor.fetch(Request::get(url.clone())).await?;
    if !response.is_ok() {
      return Err(eyre!(
        "Request to {} failed: {} {}",
        url,
        response.status,
        response.text_body()
      ));
    }
    response.json_body()
  }

  /// All restaurants. Also fills the neighborhood/cuisine lookups.
  pub async fn restaurants(&self) -> Result<Vec<Restaurant>> {
    let restaurants: Vec<Restaurant> = self.read(self.endpoint("/restaurants")?).await?;
    self.lookups.populate(&restaurants);
    Ok(restaurants)
  }

  pub async fn restaurant(&self, id: i64) -> Result<Restaurant> {
    self
      .read(self.endpoint(&format!("/restaurants/{}", id))?)
      .await
      .map_err(|e| eyre!("Restaurant {} is not available: {}", id, e))
  }

  pub async fn reviews(&self, restaurant_id: i64) -> Result<Vec<Review>> {
    self
      .read(self.endpoint(&format!("/reviews/?restaurant_id={}", restaurant_id))?)
      .await
  }

  /// Restaurants matching both filters; [`ANY`] disables a filter.
  pub async fn restaurants_by(&self, cuisine: &str, neighborhood: &str) -> Result<Vec<Restaurant>> {
    let restaurants = self.restaurants().await?;
    Ok(
      restaurants
        .into_iter()
        .filter(|r| cuisine == ANY || r.cuisine_type == cuisine)
        .filter(|r| neighborhood == ANY || r.neighborhood == neighborhood)
        .collect(),
    )
  }

  pub async fn neighborhoods(&self) -> Result<Vec<String>> {
    if let Some(cached) = self.lookups.neighborhoods() {
      return Ok(cached.to_vec());
    }
    self.restaurants().await?;
    Ok(self.lookups.neighborhoods().map(<[String]>::to_vec).unwrap_or_default())
  }

  pub async fn cuisines(&self) -> Result<Vec<String>> {
    if let Some(cached) = self.lookups.cuisines() {
      return Ok(cached.to_vec());
    }
    self.restaurants().await?;
    Ok(self.lookups.cuisines().map(<[String]>::to_vec).unwrap_or_default())
  }

  /// Mark a restaurant as favorite (or not) locally and queue the change.
  pub fn toggle_favorite(&self, id: i64, favorite: bool) -> Result<Queued> {
    let mut changes = Map::new();
    changes.insert("is_favorite".to_string(), Value::Bool(favorite));
    let patched = self.patch(id, &changes);

    let url = self.endpoint(&format!("/restaurants/{}/?is_favorite={}", id, favorite))?;
    self.submit(PendingMutation::new(url, Method::PUT, None), patched)
  }

  /// Store a review locally and queue it for publishing.
  pub fn publish_review(&self, review: &NewReview) -> Result<Queued> {
    let body =
      serde_json::to_value(review).map_err(|e| eyre!("Failed to serialize review: {}", e))?;

    if let Err(e) = self.updater.add_review(review.restaurant_id, body.clone()) {
      warn!(restaurant_id = review.restaurant_id, error = %e, "Failed to cache new review");
    }

    let url = self.endpoint("/reviews")?;
    self.submit(PendingMutation::new(url, Method::POST, Some(body)), Patched::default())
  }

  /// Drain the queue now.
  pub async fn sync(&self, trigger: Trigger) -> DrainOutcome {
    self.queue.drain(trigger).await
  }

  /// Install the static asset cache from the build manifest.
  pub async fn install(&self, manifest: &Manifest) -> Result<crate::cache::InstallReport> {
    self.interceptor.install(manifest).await
  }

  fn patch(&self, id: i64, changes: &Map<String, Value>) -> Patched {
    self.updater.update(id, changes).unwrap_or_else(|e| {
      warn!(id, error = %e, "Optimistic update failed");
      Patched::default()
    })
  }

  fn submit(&self, mutation: PendingMutation, patched: Patched) -> Result<Queued> {
    let pending_id = self.queue.enqueue(mutation)?;
    let drain = self.queue.schedule(self.drain_delay, Trigger::Enqueued);

    Ok(Queued {
      pending_id,
      patched,
      drain,
    })
  }
}

/// Relative link to a restaurant's detail page.
pub fn url_for_restaurant(id: i64) -> String {
  format!("./restaurant.html?id={}", id)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::records::{RestaurantRecord, AGGREGATE_KEY};
  use crate::db::{schema, Key};
  use crate::net::testing::{FakeTransport, Reply};
  use serde_json::json;

  const FAVORITE_5: &str = "http://localhost:1337/restaurants/5/?is_favorite=true";

  fn client(transport: Arc<FakeTransport>) -> (RestaurantClient, Arc<Store>) {
    let store = Arc::new(Store::open_in_memory(schema::VERSION, schema::upgrade).unwrap());
    let client = RestaurantClient::new(&Config::default(), Arc::clone(&store), transport).unwrap();
    (client, store)
  }

  fn listing() -> Value {
    json!([
      {"id": 1, "name": "Mission Chinese Food", "neighborhood": "Manhattan", "cuisine_type": "Asian", "is_favorite": false},
      {"id": 2, "name": "Emily", "neighborhood": "Brooklyn", "cuisine_type": "Pizza", "is_favorite": false},
      {"id": 5, "name": "Hometown BBQ", "neighborhood": "Brooklyn", "cuisine_type": "American", "is_favorite": false}
    ])
  }

  fn detail_favorite(store: &Store, id: &str) -> Value {
    store
      .get::<RestaurantRecord>(&Key::from(id))
      .unwrap()
      .unwrap()
      .data["is_favorite"]
      .clone()
  }

  #[tokio::test]
  async fn test_filters_and_lookups() {
    let transport = FakeTransport::new();
    transport.reply("http://localhost:1337/restaurants", Reply::Json(200, listing()));
    let (client, _) = client(Arc::clone(&transport));

    let brooklyn = client.restaurants_by(ANY, "Brooklyn").await.unwrap();
    assert_eq!(brooklyn.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 5]);

    let pizza = client.restaurants_by("Pizza", "Brooklyn").await.unwrap();
    assert_eq!(pizza.len(), 1);

    assert_eq!(client.neighborhoods().await.unwrap(), vec!["Manhattan", "Brooklyn"]);
    assert_eq!(client.cuisines().await.unwrap(), vec!["Asian", "Pizza", "American"]);
    // Only the first list read reached the network; the rest came from the store.
    assert_eq!(transport.requests().len(), 1);
  }

  #[tokio::test]
  async fn test_offline_favorite_then_online_drains_queue() {
    let transport = FakeTransport::new();
    transport.reply("http://localhost:1337/restaurants", Reply::Json(200, listing()));
    transport.reply(
      "http://localhost:1337/restaurants/5",
      Reply::Json(200, json!({"id": 5, "name": "Hometown BBQ", "is_favorite": false})),
    );
    transport.reply(FAVORITE_5, Reply::Json(200, json!({"id": 5, "is_favorite": true})));
    let (client, store) = client(Arc::clone(&transport));

    client.restaurants().await.unwrap();
    client.restaurant(5).await.unwrap();

    transport.set_offline(true);
    let queued = client.toggle_favorite(5, true).unwrap();
    assert_eq!(queued.patched, Patched { aggregate: true, detail: true });
    assert!(matches!(
      queued.drain.await.unwrap(),
      DrainOutcome::Halted { remaining: 1, .. }
    ));
    assert_eq!(client.queue().len().unwrap(), 1);
    assert_eq!(detail_favorite(&store, "5"), true);

    transport.set_offline(false);
    let outcome = client.sync(Trigger::Online).await;

    assert_eq!(outcome, DrainOutcome::Drained { sent: 1, discarded: 0 });
    assert_eq!(client.queue().len().unwrap(), 0);
    assert_eq!(detail_favorite(&store, "5"), true);
    assert!(client.restaurant(5).await.unwrap().is_favorite);

    let aggregate: RestaurantRecord = store.get(&Key::from(AGGREGATE_KEY)).unwrap().unwrap();
    assert_eq!(aggregate.data[2]["is_favorite"], true);
    assert_eq!(
      transport.sent().last().unwrap(),
      &("PUT".to_string(), FAVORITE_5.to_string())
    );
  }

  #[tokio::test]
  async fn test_review_visible_offline_and_published_later() {
    let transport = FakeTransport::new();
    transport.set_offline(true);
    transport.reply(
      "http://localhost:1337/reviews",
      Reply::Json(201, json!({"id": 99, "restaurant_id": 2})),
    );
    let (client, _) = client(Arc::clone(&transport));

    let review = NewReview {
      restaurant_id: 2,
      name: "Ana".to_string(),
      rating: 5,
      comments: "Best slice in town".to_string(),
    };
    let queued = client.publish_review(&review).unwrap();
    queued.drain.await.unwrap();

    let reviews = client.reviews(2).await.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].name, "Ana");

    transport.set_offline(false);
    assert_eq!(
      client.sync(Trigger::Online).await,
      DrainOutcome::Drained { sent: 1, discarded: 0 }
    );
    let posted = transport.requests().last().cloned().unwrap();
    assert_eq!(posted.method, Method::POST);
    assert_eq!(posted.body.unwrap()["comments"], "Best slice in town");
  }

  #[test]
  fn test_url_for_restaurant() {
    assert_eq!(url_for_restaurant(7), "./restaurant.html?id=7");
  }
}
