use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::net::{Request, Transport};

/// Lifecycle events that drive syncing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Application started
  Load,
  /// The API became reachable
  Online,
  /// The API stopped answering
  Offline,
  /// Stop the event loop
  Shutdown,
}

/// Channel of lifecycle events
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

/// Polls the API and reports connectivity transitions.
pub struct ConnectivityMonitor {
  transport: Arc<dyn Transport>,
  check_url: Url,
  interval: Duration,
  online: Option<bool>,
}

impl ConnectivityMonitor {
  pub fn new(transport: Arc<dyn Transport>, check_url: Url, interval: Duration) -> Self {
    Self {
      transport,
      check_url,
      interval,
      online: None,
    }
  }

  /// Check once. Returns an event only when the state changed since the last
  /// check; the first check just establishes the baseline.
  pub async fn check(&mut self) -> Option<Event> {
    // Any HTTP answer means the network path works.
    let online = self
      .transport
      .send(&Request::get(self.check_url.clone()))
      .await
      .is_ok();

    let previous = self.online.replace(online);
    match (previous, online) {
      (Some(false), true) => {
        info!(url = %self.check_url, "Connection restored");
        Some(Event::Online)
      }
      (Some(true), false) => {
        info!(url = %self.check_url, "Connection lost");
        Some(Event::Offline)
      }
      _ => None,
    }
  }

  /// Spawn the polling loop, sending transitions to `tx` until the receiver goes away.
  pub fn spawn(mut self, tx: mpsc::UnboundedSender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      loop {
        ticker.tick().await;
        if let Some(event) = self.check().await {
          if tx.send(event).is_err() {
            debug!("Event receiver closed, stopping connectivity monitor");
            break;
          }
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::testing::FakeTransport;

  fn monitor(transport: Arc<FakeTransport>) -> ConnectivityMonitor {
    ConnectivityMonitor::new(
      transport,
      Url::parse("http://localhost:1337/restaurants").unwrap(),
      Duration::from_millis(5),
    )
  }

  #[tokio::test]
  async fn test_only_transitions_are_reported() {
    let transport = FakeTransport::new();
    let mut monitor = monitor(Arc::clone(&transport));

    transport.set_offline(true);
    assert_eq!(monitor.check().await, None);
    assert_eq!(monitor.check().await, None);

    transport.set_offline(false);
    assert_eq!(monitor.check().await, Some(Event::Online));
    assert_eq!(monitor.check().await, None);

    transport.set_offline(true);
    assert_eq!(monitor.check().await, Some(Event::Offline));
  }

  #[tokio::test]
  async fn test_spawned_monitor_sends_online() {
    let transport = FakeTransport::new();
    transport.set_offline(true);
    let mut events = EventHandler::new();
    let handle = monitor(Arc::clone(&transport)).spawn(events.sender());

    tokio::time::sleep(Duration::from_millis(20)).await;
    transport.set_offline(false);

    let event = tokio::time::timeout(Duration::from_secs(1), events.next())
      .await
      .unwrap();
    assert_eq!(event, Some(Event::Online));
    handle.abort();
  }
}
