//! Durable write-behind queue.
//!
//! Mutations are appended to the `pending` collection and replayed oldest
//! first. A pass stops at the first record that cannot be delivered so later
//! mutations never overtake earlier ones; the record stays queued for the
//! next trigger. Malformed records are dropped without being sent.

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::records::{PendingMutation, PendingRecord};
use crate::db::{Key, Store};
use crate::net::{Request, Transport};

/// What started a drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  /// Application start
  Load,
  /// Connectivity came back
  Online,
  /// A mutation was just queued
  Enqueued,
  /// Explicit request from the user
  Manual,
}

/// Result of one drain call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
  /// The queue is empty
  Drained { sent: usize, discarded: usize },
  /// Delivery failed; `remaining` records are still queued
  Halted {
    sent: usize,
    discarded: usize,
    remaining: usize,
  },
  /// Another pass was already running and will pick up the new work
  Busy,
}

/// What happened to the record at the head of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
  /// Delivered and removed
  Confirmed,
  /// Not delivered; left at the head of the queue
  Failed,
}

#[derive(Default)]
struct DrainState {
  running: AtomicBool,
  rerun: AtomicBool,
}

/// Holds the running flag. Clears it on drop, even if the drain future is
/// dropped mid-pass, unless it was already released.
struct RunningGuard<'a> {
  state: &'a DrainState,
  held: bool,
}

impl<'a> RunningGuard<'a> {
  /// Announce a drain request and try to take the flag. Returns `None` if
  /// another pass holds it; that pass will see the request.
  fn acquire(state: &'a DrainState) -> Option<Self> {
    // The request is published before the flag is tested, so a holder that
    // releases concurrently is guaranteed to observe it.
    state.rerun.store(true, Ordering::SeqCst);
    if state.running.swap(true, Ordering::SeqCst) {
      return None;
    }
    Some(Self { state, held: true })
  }

  /// Give the flag back. Returns `true` if a request raced in and the flag
  /// was taken again, in which case the caller must do another pass.
  fn release(&mut self) -> bool {
    self.state.running.store(false, Ordering::SeqCst);
    self.held = false;

    if self.state.rerun.load(Ordering::SeqCst) && !self.state.running.swap(true, Ordering::SeqCst) {
      self.held = true;
    }
    self.held
  }
}

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    if self.held {
      self.state.running.store(false, Ordering::SeqCst);
    }
  }
}

#[derive(Default)]
struct Tally {
  sent: usize,
  discarded: usize,
}

#[derive(Clone)]
pub struct PendingQueue {
  store: Arc<Store>,
  transport: Arc<dyn Transport>,
  state: Arc<DrainState>,
}

impl PendingQueue {
  pub fn new(store: Arc<Store>, transport: Arc<dyn Transport>) -> Self {
    Self {
      store,
      transport,
      state: Arc::new(DrainState::default()),
    }
  }

  /// Durably append a mutation, returning its queue id.
  pub fn enqueue(&self, mutation: PendingMutation) -> Result<i64> {
    match self.store.put(&PendingRecord::new(mutation))? {
      Key::Int(id) => {
        debug!(id, "Queued pending mutation");
        Ok(id)
      }
      other => Err(eyre!("Unexpected pending key {}", other)),
    }
  }

  /// Queued mutations, oldest first.
  pub fn pending(&self) -> Result<Vec<PendingRecord>> {
    self.store.get_all()
  }

  pub fn len(&self) -> Result<usize> {
    self.store.count::<PendingRecord>()
  }

  /// Start a drain after `delay` on a background task.
  pub fn schedule(&self, delay: Duration, trigger: Trigger) -> JoinHandle<DrainOutcome> {
    let queue = self.clone();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      queue.drain(trigger).await
    })
  }

  /// Replay queued mutations until the queue is empty or one fails.
  ///
  /// Only one drain runs at a time. A trigger that arrives while a pass is
  /// running makes that pass look at the queue once more before it returns.
  pub async fn drain(&self, trigger: Trigger) -> DrainOutcome {
    let Some(mut guard) = RunningGuard::acquire(&self.state) else {
      debug!(?trigger, "Drain already running");
      return DrainOutcome::Busy;
    };

    debug!(?trigger, "Starting drain pass");
    let mut tally = Tally::default();

    loop {
      self.state.rerun.store(false, Ordering::SeqCst);
      let halted = !self.pass(&mut tally).await;

      if self.state.rerun.swap(false, Ordering::SeqCst) || guard.release() {
        continue;
      }

      if halted {
        let remaining = self.len().unwrap_or_else(|e| {
          warn!(error = %e, "Failed to count pending mutations");
          0
        });
        info!(
          sent = tally.sent,
          discarded = tally.discarded,
          remaining,
          "Drain halted, will retry on next trigger"
        );
        return DrainOutcome::Halted {
          sent: tally.sent,
          discarded: tally.discarded,
          remaining,
        };
      }

      if tally.sent > 0 || tally.discarded > 0 {
        info!(
          sent = tally.sent,
          discarded = tally.discarded,
          "Pending queue drained"
        );
      }
      return DrainOutcome::Drained {
        sent: tally.sent,
        discarded: tally.discarded,
      };
    }
  }

  /// One traversal from the head. Returns `false` if it stopped on a failure.
  async fn pass(&self, tally: &mut Tally) -> bool {
    loop {
      let (head, discarded) = match self.head() {
        Ok(head) => head,
        Err(e) => {
          warn!(error = %e, "Pending queue unavailable");
          return false;
        }
      };
      tally.discarded += discarded;

      let Some((id, request)) = head else {
        return true;
      };

      match self.replay(id, &request).await {
        ReplayOutcome::Confirmed => tally.sent += 1,
        ReplayOutcome::Failed => return false,
      }
    }
  }

  /// First deliverable record, dropping malformed ones in front of it.
  fn head(&self) -> Result<(Option<(i64, Request)>, usize)> {
    self.store.transaction(|tx| {
      let mut cursor = tx.cursor::<PendingRecord>();
      let mut discarded = 0;

      loop {
        let record = match cursor.next() {
          Ok(Some(record)) => record,
          Ok(None) => return Ok((None, discarded)),
          Err(e) if cursor.key().is_some() => {
            warn!(key = ?cursor.key(), error = %e, "Discarding unreadable pending mutation");
            cursor.delete()?;
            discarded += 1;
            continue;
          }
          Err(e) => return Err(e),
        };

        match (record.id, record.data.to_request()) {
          (Some(id), Some(request)) => return Ok((Some((id, request)), discarded)),
          _ => {
            warn!(id = ?record.id, mutation = ?record.data, "Discarding malformed pending mutation");
            cursor.delete()?;
            discarded += 1;
          }
        }
      }
    })
  }

  async fn replay(&self, id: i64, request: &Request) -> ReplayOutcome {
    debug!(id, method = %request.method, url = %request.url, "Replaying pending mutation");

    match self.transport.send(request).await {
      Ok(response) if response.is_ok_or_redirected() => {
        match self.store.delete::<PendingRecord>(&Key::Int(id)) {
          Ok(_) => {
            info!(id, url = %request.url, "Pending mutation delivered");
            ReplayOutcome::Confirmed
          }
          Err(e) => {
            warn!(id, error = %e, "Delivered mutation could not be removed from queue");
            ReplayOutcome::Failed
          }
        }
      }
      Ok(response) => {
        warn!(
          id,
          url = %request.url,
          status = response.status,
          "Server rejected pending mutation, leaving it queued"
        );
        ReplayOutcome::Failed
      }
      Err(e) => {
        debug!(id, error = %e, "Network unavailable, leaving mutation queued");
        ReplayOutcome::Failed
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::schema;
  use crate::net::testing::{FakeTransport, Reply};
  use crate::net::Method;
  use serde_json::json;

  const REVIEWS: &str = "http://localhost:1337/reviews";

  fn queue(transport: Arc<FakeTransport>) -> (PendingQueue, Arc<Store>) {
    let store = Arc::new(Store::open_in_memory(schema::VERSION, schema::upgrade).unwrap());
    (PendingQueue::new(Arc::clone(&store), transport), store)
  }

  fn favorite(id: i64) -> PendingMutation {
    PendingMutation::new(
      format!("http://localhost:1337/restaurants/{}/?is_favorite=true", id),
      Method::PUT,
      None,
    )
  }

  fn review(restaurant_id: i64) -> PendingMutation {
    PendingMutation::new(
      REVIEWS,
      Method::POST,
      Some(json!({"restaurant_id": restaurant_id, "name": "Sam", "rating": 4, "comments": "Good"})),
    )
  }

  #[tokio::test]
  async fn test_successful_drain_preserves_enqueue_order() {
    let transport = FakeTransport::new();
    for id in 1..=5 {
      transport.reply(
        &format!("http://localhost:1337/restaurants/{}/?is_favorite=true", id),
        Reply::Json(200, json!({"id": id})),
      );
    }
    let (queue, _) = queue(Arc::clone(&transport));

    for id in 1..=5 {
      queue.enqueue(favorite(id)).unwrap();
    }
    assert_eq!(queue.len().unwrap(), 5);

    let outcome = queue.drain(Trigger::Manual).await;

    assert_eq!(outcome, DrainOutcome::Drained { sent: 5, discarded: 0 });
    assert_eq!(queue.len().unwrap(), 0);
    let urls: Vec<String> = transport.sent().into_iter().map(|(_, url)| url).collect();
    let expected: Vec<String> = (1..=5)
      .map(|id| format!("http://localhost:1337/restaurants/{}/?is_favorite=true", id))
      .collect();
    assert_eq!(urls, expected);
  }

  #[tokio::test]
  async fn test_failure_blocks_later_mutations_until_retry() {
    let transport = FakeTransport::new();
    transport.reply(REVIEWS, Reply::NetworkError);
    transport.reply(REVIEWS, Reply::Json(201, json!({"id": 10})));
    let (queue, _) = queue(Arc::clone(&transport));

    queue.enqueue(review(1)).unwrap();
    queue.enqueue(review(2)).unwrap();

    let first = queue.drain(Trigger::Load).await;
    assert_eq!(
      first,
      DrainOutcome::Halted {
        sent: 0,
        discarded: 0,
        remaining: 2
      }
    );
    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body.as_ref().unwrap()["restaurant_id"], 1);

    let second = queue.drain(Trigger::Online).await;
    assert_eq!(second, DrainOutcome::Drained { sent: 2, discarded: 0 });

    let bodies: Vec<i64> = transport
      .requests()
      .iter()
      .map(|r| r.body.as_ref().unwrap()["restaurant_id"].as_i64().unwrap())
      .collect();
    assert_eq!(bodies, vec![1, 1, 2]);
  }

  #[tokio::test]
  async fn test_server_error_is_left_queued() {
    let transport = FakeTransport::new();
    transport.reply(REVIEWS, Reply::Text(500, "oops"));
    let (queue, _) = queue(Arc::clone(&transport));

    queue.enqueue(review(1)).unwrap();
    let outcome = queue.drain(Trigger::Manual).await;

    assert!(matches!(outcome, DrainOutcome::Halted { remaining: 1, .. }));
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_malformed_mutations_discarded_without_sending() {
    let transport = FakeTransport::new();
    transport.reply(REVIEWS, Reply::Json(201, json!({})));
    let (queue, _) = queue(Arc::clone(&transport));

    queue.enqueue(review(1)).unwrap();
    queue
      .enqueue(PendingMutation::new(REVIEWS, Method::POST, None))
      .unwrap();
    queue
      .enqueue(PendingMutation {
        url: None,
        method: Some("PUT".to_string()),
        body: None,
      })
      .unwrap();
    queue.enqueue(review(2)).unwrap();

    let outcome = queue.drain(Trigger::Manual).await;

    assert_eq!(outcome, DrainOutcome::Drained { sent: 2, discarded: 2 });
    assert_eq!(transport.requests().len(), 2);
    assert!(transport.requests().iter().all(|r| r.body.is_some()));
  }

  #[tokio::test]
  async fn test_malformed_head_discarded_even_when_offline() {
    let transport = FakeTransport::new();
    transport.set_offline(true);
    let (queue, _) = queue(Arc::clone(&transport));

    queue
      .enqueue(PendingMutation::new(REVIEWS, Method::POST, None))
      .unwrap();
    queue.enqueue(review(1)).unwrap();

    let outcome = queue.drain(Trigger::Manual).await;

    assert_eq!(
      outcome,
      DrainOutcome::Halted {
        sent: 0,
        discarded: 1,
        remaining: 1
      }
    );
    assert_eq!(transport.requests().len(), 1);
  }

  #[tokio::test]
  async fn test_unreadable_record_is_discarded() {
    let transport = FakeTransport::new();
    let (queue, store) = queue(Arc::clone(&transport));
    store
      .transaction(|tx| {
        tx.connection()
          .execute("INSERT INTO pending (value) VALUES ('[1, 2')", [])
          .map_err(|e| eyre!("{}", e))?;
        Ok(())
      })
      .unwrap();

    let outcome = queue.drain(Trigger::Load).await;
    assert_eq!(outcome, DrainOutcome::Drained { sent: 0, discarded: 1 });
    assert!(transport.requests().is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_trigger_reports_busy() {
    let transport = FakeTransport::new();
    let (queue, _) = queue(transport);

    queue.state.running.store(true, Ordering::SeqCst);
    assert_eq!(queue.drain(Trigger::Online).await, DrainOutcome::Busy);
    assert!(queue.state.rerun.load(Ordering::SeqCst));
  }

  #[test]
  fn test_release_retakes_flag_when_request_raced_in() {
    let state = DrainState::default();
    let mut guard = RunningGuard::acquire(&state).unwrap();
    state.rerun.store(false, Ordering::SeqCst);

    assert!(RunningGuard::acquire(&state).is_none());
    assert!(guard.release());
    assert!(state.running.load(Ordering::SeqCst));

    state.rerun.store(false, Ordering::SeqCst);
    assert!(!guard.release());
    assert!(!state.running.load(Ordering::SeqCst));
  }

  #[test]
  fn test_released_guard_does_not_clear_next_holder() {
    let state = DrainState::default();
    let mut first = RunningGuard::acquire(&state).unwrap();
    state.rerun.store(false, Ordering::SeqCst);
    assert!(!first.release());

    let _second = RunningGuard::acquire(&state).unwrap();
    drop(first);
    assert!(state.running.load(Ordering::SeqCst));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_overlapping_triggers_leave_nothing_behind() {
    let transport = FakeTransport::new();
    for id in 1..=20 {
      transport.reply(
        &format!("http://localhost:1337/restaurants/{}/?is_favorite=true", id),
        Reply::Json(200, json!({})),
      );
    }
    let (queue, _) = queue(Arc::clone(&transport));

    let mut handles = Vec::new();
    for id in 1..=20 {
      queue.enqueue(favorite(id)).unwrap();
      handles.push(queue.schedule(Duration::ZERO, Trigger::Enqueued));
    }
    for handle in handles {
      handle.await.unwrap();
    }

    assert_eq!(queue.len().unwrap(), 0);
    assert_eq!(transport.requests().len(), 20);
  }

  #[tokio::test]
  async fn test_scheduled_drain_runs_after_delay() {
    let transport = FakeTransport::new();
    transport.reply(
      "http://localhost:1337/restaurants/5/?is_favorite=true",
      Reply::Json(200, json!({})),
    );
    let (queue, _) = queue(Arc::clone(&transport));

    queue.enqueue(favorite(5)).unwrap();
    let outcome = queue
      .schedule(Duration::from_millis(1), Trigger::Enqueued)
      .await
      .unwrap();

    assert_eq!(outcome, DrainOutcome::Drained { sent: 1, discarded: 0 });
    assert_eq!(queue.len().unwrap(), 0);
  }
}
