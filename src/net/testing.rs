//! Scripted transport for tests.

use super::{Request, Response, ResponseSource, Transport};
use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub enum Reply {
  Json(u16, Value),
  Text(u16, &'static str),
  NetworkError,
}

/// Replies per URL. The last scripted reply for a URL repeats forever; unknown
/// URLs get a 404. While offline every request fails at the network level.
#[derive(Default)]
pub struct FakeTransport {
  replies: Mutex<HashMap<String, VecDeque<Reply>>>,
  log: Mutex<Vec<Request>>,
  offline: AtomicBool,
}

impl FakeTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn reply(&self, url: &str, reply: Reply) {
    self
      .replies
      .lock()
      .unwrap()
      .entry(url.to_string())
      .or_default()
      .push_back(reply);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn requests(&self) -> Vec<Request> {
    self.log.lock().unwrap().clone()
  }

  pub fn sent(&self) -> Vec<(String, String)> {
    self
      .requests()
      .into_iter()
      .map(|r| (r.method.to_string(), r.url.to_string()))
      .collect()
  }

  fn next_reply(&self, url: &str) -> Option<Reply> {
    let mut replies = self.replies.lock().unwrap();
    let queue = replies.get_mut(url)?;
    if queue.len() > 1 {
      queue.pop_front()
    } else {
      queue.front().cloned()
    }
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn send(&self, request: &Request) -> Result<Response> {
    self.log.lock().unwrap().push(request.clone());

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable: {}", request.url));
    }

    let response = match self.next_reply(request.url.as_str()) {
      Some(Reply::Json(status, value)) => Response::json(status, &value, ResponseSource::Network)?,
      Some(Reply::Text(status, body)) => Response::text(status, "", body, ResponseSource::Network),
      Some(Reply::NetworkError) => return Err(eyre!("connection reset: {}", request.url)),
      None => Response::text(404, "Not Found", "", ResponseSource::Network),
    };

    Ok(Response {
      url: request.url.to_string(),
      ..response
    })
  }
}
