//! Scriptable in-memory network for tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Network, Request, Response};

#[derive(Debug, Clone)]
pub enum FakeReply {
  Respond(Response),
  Fail(String),
  Delayed(Duration, Box<FakeReply>),
}

#[derive(Default)]
pub struct FakeNetwork {
  sticky: Mutex<HashMap<String, FakeReply>>,
  queued: Mutex<HashMap<String, VecDeque<FakeReply>>>,
  calls: Mutex<Vec<Request>>,
  offline: AtomicBool,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Always answer `url` with the given status and body.
  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self.set(url, FakeReply::Respond(Response::new(status, body)));
  }

  pub fn set(&self, url: &str, reply: FakeReply) {
    self.sticky.lock().unwrap().insert(url.to_string(), reply);
  }

  /// Answer the next request to `url` with `reply`, then fall back to the sticky reply.
  pub fn push(&self, url: &str, reply: FakeReply) {
    self
      .queued
      .lock()
      .unwrap()
      .entry(url.to_string())
      .or_default()
      .push_back(reply);
  }

  pub fn set_online(&self, online: bool) {
    self.offline.store(!online, Ordering::SeqCst);
  }

  pub fn calls(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  fn next_reply(&self, url: &str) -> Option<FakeReply> {
    if let Some(reply) = self
      .queued
      .lock()
      .unwrap()
      .get_mut(url)
      .and_then(|q| q.pop_front())
    {
      return Some(reply);
    }
    self.sticky.lock().unwrap().get(url).cloned()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.lock().unwrap().push(request.clone());

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable"));
    }

    let mut reply = self
      .next_reply(request.url.as_str())
      .unwrap_or_else(|| FakeReply::Respond(Response::new(404, "not found")));

    loop {
      match reply {
        FakeReply::Respond(resp) => return Ok(resp),
        FakeReply::Fail(msg) => return Err(eyre!(msg)),
        FakeReply::Delayed(delay, inner) => {
          tokio::time::sleep(delay).await;
          reply = *inner;
        }
      }
    }
  }
}
