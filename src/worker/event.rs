use tokio::sync::{mpsc, oneshot};

use crate::net::{Request, Response};

/// Lifecycle events the host delivers to the worker
#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  /// Intercepted request; the answer goes back on `reply`
  Fetch {
    request: Request,
    reply: oneshot::Sender<Option<Response>>,
  },
  /// Host signalled that background sync for `tag` may run
  Sync { tag: String },
  Push { payload: Vec<u8> },
  NotificationClick {
    action: String,
    chart_id: Option<String>,
  },
  /// Stop the event loop
  Shutdown,
}

/// Handle for delivering events to a running worker
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerHandle {
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }

  /// Deliver an event. Returns false once the worker has stopped.
  pub fn send(&self, event: WorkerEvent) -> bool {
    self.tx.send(event).is_ok()
  }

  /// Route a request through the worker and wait for its answer
  pub async fn fetch(&self, request: Request) -> Option<Response> {
    let (reply, rx) = oneshot::channel();
    if !self.send(WorkerEvent::Fetch { request, reply }) {
      return None;
    }
    rx.await.ok().flatten()
  }

  pub fn sync(&self, tag: &str) -> bool {
    self.send(WorkerEvent::Sync {
      tag: tag.to_string(),
    })
  }
}
