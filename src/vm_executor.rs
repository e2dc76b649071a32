//! The single-lane executor that owns a thread group.
//!
//! Every mutation of a [CpsThreadGroup] happens inside a task submitted to its
//! lane. One tokio task drains the queue in FIFO order and holds the group by
//! `&mut`, so no two chunks of script code ever run at once and nothing else
//! can observe the group mid-chunk.

use crate::error::EngineError;
use crate::thread_group::CpsThreadGroup;
use crate::types::FlowError;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info_span};

type Task = Box<dyn FnOnce(&mut CpsThreadGroup) + Send>;

/// Cloneable handle for submitting work to a lane.
#[derive(Clone, Debug)]
pub struct VmHandle {
  tx: mpsc::UnboundedSender<Task>,
}

/// Receiving end of a lane, consumed by [spawn_lane].
pub struct LaneReceiver(mpsc::UnboundedReceiver<Task>);

impl VmHandle {
  /// A handle and the queue it feeds. The queue starts draining once passed to [spawn_lane].
  pub fn channel() -> (VmHandle, LaneReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (VmHandle { tx }, LaneReceiver(rx))
  }

  /// Queues `task`. Returns false when the lane has shut down.
  pub fn submit(&self, task: impl FnOnce(&mut CpsThreadGroup) + Send + 'static) -> bool {
    self.tx.send(Box::new(task)).is_ok()
  }

  /// Runs `f` on the lane and waits for its result.
  pub async fn call<R, F>(&self, f: F) -> Result<R, EngineError>
  where
    R: Send + 'static,
    F: FnOnce(&mut CpsThreadGroup) -> R + Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let sent = self.submit(move |g| {
      let _ = tx.send(f(g));
    });
    if !sent {
      return Err(EngineError::Rejected);
    }
    rx.await.map_err(|_| EngineError::Rejected)
  }

  pub fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

/// Starts draining `rx` with exclusive ownership of `group`.
/// A panicking task croaks the execution; the lane stops once the group is shut down.
pub fn spawn_lane(mut group: CpsThreadGroup, rx: LaneReceiver) -> JoinHandle<()> {
  let span = info_span!("lane", execution = %group.execution_id());
  let mut rx = rx.0;
  tokio::spawn(
    async move {
      debug!("lane started");
      while let Some(task) = rx.recv().await {
        let result = catch_unwind(AssertUnwindSafe(|| task(&mut group)));
        if let Err(payload) = result {
          let message = panic_message(payload.as_ref());
          error!(panic = %message, "unexpected failure in VM lane");
          group.croak(FlowError::internal(message));
        }
        group.fire_listeners();
        if group.is_shut_down() {
          break;
        }
        tokio::task::yield_now().await;
      }
      rx.close();
      debug!("lane stopped");
    }
    .instrument(span),
  )
}
