use std::{fmt, io};

use crate::{engine::Engine, segments::Segments};

/// Identity of an engine: which worker owns it and its key in that
/// worker's engine table. Copyable, hashable, stable for the engine's
/// whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId {
  worker: u32,
  key: u64,
}

impl EngineId {
  pub(crate) fn new(worker: u32, key: u64) -> Self {
    Self { worker, key }
  }

  pub(crate) fn key(self) -> u64 {
    self.key
  }
}

impl fmt::Display for EngineId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "engine {}.{}", self.worker, self.key)
  }
}

/// Completion of one logical engine operation.
///
/// Exactly one event is delivered per completed asynchronous operation.
/// `Sent` and `Received` hand the involved buffers back for reuse.
#[derive(Debug)]
pub enum Event {
  /// The engine finished closing. Always the last event an engine emits.
  Closed,
  /// An asynchronous connect succeeded; the engine is now active.
  Connected,
  /// An accept completed. Carries the uniquely owned handle of the new
  /// peer engine, already active and bound to the listener's worker.
  Accepted(Engine),
  /// Every byte of every segment of a send was written.
  Sent(Segments),
  /// A receive delivered exactly the requested number of bytes.
  Received(Vec<u8>),
  /// An asynchronous operation failed, or the stream ended before a
  /// receive was satisfied. Terminal: close the engine.
  Error(io::Error),
}

/// Receiver of engine events.
///
/// Sinks are invoked on the engine's worker thread. Deliveries for one
/// engine are serialized and arrive in completion order; deliveries for
/// engines on different workers may run concurrently.
///
/// A sink may call the engine's *asynchronous* operations (they only
/// enqueue work), but must not call the synchronous ones
/// (`bind`/`listen`/`setsockopt`/`local_addr`): those round-trip through
/// the very worker thread the sink is running on and would deadlock.
pub trait EventSink: Send {
  fn event(&self, id: EngineId, event: Event);
}

/// A channel sender is a ready-made sink; delivery failures (receiver
/// gone) are ignored, matching a caller that stopped listening.
impl EventSink for crossbeam_channel::Sender<(EngineId, Event)> {
  fn event(&self, id: EngineId, event: Event) {
    let _ = self.send((id, event));
  }
}
