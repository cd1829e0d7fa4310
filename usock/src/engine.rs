use std::{cell::Cell, fmt, net::SocketAddr};

use crossbeam_channel::{Sender, bounded};
use socket2::{Domain, Protocol, Type};

use crate::{
  ctx::Ctx,
  error::Error,
  event::{EngineId, EventSink},
  segments::Segments,
  worker::{Task, WorkerHandle},
};

/// Handle to one asynchronous socket engine.
///
/// An engine wraps a single OS socket and turns its blocking primitives
/// into non-blocking operations executed on the worker thread the engine
/// was assigned to at [`init`](Engine::init). The handle itself holds no
/// socket state; every operation is a message to that worker.
///
/// The synchronous operations (`init`, [`setsockopt`](Engine::setsockopt),
/// [`bind`](Engine::bind), [`listen`](Engine::listen),
/// [`local_addr`](Engine::local_addr)) round-trip through the worker and
/// return their result directly. The asynchronous operations
/// ([`connect`](Engine::connect), [`accept`](Engine::accept),
/// [`send`](Engine::send), [`recv`](Engine::recv),
/// [`close`](Engine::close)) return immediately; their outcome arrives
/// later as exactly one [`Event`](crate::Event) at the engine's sink.
///
/// At most one send and one receive may be outstanding at a time; a
/// second is a caller bug and fails loudly rather than queueing. After an
/// [`Error`](crate::Event::Error) event the engine accepts nothing but
/// `close`.
///
/// Dropping the handle closes the engine if the caller never did.
///
/// # Examples
///
/// A listener accepting one connection:
///
/// ```no_run
/// use socket2::{Domain, Type};
/// use usock::{Ctx, Engine, Event};
///
/// fn main() -> Result<(), usock::Error> {
///     let ctx = Ctx::new()?;
///     let (tx, events) = crossbeam_channel::unbounded();
///
///     let listener = Engine::init(
///         &ctx,
///         Domain::IPV4,
///         Type::STREAM,
///         None,
///         Box::new(tx.clone()),
///     )?;
///     listener.bind("127.0.0.1:0".parse().unwrap())?;
///     listener.listen(128)?;
///     println!("listening on {}", listener.local_addr()?);
///
///     listener.accept(Box::new(tx));
///     match events.recv().unwrap().1 {
///         Event::Accepted(peer) => peer.recv(Vec::new(), 16),
///         event => panic!("unexpected {event:?}"),
///     }
///     Ok(())
/// }
/// ```
pub struct Engine {
  worker: WorkerHandle,
  id: EngineId,
  closed: Cell<bool>,
}

impl Engine {
  /// Creates the OS socket (CLOEXEC, non-blocking) and registers the new
  /// engine with a worker of `ctx`. Events for this engine go to `sink`.
  pub fn init(
    ctx: &Ctx,
    domain: Domain,
    ty: Type,
    protocol: Option<Protocol>,
    sink: Box<dyn EventSink>,
  ) -> Result<Self, Error> {
    let worker = ctx.assign_worker().clone();
    let (reply, rx) = bounded(1);
    if !worker.submit(Task::Register { domain, ty, protocol, sink, reply }) {
      return Err(Error::Closed);
    }
    let key = rx.recv().map_err(|_| Error::Closed)??;
    Ok(Self {
      id: EngineId::new(worker.index(), key),
      worker,
      closed: Cell::new(false),
    })
  }

  /// Handle for an engine born out of an accept completion.
  pub(crate) fn from_parts(worker: WorkerHandle, id: EngineId) -> Self {
    Self { worker, id, closed: Cell::new(false) }
  }

  pub fn id(&self) -> EngineId {
    self.id
  }

  /// Raw `setsockopt(2)` passthrough; `opt` is the option value's bytes.
  pub fn setsockopt(
    &self,
    level: i32,
    name: i32,
    opt: Vec<u8>,
  ) -> Result<(), Error> {
    let key = self.id.key();
    self.roundtrip(|reply| Task::SetSockOpt { key, level, name, opt, reply })
  }

  pub fn bind(&self, addr: SocketAddr) -> Result<(), Error> {
    let key = self.id.key();
    self.roundtrip(|reply| Task::Bind { key, addr, reply })
  }

  pub fn listen(&self, backlog: i32) -> Result<(), Error> {
    let key = self.id.key();
    self.roundtrip(|reply| Task::Listen { key, backlog, reply })
  }

  /// The address the socket is bound to; useful after binding port 0.
  pub fn local_addr(&self) -> Result<SocketAddr, Error> {
    let key = self.id.key();
    self.roundtrip(|reply| Task::LocalAddr { key, reply })
  }

  /// Starts connecting to `addr`. Completion arrives as
  /// [`Connected`](crate::Event::Connected) or
  /// [`Error`](crate::Event::Error); on error the engine is dead and must
  /// be closed. There is no automatic retry.
  pub fn connect(&self, addr: SocketAddr) {
    self.enqueue(Task::Connect { key: self.id.key(), addr });
  }

  /// Arms one accept on a listening engine. The next incoming connection
  /// is delivered as [`Accepted`](crate::Event::Accepted) carrying the
  /// new peer engine, which uses `peer_sink` for its own events. One call
  /// accepts one connection; call again to keep accepting.
  pub fn accept(&self, peer_sink: Box<dyn EventSink>) {
    self.enqueue(Task::Accept { key: self.id.key(), peer_sink });
  }

  /// Sends all bytes of all segments, in order, as one logical
  /// operation. Exactly one [`Sent`](crate::Event::Sent), carrying the
  /// buffers back, is delivered once every byte is written, however many
  /// partial writes that takes.
  pub fn send(&self, segs: Segments) {
    self.enqueue(Task::Send { key: self.id.key(), segs });
  }

  /// Receives exactly `len` bytes into `buf` (resized as needed).
  /// Delivers [`Received`](crate::Event::Received) only when all `len`
  /// bytes are there; end-of-stream or an OS error beforehand delivers
  /// [`Error`](crate::Event::Error) instead, never a short read.
  pub fn recv(&self, buf: Vec<u8>, len: usize) {
    self.enqueue(Task::Recv { key: self.id.key(), buf, len });
  }

  /// Starts closing: pending operations are cancelled, the descriptor is
  /// released, and [`Closed`](crate::Event::Closed) is delivered as the
  /// engine's final event. Valid in any state, idempotent, and the only
  /// way to cancel a stuck connect or accept.
  pub fn close(&self) {
    if self.closed.replace(true) {
      return;
    }
    let _ = self.worker.submit(Task::Close { key: self.id.key() });
  }

  fn roundtrip<T>(
    &self,
    make: impl FnOnce(Sender<Result<T, Error>>) -> Task,
  ) -> Result<T, Error> {
    if self.closed.get() {
      return Err(Error::Closed);
    }
    let (reply, rx) = bounded(1);
    if !self.worker.submit(make(reply)) {
      return Err(Error::Closed);
    }
    rx.recv().map_err(|_| Error::Closed)?
  }

  fn enqueue(&self, task: Task) {
    if self.closed.get() {
      log::debug!("usock: {} operation after close dropped", self.id);
      return;
    }
    if !self.worker.submit(task) {
      log::debug!("usock: {} operation dropped, worker pool is gone", self.id);
    }
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    self.close();
  }
}

impl fmt::Debug for Engine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Engine").field(&self.id).finish()
  }
}
