//! Worker threads: one poller and one task queue each.
//!
//! A worker owns the engine table for every engine assigned to it. Public
//! handles enqueue [`Task`]s; the worker thread drains the queue, drives
//! the state machines, waits on the poller, and delivers completion
//! events inline. That thread is the only one that ever touches a core,
//! so delivery for one engine is naturally serialized and ordered.

use std::{collections::HashMap, io, net::SocketAddr, os::fd::BorrowedFd};
use std::os::fd::IntoRawFd;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use polling::{Event as PollEvent, Events, Poller};
use socket2::{Domain, Protocol, Socket, Type};

use crate::{
  engine::Engine,
  error::Error,
  event::{EngineId, Event, EventSink},
  machine::{EngineCore, Outcome},
  segments::Segments,
};

pub(crate) enum Task {
  Register {
    domain: Domain,
    ty: Type,
    protocol: Option<Protocol>,
    sink: Box<dyn EventSink>,
    reply: Sender<Result<u64, Error>>,
  },
  SetSockOpt {
    key: u64,
    level: i32,
    name: i32,
    opt: Vec<u8>,
    reply: Sender<Result<(), Error>>,
  },
  Bind {
    key: u64,
    addr: SocketAddr,
    reply: Sender<Result<(), Error>>,
  },
  Listen {
    key: u64,
    backlog: i32,
    reply: Sender<Result<(), Error>>,
  },
  LocalAddr {
    key: u64,
    reply: Sender<Result<SocketAddr, Error>>,
  },
  Connect { key: u64, addr: SocketAddr },
  Accept { key: u64, peer_sink: Box<dyn EventSink> },
  Send { key: u64, segs: Segments },
  Recv { key: u64, buf: Vec<u8>, len: usize },
  Close { key: u64 },
  Shutdown,
}

/// Cheap, cloneable reference to a worker: the task queue plus the poller
/// to wake it with.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
  index: u32,
  tx: Sender<Task>,
  poller: Arc<Poller>,
}

impl WorkerHandle {
  pub(crate) fn index(&self) -> u32 {
    self.index
  }

  /// Enqueues a task and wakes the worker out of its poller wait.
  /// Returns false if the worker is gone.
  pub(crate) fn submit(&self, task: Task) -> bool {
    if self.tx.send(task).is_err() {
      return false;
    }
    let _ = self.poller.notify();
    true
  }
}

pub(crate) struct Worker {
  index: u32,
  poller: Arc<Poller>,
  tasks: Receiver<Task>,
  /// The worker's own handle, cloned into peer engines built on accept.
  handle: WorkerHandle,
  engines: HashMap<u64, EngineCore>,
  next_key: u64,
  batch_size: usize,
}

impl Worker {
  pub(crate) fn new(
    index: u32,
    batch_size: usize,
  ) -> io::Result<(Worker, WorkerHandle)> {
    let poller = Arc::new(Poller::new()?);
    let (tx, tasks) = crossbeam_channel::unbounded();
    let handle = WorkerHandle { index, tx, poller: poller.clone() };
    let worker = Worker {
      index,
      poller,
      tasks,
      handle: handle.clone(),
      engines: HashMap::new(),
      next_key: 0,
      batch_size,
    };
    Ok((worker, handle))
  }

  pub(crate) fn run(mut self) {
    log::debug!("usock: worker {} running", self.index);
    let mut events = Events::new();
    loop {
      loop {
        match self.tasks.try_recv() {
          Ok(Task::Shutdown) | Err(TryRecvError::Disconnected) => {
            self.shutdown();
            return;
          }
          Ok(task) => self.run_task(task),
          Err(TryRecvError::Empty) => break,
        }
      }

      events.clear();
      if let Err(err) = self.poller.wait(&mut events, None) {
        if err.kind() == io::ErrorKind::Interrupted {
          continue;
        }
        panic!("usock: worker {} poller failed: {err}", self.index);
      }
      for ev in events.iter() {
        self.on_ready(ev.key as u64, ev.readable, ev.writable);
      }
    }
  }

  fn run_task(&mut self, task: Task) {
    match task {
      Task::Register { domain, ty, protocol, sink, reply } => {
        let res = self.register(domain, ty, protocol, sink);
        let _ = reply.send(res.map_err(Error::Io));
      }
      Task::SetSockOpt { key, level, name, opt, reply } => {
        self.sync_op(key, &reply, |core| core.setsockopt(level, name, &opt));
      }
      Task::Bind { key, addr, reply } => {
        self.sync_op(key, &reply, |core| core.bind(addr));
      }
      Task::Listen { key, backlog, reply } => {
        self.sync_op(key, &reply, |core| core.listen(backlog));
      }
      Task::LocalAddr { key, reply } => {
        self.sync_op(key, &reply, |core| core.local_addr());
      }
      Task::Connect { key, addr } => {
        self.async_op(key, "connect", |core| core.start_connect(addr));
      }
      Task::Accept { key, peer_sink } => {
        self.async_op(key, "accept", |core| core.start_accept(peer_sink));
      }
      Task::Send { key, segs } => {
        self.async_op(key, "send", |core| core.start_send(segs));
      }
      Task::Recv { key, buf, len } => {
        self.async_op(key, "recv", |core| core.start_recv(buf, len));
      }
      Task::Close { key } => self.close_engine(key),
      Task::Shutdown => unreachable!("handled by the run loop"),
    }
  }

  fn register(
    &mut self,
    domain: Domain,
    ty: Type,
    protocol: Option<Protocol>,
    sink: Box<dyn EventSink>,
  ) -> io::Result<u64> {
    let socket = Socket::new(domain, ty, protocol)?;
    socket.set_nonblocking(true)?;
    let fd = socket.into_raw_fd();

    let key = self.next_key;
    self.next_key += 1;
    let id = EngineId::new(self.index, key);
    log::debug!("usock: {id} registered on fd {fd}");
    self
      .engines
      .insert(key, EngineCore::open(id, fd, sink, self.batch_size));
    Ok(key)
  }

  /// Runs a synchronous operation against a core and replies to the
  /// blocked caller.
  fn sync_op<T>(
    &mut self,
    key: u64,
    reply: &Sender<Result<T, Error>>,
    f: impl FnOnce(&mut EngineCore) -> io::Result<T>,
  ) {
    let res = match self.engines.get_mut(&key) {
      None => Err(Error::Closed),
      Some(core) if core.is_failed() => Err(Error::Failed),
      Some(core) => f(core).map_err(Error::Io),
    };
    let _ = reply.send(res);
  }

  /// Runs an asynchronous operation against a core. Operations racing a
  /// close or an asynchronous failure are dropped: the caller has an
  /// ERROR or CLOSED event explaining why.
  fn async_op(
    &mut self,
    key: u64,
    what: &str,
    f: impl FnOnce(&mut EngineCore) -> Outcome,
  ) {
    let outcome = match self.engines.get_mut(&key) {
      None => {
        log::debug!("usock: {what} on closed engine {key} dropped");
        return;
      }
      Some(core) if core.is_failed() => {
        log::debug!("usock: {} has failed, {what} dropped", core.id());
        return;
      }
      Some(core) => f(core),
    };
    self.handle_outcome(key, outcome);
    self.rearm(key);
  }

  fn on_ready(&mut self, key: u64, readable: bool, writable: bool) {
    if writable {
      let outcome = self.engines.get_mut(&key).map(EngineCore::on_writable);
      if let Some(outcome) = outcome {
        self.handle_outcome(key, outcome);
      }
    }
    if readable {
      let outcome = self.engines.get_mut(&key).map(EngineCore::on_readable);
      if let Some(outcome) = outcome {
        self.handle_outcome(key, outcome);
      }
    }
    self.rearm(key);
  }

  fn handle_outcome(&mut self, key: u64, outcome: Outcome) {
    match outcome {
      Outcome::Pending => {}
      Outcome::Ready(event) => self.deliver(key, event),
      Outcome::Accepted { fd, sink } => {
        let peer_key = self.next_key;
        self.next_key += 1;
        let peer_id = EngineId::new(self.index, peer_key);
        log::debug!("usock: {peer_id} adopted on fd {fd} via accept");
        self
          .engines
          .insert(peer_key, EngineCore::adopt(peer_id, fd, sink, self.batch_size));
        let peer = Engine::from_parts(self.handle.clone(), peer_id);
        self.deliver(key, Event::Accepted(peer));
      }
    }
  }

  fn deliver(&self, key: u64, event: Event) {
    if let Some(core) = self.engines.get(&key) {
      core.emit(event);
    }
  }

  /// Brings the poller's interest for an engine in line with what its
  /// pending operations are waiting for.
  fn rearm(&mut self, key: u64) {
    let Some(core) = self.engines.get_mut(&key) else { return };
    let (readable, writable) = core.wanted_interest();
    let event = match (readable, writable) {
      (true, true) => PollEvent::all(key as usize),
      (true, false) => PollEvent::readable(key as usize),
      (false, true) => PollEvent::writable(key as usize),
      (false, false) => PollEvent::none(key as usize),
    };

    let result = if core.registered {
      // SAFETY: the fd stays open for as long as the core is in the table.
      self.poller.modify(unsafe { BorrowedFd::borrow_raw(core.fd()) }, event)
    } else {
      if !(readable || writable) {
        return;
      }
      core.registered = true;
      // SAFETY: the fd outlives its registration; close_engine deletes it
      // from the poller before the descriptor is released.
      unsafe { self.poller.add(&BorrowedFd::borrow_raw(core.fd()), event) }
    };

    if let Err(err) = result {
      log::debug!("usock: poller registration for engine {key} failed: {err}");
      let event = match self.engines.get_mut(&key) {
        Some(core) => core.fail(err),
        None => return,
      };
      self.deliver(key, event);
    }
  }

  fn close_engine(&mut self, key: u64) {
    let Some(core) = self.engines.remove(&key) else {
      // Close is idempotent: a second request finds nothing and no second
      // CLOSED event is emitted.
      return;
    };
    if core.registered {
      // SAFETY: the fd is still open here; core.close() releases it after
      // the poller has forgotten it.
      let _ = self.poller.delete(unsafe { BorrowedFd::borrow_raw(core.fd()) });
    }
    let (id, sink) = core.close();
    log::debug!("usock: {id} closed");
    sink.event(id, Event::Closed);
  }

  /// Force-closes every remaining engine; each still gets its final
  /// CLOSED event.
  fn shutdown(&mut self) {
    log::debug!(
      "usock: worker {} stopping with {} engines live",
      self.index,
      self.engines.len()
    );
    let keys: Vec<u64> = self.engines.keys().copied().collect();
    for key in keys {
      self.close_engine(key);
    }
  }
}
