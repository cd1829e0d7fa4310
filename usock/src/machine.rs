//! The per-socket state machine.
//!
//! An [`EngineCore`] wraps one OS descriptor and lives in the engine table
//! of the worker it was assigned to at init. Every method here runs on
//! that worker's thread and nowhere else; the public
//! [`Engine`](crate::Engine) handle only ever reaches a core through the
//! worker's task queue. That single-writer rule is what makes the whole
//! struct lock-free.
//!
//! Operations from states a correctly sequenced caller could never
//! observe (a send while listening, a second receive while one is
//! outstanding) are caller defects and panic. Operations that merely race
//! an asynchronous failure are dropped by the worker before they get
//! here; see [`EngineCore::is_failed`].

use std::{io, mem, net::SocketAddr, os::fd::RawFd, ptr};

use crate::{
  config::MAX_SEGMENTS,
  event::{EngineId, Event, EventSink},
  net_utils,
  segments::Segments,
};

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const SEND_FLAGS: libc::c_int = 0;

/// State tag of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
  /// Constructed, no OS socket yet.
  Idle,
  /// OS socket created and registered with a worker.
  Initialized,
  Bound,
  Listening,
  /// Non-blocking connect in flight, waiting for writability.
  Connecting,
  /// Accept in flight on a listening socket, waiting for readability.
  Accepting,
  /// Connected; send/recv are valid.
  Active,
  /// An asynchronous operation failed; only close is accepted.
  Failed,
  Closing,
  Closed,
}

/// What one stimulus (task or readiness) did to the machine.
pub(crate) enum Outcome {
  /// Still waiting on the OS; interest stays armed.
  Pending,
  /// A logical operation completed; deliver this event.
  Ready(Event),
  /// An accept completed. The worker owns peer construction, so the raw
  /// pieces travel up instead of a finished event.
  Accepted { fd: RawFd, sink: Box<dyn EventSink> },
}

struct PendingRecv {
  /// Destination buffer, resized to exactly the requested length.
  buf: Vec<u8>,
  filled: usize,
}

struct PendingSend {
  segs: Segments,
  /// Index of the first segment with unwritten bytes.
  seg: usize,
  /// Byte offset of the first unwritten byte within that segment.
  off: usize,
}

impl PendingSend {
  fn advance(&mut self, mut n: usize) {
    while n > 0 && self.seg < self.segs.len() {
      let rem = self.segs.get(self.seg).unwrap().len() - self.off;
      if n < rem {
        self.off += n;
        return;
      }
      n -= rem;
      self.seg += 1;
      self.off = 0;
    }
    debug_assert_eq!(n, 0);
  }

  fn remaining(&self) -> usize {
    let mut total = 0;
    for i in self.seg..self.segs.len() {
      total += self.segs.get(i).unwrap().len();
    }
    total - self.off
  }
}

/// Fixed-capacity buffer that amortizes OS reads across logical receive
/// requests. `pos <= len` always: bytes before `pos` were handed to a
/// caller already, bytes in `pos..len` were read from the OS but not yet
/// delivered.
pub(crate) struct BatchBuf {
  buf: Box<[u8]>,
  len: usize,
  pos: usize,
}

impl BatchBuf {
  pub(crate) fn new(capacity: usize) -> Self {
    Self { buf: vec![0; capacity].into_boxed_slice(), len: 0, pos: 0 }
  }

  pub(crate) fn available(&self) -> &[u8] {
    &self.buf[self.pos..self.len]
  }

  pub(crate) fn consume(&mut self, n: usize) {
    self.pos += n;
    debug_assert!(self.pos <= self.len);
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.pos == self.len
  }

  /// Refills an empty buffer through `read`, which reports how many bytes
  /// it placed at the front.
  pub(crate) fn refill(
    &mut self,
    read: impl FnOnce(&mut [u8]) -> io::Result<usize>,
  ) -> io::Result<usize> {
    debug_assert!(self.is_empty());
    self.pos = 0;
    self.len = 0;
    let n = read(&mut self.buf)?;
    debug_assert!(n <= self.buf.len());
    self.len = n;
    Ok(n)
  }
}

pub(crate) struct EngineCore {
  id: EngineId,
  fd: RawFd,
  state: State,
  sink: Box<dyn EventSink>,
  /// Whether the fd has been added to the worker's poller.
  pub(crate) registered: bool,
  recv: Option<PendingRecv>,
  batch: BatchBuf,
  send: Option<PendingSend>,
  /// Sink destined for the peer engine of a pending accept.
  accept_sink: Option<Box<dyn EventSink>>,
}

impl EngineCore {
  fn new(
    id: EngineId,
    fd: RawFd,
    sink: Box<dyn EventSink>,
    batch_size: usize,
  ) -> Self {
    Self {
      id,
      fd,
      state: State::Idle,
      sink,
      registered: false,
      recv: None,
      batch: BatchBuf::new(batch_size),
      send: None,
      accept_sink: None,
    }
  }

  /// Core for a freshly created socket.
  pub(crate) fn open(
    id: EngineId,
    fd: RawFd,
    sink: Box<dyn EventSink>,
    batch_size: usize,
  ) -> Self {
    let mut core = Self::new(id, fd, sink, batch_size);
    core.set_state(State::Initialized);
    core
  }

  /// Core for a descriptor produced by accept: born active.
  pub(crate) fn adopt(
    id: EngineId,
    fd: RawFd,
    sink: Box<dyn EventSink>,
    batch_size: usize,
  ) -> Self {
    let mut core = Self::new(id, fd, sink, batch_size);
    core.set_state(State::Active);
    core
  }

  pub(crate) fn id(&self) -> EngineId {
    self.id
  }

  pub(crate) fn fd(&self) -> RawFd {
    self.fd
  }

  pub(crate) fn is_failed(&self) -> bool {
    self.state == State::Failed
  }

  pub(crate) fn emit(&self, event: Event) {
    self.sink.event(self.id, event);
  }

  fn set_state(&mut self, next: State) {
    log::trace!("usock: {} {:?} -> {:?}", self.id, self.state, next);
    self.state = next;
  }

  /// Marks the engine failed, abandoning all pending work, and returns
  /// the event to deliver.
  pub(crate) fn fail(&mut self, err: io::Error) -> Event {
    log::debug!("usock: {} failed: {err}", self.id);
    self.recv = None;
    self.send = None;
    self.accept_sink = None;
    self.set_state(State::Failed);
    Event::Error(err)
  }

  pub(crate) fn setsockopt(
    &self,
    level: i32,
    name: i32,
    opt: &[u8],
  ) -> io::Result<()> {
    assert!(
      !matches!(self.state, State::Idle | State::Closing | State::Closed),
      "usock contract: setsockopt on engine in state {:?}",
      self.state
    );
    syscall!(setsockopt(
      self.fd,
      level,
      name,
      opt.as_ptr().cast(),
      opt.len() as libc::socklen_t
    ))
    .map(drop)
  }

  pub(crate) fn bind(&mut self, addr: SocketAddr) -> io::Result<()> {
    assert!(
      self.state == State::Initialized,
      "usock contract: bind on engine in state {:?}",
      self.state
    );
    let (storage, len) = net_utils::std_into_sockaddr(addr);
    syscall!(bind(self.fd, ptr::from_ref(&storage).cast(), len))?;
    self.set_state(State::Bound);
    Ok(())
  }

  pub(crate) fn listen(&mut self, backlog: i32) -> io::Result<()> {
    assert!(
      self.state == State::Bound,
      "usock contract: listen on engine in state {:?}",
      self.state
    );
    syscall!(listen(self.fd, backlog))?;
    self.set_state(State::Listening);
    Ok(())
  }

  pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
    // SAFETY: zeroed sockaddr_storage is a valid value for getsockname to
    // overwrite.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
      self.fd,
      ptr::from_mut(&mut storage).cast(),
      &mut len
    ))?;
    net_utils::sockaddr_into_std(&storage)
  }

  pub(crate) fn start_connect(&mut self, addr: SocketAddr) -> Outcome {
    assert!(
      matches!(self.state, State::Initialized | State::Bound),
      "usock contract: connect on engine in state {:?}",
      self.state
    );
    let (storage, len) = net_utils::std_into_sockaddr(addr);
    match syscall!(connect(self.fd, ptr::from_ref(&storage).cast(), len)) {
      Ok(_) => {
        self.set_state(State::Active);
        Outcome::Ready(Event::Connected)
      }
      // A non-blocking connect that cannot finish immediately parks as
      // EINPROGRESS; EINTR means the connect continues in the background.
      Err(err)
        if err.raw_os_error() == Some(libc::EINPROGRESS)
          || err.kind() == io::ErrorKind::Interrupted =>
      {
        self.set_state(State::Connecting);
        Outcome::Pending
      }
      Err(err) => Outcome::Ready(self.fail(err)),
    }
  }

  fn connect_ready(&mut self) -> Outcome {
    debug_assert_eq!(self.state, State::Connecting);
    // Writability decided the connect; SO_ERROR says which way.
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    match syscall!(getsockopt(
      self.fd,
      libc::SOL_SOCKET,
      libc::SO_ERROR,
      ptr::from_mut(&mut err).cast(),
      &mut len
    )) {
      Ok(_) if err == 0 => {
        self.set_state(State::Active);
        Outcome::Ready(Event::Connected)
      }
      Ok(_) => Outcome::Ready(self.fail(io::Error::from_raw_os_error(err))),
      Err(err) => Outcome::Ready(self.fail(err)),
    }
  }

  pub(crate) fn start_accept(
    &mut self,
    peer_sink: Box<dyn EventSink>,
  ) -> Outcome {
    assert!(
      self.state == State::Listening,
      "usock contract: accept on engine in state {:?}",
      self.state
    );
    assert!(
      self.accept_sink.is_none(),
      "usock contract: accept already outstanding"
    );
    self.accept_sink = Some(peer_sink);
    self.set_state(State::Accepting);
    self.drive_accept()
  }

  fn drive_accept(&mut self) -> Outcome {
    debug_assert_eq!(self.state, State::Accepting);
    loop {
      match try_accept(self.fd) {
        Ok(fd) => {
          self.set_state(State::Listening);
          let sink = self.accept_sink.take().unwrap();
          return Outcome::Accepted { fd, sink };
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          return Outcome::Pending;
        }
        // A connection that died while queued in the backlog is not an
        // error of the listener; keep waiting for the next one.
        Err(err)
          if err.kind() == io::ErrorKind::Interrupted
            || err.raw_os_error() == Some(libc::ECONNABORTED) => {}
        Err(err) => return Outcome::Ready(self.fail(err)),
      }
    }
  }

  pub(crate) fn start_send(&mut self, segs: Segments) -> Outcome {
    assert!(
      self.state == State::Active,
      "usock contract: send on engine in state {:?}",
      self.state
    );
    assert!(self.send.is_none(), "usock contract: send already outstanding");
    self.send = Some(PendingSend { segs, seg: 0, off: 0 });
    self.drive_send()
  }

  fn drive_send(&mut self) -> Outcome {
    enum Step {
      Done,
      Again,
      Block,
      Fail(io::Error),
    }

    let fd = self.fd;
    loop {
      let step = {
        let send =
          self.send.as_mut().expect("drive_send without a pending send");
        if send.remaining() == 0 {
          Step::Done
        } else {
          // Scatter-gather descriptor over the unwritten tail. The iovec
          // array is fixed-size; nothing here allocates.
          // SAFETY: a zeroed iovec array is valid; entries are filled
          // before cnt covers them.
          let mut iov: [libc::iovec; MAX_SEGMENTS] = unsafe { mem::zeroed() };
          let mut cnt = 0;
          for i in send.seg..send.segs.len() {
            let seg = send.segs.get(i).unwrap();
            let off = if i == send.seg { send.off } else { 0 };
            if off >= seg.len() {
              continue;
            }
            iov[cnt] = libc::iovec {
              iov_base: seg[off..].as_ptr() as *mut libc::c_void,
              iov_len: seg.len() - off,
            };
            cnt += 1;
          }
          // SAFETY: zeroed msghdr is valid; only iov fields are used.
          let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
          hdr.msg_iov = iov.as_mut_ptr();
          hdr.msg_iovlen = cnt as _;
          match syscall!(sendmsg(fd, &hdr, SEND_FLAGS)) {
            Ok(n) => {
              send.advance(n as usize);
              if send.remaining() == 0 { Step::Done } else { Step::Again }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Step::Block,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Step::Again,
            Err(err) => Step::Fail(err),
          }
        }
      };
      match step {
        Step::Done => {
          let send = self.send.take().unwrap();
          return Outcome::Ready(Event::Sent(send.segs));
        }
        Step::Again => {}
        Step::Block => return Outcome::Pending,
        Step::Fail(err) => return Outcome::Ready(self.fail(err)),
      }
    }
  }

  pub(crate) fn start_recv(&mut self, mut buf: Vec<u8>, len: usize) -> Outcome {
    assert!(
      self.state == State::Active,
      "usock contract: recv on engine in state {:?}",
      self.state
    );
    assert!(self.recv.is_none(), "usock contract: receive already outstanding");
    buf.resize(len, 0);
    self.recv = Some(PendingRecv { buf, filled: 0 });
    self.drive_recv()
  }

  fn drive_recv(&mut self) -> Outcome {
    let fd = self.fd;
    loop {
      // Serve what the batch buffer already holds.
      {
        let recv =
          self.recv.as_mut().expect("drive_recv without a pending receive");
        let want = recv.buf.len() - recv.filled;
        let n = want.min(self.batch.available().len());
        if n > 0 {
          recv.buf[recv.filled..recv.filled + n]
            .copy_from_slice(&self.batch.available()[..n]);
          recv.filled += n;
          self.batch.consume(n);
        }
        if recv.filled == recv.buf.len() {
          let recv = self.recv.take().unwrap();
          return Outcome::Ready(Event::Received(recv.buf));
        }
      }
      // Not satisfied: refill the batch from the OS.
      let refilled = self.batch.refill(|dst| {
        syscall!(recv(fd, dst.as_mut_ptr().cast(), dst.len(), 0))
          .map(|n| n as usize)
      });
      match refilled {
        // End of stream before the requested length: the receive contract
        // is exact-length-or-error.
        Ok(0) => {
          return Outcome::Ready(
            self.fail(io::Error::from_raw_os_error(libc::ECONNRESET)),
          );
        }
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          return Outcome::Pending;
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => return Outcome::Ready(self.fail(err)),
      }
    }
  }

  /// Dispatches a readability notification to whichever operation was
  /// waiting for it.
  pub(crate) fn on_readable(&mut self) -> Outcome {
    if self.state == State::Accepting {
      self.drive_accept()
    } else if self.state == State::Active && self.recv.is_some() {
      self.drive_recv()
    } else {
      Outcome::Pending
    }
  }

  /// Dispatches a writability notification.
  pub(crate) fn on_writable(&mut self) -> Outcome {
    if self.state == State::Connecting {
      self.connect_ready()
    } else if self.state == State::Active && self.send.is_some() {
      self.drive_send()
    } else {
      Outcome::Pending
    }
  }

  /// Which readiness the poller should watch for, derived from the
  /// pending operations.
  pub(crate) fn wanted_interest(&self) -> (bool, bool) {
    match self.state {
      State::Connecting => (false, true),
      State::Accepting => (true, false),
      State::Active => (self.recv.is_some(), self.send.is_some()),
      _ => (false, false),
    }
  }

  /// Releases the descriptor and consumes the core. Pending operations
  /// are abandoned without events; the caller (the worker) emits the
  /// final `Closed` through the returned sink.
  pub(crate) fn close(mut self) -> (EngineId, Box<dyn EventSink>) {
    self.set_state(State::Closing);
    let _ = syscall!(close(self.fd));
    self.set_state(State::Closed);
    (self.id, self.sink)
  }
}

fn try_accept(fd: RawFd) -> io::Result<RawFd> {
  #[cfg(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "illumos",
    target_os = "linux",
    target_os = "netbsd",
    target_os = "openbsd",
  ))]
  {
    syscall!(accept4(
      fd,
      ptr::null_mut(),
      ptr::null_mut(),
      libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK
    ))
  }

  #[cfg(not(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "illumos",
    target_os = "linux",
    target_os = "netbsd",
    target_os = "openbsd",
  )))]
  {
    let sock = syscall!(accept(fd, ptr::null_mut(), ptr::null_mut()))?;
    let flags = syscall!(fcntl(sock, libc::F_SETFD, libc::FD_CLOEXEC))
      .and_then(|_| syscall!(fcntl(sock, libc::F_SETFL, libc::O_NONBLOCK)));
    if let Err(err) = flags {
      // SAFETY: sock came from accept above and was never handed out.
      unsafe { libc::close(sock) };
      return Err(err);
    }
    Ok(sock)
  }
}
