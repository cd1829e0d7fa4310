//! # usock - Event-Driven Socket Engine
//!
//! usock turns blocking OS socket primitives (bind, listen, connect,
//! accept, send, receive, close) into non-blocking, event-driven
//! operations executed on a fixed pool of worker threads. It is the
//! bottom layer of a messaging transport: everything above it (framing,
//! message assembly, a public socket API) consumes the events this engine
//! emits; everything below it is a thin syscall wrapper.
//!
//! ## Model
//!
//! - A [`Ctx`] owns the worker pool. Each worker runs an I/O poller and a
//!   task queue on its own OS thread.
//! - An [`Engine`] is one OS socket plus its state machine. It is bound
//!   to one worker for life; all of its syscalls and all of its event
//!   deliveries happen on that worker's thread.
//! - Completions are reported through an [`EventSink`] as enumerated
//!   [`Event`]s, serialized per engine, in completion order.
//!
//! ## Quick Start
//!
//! ```no_run
//! use socket2::{Domain, Type};
//! use usock::{Ctx, Engine, Event, Segments};
//!
//! fn main() -> Result<(), usock::Error> {
//!     let ctx = Ctx::new()?;
//!     let (tx, events) = crossbeam_channel::unbounded();
//!
//!     let engine =
//!         Engine::init(&ctx, Domain::IPV4, Type::STREAM, None, Box::new(tx))?;
//!     engine.connect("127.0.0.1:5555".parse().unwrap());
//!
//!     match events.recv().unwrap().1 {
//!         Event::Connected => engine.send(Segments::from(b"hello".to_vec())),
//!         Event::Error(err) => panic!("connect failed: {err}"),
//!         event => panic!("unexpected {event:?}"),
//!     }
//!     match events.recv().unwrap().1 {
//!         Event::Sent(_bufs) => engine.close(),
//!         event => panic!("unexpected {event:?}"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Threading
//!
//! Engine handles may be used from any thread; they only enqueue work.
//! Engine state is touched exclusively by the owning worker thread, so
//! the hot path takes no locks. Event sinks run on worker threads and
//! must not call an engine's synchronous operations (see [`EventSink`]).
//!
//! ## Error Handling
//!
//! Synchronous operations return [`Error`] directly. Asynchronous
//! operations report failures only through [`Event::Error`]; after one,
//! the engine accepts nothing but [`close`](Engine::close). Contract
//! violations (an operation issued from an impossible state, or a second
//! concurrent send/receive) are caller bugs and panic.

#[macro_use]
mod macros;

mod config;
mod ctx;
mod engine;
mod error;
mod event;
mod machine;
mod net_utils;
mod segments;
mod worker;

pub use config::{Config, DEFAULT_BATCH_SIZE, MAX_SEGMENTS};
pub use ctx::Ctx;
pub use engine::Engine;
pub use error::Error;
pub use event::{EngineId, Event, EventSink};
pub use segments::Segments;
