use std::{
  io,
  sync::atomic::{AtomicUsize, Ordering},
  thread,
};

use crate::{
  config::Config,
  worker::{Task, Worker, WorkerHandle},
};

/// The execution context: a fixed pool of worker threads.
///
/// Every [`Engine`](crate::Engine) is assigned to one worker at init
/// (round-robin) and stays there for life. All of an engine's syscalls
/// run on that worker's thread, and its events are delivered from it:
/// one at a time, in completion order, never concurrently for the same
/// engine. Engines on different workers progress in parallel.
///
/// Dropping the `Ctx` stops the pool: every remaining engine is
/// force-closed (each still receives its final [`Closed`] event) and the
/// threads are joined.
///
/// [`Closed`]: crate::Event::Closed
pub struct Ctx {
  workers: Vec<WorkerHandle>,
  joins: Vec<thread::JoinHandle<()>>,
  next: AtomicUsize,
}

impl Ctx {
  /// Pool with the default [`Config`].
  pub fn new() -> io::Result<Self> {
    Self::with_config(Config::default())
  }

  pub fn with_config(config: Config) -> io::Result<Self> {
    let count = config.workers.max(1);
    let mut workers = Vec::with_capacity(count);
    let mut joins = Vec::with_capacity(count);
    for index in 0..count {
      let (worker, handle) = Worker::new(index as u32, config.batch_size)?;
      let join = thread::Builder::new()
        .name(format!("usock-worker-{index}"))
        .spawn(move || worker.run())?;
      workers.push(handle);
      joins.push(join);
    }
    Ok(Self { workers, joins, next: AtomicUsize::new(0) })
  }

  /// Number of worker threads in the pool.
  pub fn workers(&self) -> usize {
    self.workers.len()
  }

  /// Picks the worker the next engine will live on.
  pub(crate) fn assign_worker(&self) -> &WorkerHandle {
    let n = self.next.fetch_add(1, Ordering::Relaxed);
    &self.workers[n % self.workers.len()]
  }
}

impl Drop for Ctx {
  fn drop(&mut self) {
    for worker in &self.workers {
      worker.submit(Task::Shutdown);
    }
    for join in self.joins.drain(..) {
      let _ = join.join();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pool_size_is_clamped_to_one() {
    let ctx =
      Ctx::with_config(Config { workers: 0, ..Default::default() }).unwrap();
    assert_eq!(ctx.workers(), 1);
  }

  #[test]
  fn assignment_round_robins() {
    let ctx =
      Ctx::with_config(Config { workers: 3, ..Default::default() }).unwrap();
    let first = ctx.assign_worker().index();
    let second = ctx.assign_worker().index();
    let third = ctx.assign_worker().index();
    let fourth = ctx.assign_worker().index();
    assert_eq!(vec![first, second, third], vec![0, 1, 2]);
    assert_eq!(fourth, first);
  }
}
