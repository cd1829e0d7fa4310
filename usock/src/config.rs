use std::thread;

/// Maximum number of scatter-gather segments a single [`send`] may carry.
///
/// Keeping this a small constant lets the send path use a fixed-size iovec
/// array instead of a heap-allocated list.
///
/// [`send`]: crate::Engine::send
pub const MAX_SEGMENTS: usize = 3;

/// Default capacity of the per-engine batch receive buffer.
///
/// Chosen larger than a typical network MTU so one OS read can serve
/// several logical receive requests.
pub const DEFAULT_BATCH_SIZE: usize = 2048;

/// Configuration for a [`Ctx`](crate::Ctx) worker pool.
///
/// Plain public fields; start from [`Config::default`] and override what
/// you need:
///
/// ```
/// let config = usock::Config { workers: 2, ..Default::default() };
/// ```
#[derive(Debug, Clone)]
pub struct Config {
  /// Number of worker threads in the pool. The pool size is fixed for the
  /// lifetime of the `Ctx`; engines are spread over the workers at init
  /// time and never migrate.
  pub workers: usize,
  /// Capacity in bytes of each engine's batch receive buffer. Must be
  /// larger than the transmission unit of the links you expect to read
  /// from, or the batching buys nothing.
  pub batch_size: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      workers: thread::available_parallelism().map(Into::into).unwrap_or(1),
      batch_size: DEFAULT_BATCH_SIZE,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_has_at_least_one_worker() {
    let config = Config::default();
    assert!(config.workers >= 1);
    assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
  }
}
