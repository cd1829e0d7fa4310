use std::io;

/// Error returned by the synchronous engine operations.
///
/// Asynchronous operations never return errors directly; their failures
/// arrive as [`Event::Error`](crate::Event::Error).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
  /// The engine was closed, or its worker pool has shut down.
  #[error("engine is closed")]
  Closed,

  /// A previous asynchronous operation failed; the engine accepts nothing
  /// but `close` now.
  #[error("engine has failed and accepts only close")]
  Failed,

  /// The underlying OS call failed.
  #[error(transparent)]
  Io(#[from] io::Error),
}
