use crate::config::MAX_SEGMENTS;

/// Bounded scatter-gather list submitted as one logical send.
///
/// Holds up to [`MAX_SEGMENTS`] owned byte buffers in a fixed-size array,
/// so building and draining one never allocates. The buffers come back in
/// the [`Sent`](crate::Event::Sent) event for reuse.
///
/// ```
/// use usock::Segments;
///
/// let mut segments = Segments::from(b"header".to_vec());
/// segments.push(b"body".to_vec());
/// assert_eq!(segments.total_bytes(), 10);
/// ```
#[derive(Debug, Default)]
pub struct Segments {
  bufs: [Vec<u8>; MAX_SEGMENTS],
  len: usize,
}

impl Segments {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends a segment.
  ///
  /// # Panics
  ///
  /// Panics if the list already holds [`MAX_SEGMENTS`] segments.
  pub fn push(&mut self, buf: Vec<u8>) {
    self.try_push(buf).unwrap_or_else(|_| {
      panic!("usock contract: more than {MAX_SEGMENTS} send segments")
    });
  }

  /// Appends a segment, handing the buffer back if the list is full.
  pub fn try_push(&mut self, buf: Vec<u8>) -> Result<(), Vec<u8>> {
    if self.len == MAX_SEGMENTS {
      return Err(buf);
    }
    self.bufs[self.len] = buf;
    self.len += 1;
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Sum of the segment lengths in bytes.
  pub fn total_bytes(&self) -> usize {
    self.iter().map(<[u8]>::len).sum()
  }

  pub fn get(&self, index: usize) -> Option<&[u8]> {
    (index < self.len).then(|| self.bufs[index].as_slice())
  }

  pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
    self.bufs[..self.len].iter().map(Vec::as_slice)
  }

  /// Consumes the list, yielding the owned buffers in order.
  pub fn into_bufs(self) -> impl Iterator<Item = Vec<u8>> {
    self.bufs.into_iter().take(self.len)
  }
}

impl From<Vec<u8>> for Segments {
  fn from(buf: Vec<u8>) -> Self {
    let mut segments = Self::new();
    segments.push(buf);
    segments
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn push_up_to_bound() {
    let mut segments = Segments::new();
    for i in 0..MAX_SEGMENTS {
      segments.push(vec![i as u8; i + 1]);
    }
    assert_eq!(segments.len(), MAX_SEGMENTS);
    assert_eq!(segments.total_bytes(), 1 + 2 + 3);
    assert_eq!(segments.get(1), Some(&[1u8, 1][..]));
    assert_eq!(segments.get(MAX_SEGMENTS), None);
  }

  #[test]
  fn try_push_past_bound_returns_buffer() {
    let mut segments = Segments::new();
    for _ in 0..MAX_SEGMENTS {
      segments.push(vec![0]);
    }
    let rejected = segments.try_push(vec![7, 7]).unwrap_err();
    assert_eq!(rejected, vec![7, 7]);
    assert_eq!(segments.len(), MAX_SEGMENTS);
  }

  #[test]
  #[should_panic(expected = "usock contract")]
  fn push_past_bound_panics() {
    let mut segments = Segments::new();
    for _ in 0..=MAX_SEGMENTS {
      segments.push(vec![0]);
    }
  }

  #[test]
  fn into_bufs_preserves_order() {
    let mut segments = Segments::from(vec![1]);
    segments.push(vec![2, 2]);
    let bufs: Vec<_> = segments.into_bufs().collect();
    assert_eq!(bufs, vec![vec![1], vec![2, 2]]);
  }
}
