//! Incremental byte streams and views
//!
//! A `StreamBuffer` is the mutable byte source a parse run reads from. The
//! caller appends chunks as they arrive and freezes the buffer when the
//! stream ends; the parser trims consumed bytes from the front so long
//! sessions do not accumulate memory. All positions are absolute stream
//! offsets, so trimming never invalidates a position.
//!
//! A `View` is a window onto the stream: a begin offset plus an optional
//! exclusive end. Bounded views implement the `size` field attribute; the
//! end of a bounded view counts as end-of-data for everything parsing
//! inside it.

/// An append-only byte buffer with front trimming
#[derive(Debug, Clone, Default)]
pub struct StreamBuffer {
    start: u64,
    bytes: Vec<u8>,
    frozen: bool,
}

impl StreamBuffer {
    pub fn new() -> Self {
        StreamBuffer::default()
    }

    /// A buffer holding all of `bytes`, already frozen
    pub fn frozen(bytes: impl Into<Vec<u8>>) -> Self {
        StreamBuffer {
            start: 0,
            bytes: bytes.into(),
            frozen: true,
        }
    }

    /// Append a chunk of newly arrived bytes
    ///
    /// # Panics
    /// Panics if the buffer has been frozen; freezing is the caller's
    /// declaration that no more data exists.
    pub fn append(&mut self, chunk: &[u8]) {
        assert!(!self.frozen, "append to a frozen stream buffer");
        self.bytes.extend_from_slice(chunk);
    }

    /// Declare the stream complete; no further appends are allowed
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Absolute offset of the first retained byte
    pub fn start_offset(&self) -> u64 {
        self.start
    }

    /// Absolute offset one past the last byte received so far
    pub fn end_offset(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    /// Drop retained bytes below the absolute offset `to`
    ///
    /// Offsets beyond the received data clamp to the end. Trimming below
    /// the current start is a no-op.
    pub fn trim(&mut self, to: u64) {
        if to <= self.start {
            return;
        }
        let n = (to - self.start).min(self.bytes.len() as u64) as usize;
        self.bytes.drain(..n);
        self.start += n as u64;
    }

    /// Bytes in the absolute range `[from, to)`, clamped to what is retained
    pub fn slice(&self, from: u64, to: u64) -> &[u8] {
        let lo = from.max(self.start).min(self.end_offset());
        let hi = to.max(lo).min(self.end_offset());
        let a = (lo - self.start) as usize;
        let b = (hi - self.start) as usize;
        &self.bytes[a..b]
    }

    /// The bytes a view can currently see
    pub fn view_bytes(&self, view: &View) -> &[u8] {
        let end = view.end.unwrap_or(u64::MAX);
        self.slice(view.begin, end)
    }

    /// True once a view can never see more bytes than it does now
    ///
    /// Holds when the stream is frozen, or when the view is bounded and
    /// every byte up to its end has been received.
    pub fn view_is_final(&self, view: &View) -> bool {
        if self.frozen {
            return true;
        }
        match view.end {
            Some(end) => self.end_offset() >= end,
            None => false,
        }
    }

    /// True when a view has no bytes now and never will have
    pub fn view_at_eod(&self, view: &View) -> bool {
        self.view_is_final(view) && self.view_bytes(view).is_empty()
    }
}

/// A window onto a stream, in absolute offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View {
    pub begin: u64,
    /// Exclusive end; `None` means unbounded
    pub end: Option<u64>,
}

impl View {
    pub fn open(begin: u64) -> Self {
        View { begin, end: None }
    }

    pub fn bounded(begin: u64, end: u64) -> Self {
        View {
            begin,
            end: Some(end),
        }
    }

    /// A sub-view starting at the same place, at most `len` bytes long
    ///
    /// A tighter existing bound wins over the new one.
    pub fn limit(&self, len: u64) -> View {
        let end = self.begin.saturating_add(len);
        View {
            begin: self.begin,
            end: Some(match self.end {
                Some(e) => e.min(end),
                None => end,
            }),
        }
    }

    pub fn advance_to(&mut self, pos: u64) {
        debug_assert!(pos >= self.begin);
        self.begin = pos;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_view_bytes() {
        let mut buf = StreamBuffer::new();
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.view_bytes(&View::open(0)), b"hello world");
        assert_eq!(buf.view_bytes(&View::open(6)), b"world");
    }

    #[test]
    fn test_trim_preserves_absolute_offsets() {
        let mut buf = StreamBuffer::new();
        buf.append(b"abcdef");
        buf.trim(4);
        assert_eq!(buf.start_offset(), 4);
        assert_eq!(buf.end_offset(), 6);
        assert_eq!(buf.slice(4, 6), b"ef");
        // Trimming below the start is a no-op
        buf.trim(2);
        assert_eq!(buf.start_offset(), 4);
    }

    #[test]
    fn test_bounded_view_clamps() {
        let mut buf = StreamBuffer::new();
        buf.append(b"abcdef");
        let v = View::bounded(1, 4);
        assert_eq!(buf.view_bytes(&v), b"bcd");
    }

    #[test]
    fn test_bounded_view_is_final_when_filled() {
        let mut buf = StreamBuffer::new();
        buf.append(b"ab");
        let v = View::bounded(0, 4);
        assert!(!buf.view_is_final(&v));
        buf.append(b"cdef");
        assert!(buf.view_is_final(&v));
        assert!(!buf.is_frozen());
    }

    #[test]
    fn test_frozen_buffer_is_final_everywhere() {
        let mut buf = StreamBuffer::new();
        buf.append(b"ab");
        buf.freeze();
        assert!(buf.view_is_final(&View::open(0)));
        assert!(buf.view_at_eod(&View::open(2)));
        assert!(!buf.view_at_eod(&View::open(0)));
    }

    #[test]
    fn test_limit_keeps_tighter_bound() {
        let v = View::bounded(10, 14);
        assert_eq!(v.limit(10), View::bounded(10, 14));
        assert_eq!(v.limit(2), View::bounded(10, 12));
    }

    #[test]
    #[should_panic(expected = "frozen")]
    fn test_append_after_freeze_panics() {
        let mut buf = StreamBuffer::new();
        buf.freeze();
        buf.append(b"x");
    }
}
