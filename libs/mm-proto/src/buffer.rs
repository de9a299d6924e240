//! Segmented connection buffers.
//!
//! The receive side is a chain of fixed-size segments: socket reads land in
//! the tail segment, the parser advances a cursor from the head, and fully
//! consumed head segments are released as the cursor passes them. Lines and
//! payloads may span segment boundaries; a spanning line is stitched into a
//! scratch buffer at read time, and a spanning payload is copied piecewise
//! straight into its destination entry (one copy either way).
//!
//! The transmit side is a queue of chunks: owned bytes for protocol text,
//! or a borrowed splice of an entry's value that holds its reference until
//! the bytes have been written to the socket.

use mm_store::EntryRef;
use std::collections::VecDeque;

/// Segment payload size.
pub(crate) const SEG_SIZE: usize = 16 * 1024;

struct Segment {
    data: Box<[u8]>,
    /// Bytes filled by reads.
    len: usize,
}

impl Segment {
    fn new() -> Self {
        Self {
            data: vec![0u8; SEG_SIZE].into_boxed_slice(),
            len: 0,
        }
    }

    fn free(&self) -> usize {
        self.data.len() - self.len
    }
}

/// The ingress buffer.
pub(crate) struct RecvBuf {
    segs: VecDeque<Segment>,
    /// Parse cursor: offset into the head segment.
    pos: usize,
    /// Scratch for lines that span a segment boundary.
    scratch: Vec<u8>,
}

/// Outcome of a line scan.
pub(crate) enum Line {
    /// A complete line, CR?LF stripped. `(scratch, range)` indirection keeps
    /// borrows simple: the bytes live either in the head segment or in the
    /// scratch buffer until the next buffer operation.
    Complete { len: usize },
    /// No LF in the buffered bytes yet.
    Incomplete,
}

// === impl RecvBuf ===

impl RecvBuf {
    pub(crate) fn new() -> Self {
        Self {
            segs: VecDeque::new(),
            pos: 0,
            scratch: Vec::new(),
        }
    }

    /// Unparsed bytes currently buffered.
    pub(crate) fn available(&self) -> usize {
        let total: usize = self.segs.iter().map(|seg| seg.len).sum();
        total - self.pos
    }

    /// Space to read into, growing the chain if the tail is full. Returns
    /// the writable tail slice.
    pub(crate) fn writable(&mut self) -> &mut [u8] {
        if self.segs.back().is_none_or(|seg| seg.free() == 0) {
            self.segs.push_back(Segment::new());
        }
        let seg = self.segs.back_mut().expect("just ensured a tail segment");
        let len = seg.len;
        &mut seg.data[len..]
    }

    /// Records `n` bytes written into the slice returned by [`writable`].
    ///
    /// [`writable`]: Self::writable
    pub(crate) fn commit(&mut self, n: usize) {
        let seg = self.segs.back_mut().expect("commit without writable");
        seg.len += n;
        debug_assert!(seg.len <= seg.data.len());
    }

    /// Scans for the next LF and returns the line (without its CR?LF
    /// terminator) via [`line_bytes`]. The cursor advances past the
    /// terminator.
    ///
    /// [`line_bytes`]: Self::line_bytes
    pub(crate) fn read_line(&mut self) -> Line {
        // common case: the whole line sits in the head segment
        if let Some(head) = self.segs.front() {
            let haystack = &head.data[self.pos..head.len];
            if let Some(lf) = memchr::memchr(b'\n', haystack) {
                let mut line_len = lf;
                if line_len > 0 && haystack[line_len - 1] == b'\r' {
                    line_len -= 1;
                }
                self.scratch.clear();
                self.scratch.extend_from_slice(&haystack[..line_len]);
                self.consume(lf + 1);
                return Line::Complete { len: line_len };
            }
        } else {
            return Line::Incomplete;
        }

        // spanning case: stitch across segments into scratch
        let mut found = None;
        let mut skipped = 0;
        'outer: for (i, seg) in self.segs.iter().enumerate() {
            let start = if i == 0 { self.pos } else { 0 };
            let haystack = &seg.data[start..seg.len];
            if let Some(lf) = memchr::memchr(b'\n', haystack) {
                found = Some(skipped + lf);
                break 'outer;
            }
            skipped += haystack.len();
        }

        let Some(lf) = found else {
            return Line::Incomplete;
        };

        self.scratch.clear();
        let mut remaining = lf;
        for (i, seg) in self.segs.iter().enumerate() {
            let start = if i == 0 { self.pos } else { 0 };
            let avail = &seg.data[start..seg.len];
            let take = avail.len().min(remaining);
            self.scratch.extend_from_slice(&avail[..take]);
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }
        if self.scratch.last() == Some(&b'\r') {
            self.scratch.pop();
        }

        let line_len = self.scratch.len();
        self.consume(lf + 1);
        Line::Complete { len: line_len }
    }

    /// The bytes of the most recent [`read_line`](Self::read_line) result.
    pub(crate) fn line_bytes(&self) -> &[u8] {
        &self.scratch
    }

    /// Copies exactly `dst.len()` payload bytes from the cursor into `dst`
    /// and consumes them. Returns `false` (copying nothing) if that many
    /// bytes are not buffered yet.
    pub(crate) fn copy_payload(&mut self, dst: &mut [u8]) -> bool {
        if self.available() < dst.len() {
            return false;
        }

        let mut copied = 0;
        for (i, seg) in self.segs.iter().enumerate() {
            let start = if i == 0 { self.pos } else { 0 };
            let avail = &seg.data[start..seg.len];
            let take = avail.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&avail[..take]);
            copied += take;
            if copied == dst.len() {
                break;
            }
        }

        self.consume(dst.len());
        true
    }

    /// The buffered byte `offset` positions past the cursor, if present.
    pub(crate) fn peek(&self, offset: usize) -> Option<u8> {
        let mut remaining = self.pos + offset;
        for seg in &self.segs {
            if remaining < seg.len {
                return Some(seg.data[remaining]);
            }
            remaining -= seg.len;
        }
        None
    }

    /// Advances the cursor by `n` buffered bytes, releasing spent head
    /// segments.
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.pos += n;

        while let Some(head) = self.segs.front() {
            if self.pos < head.len {
                break;
            }
            self.pos -= head.len;
            self.segs.pop_front();
        }
    }

    /// Consumes up to and including the next LF (parse-error recovery).
    /// Returns `false` if no LF is buffered.
    pub(crate) fn skip_past_lf(&mut self) -> bool {
        let mut skipped = 0;
        for (i, seg) in self.segs.iter().enumerate() {
            let start = if i == 0 { self.pos } else { 0 };
            let haystack = &seg.data[start..seg.len];
            if let Some(lf) = memchr::memchr(b'\n', haystack) {
                self.consume(skipped + lf + 1);
                return true;
            }
            skipped += haystack.len();
        }
        false
    }
}

/// One queued egress chunk.
enum Chunk {
    Owned(Vec<u8>),
    /// A borrowed slice of an entry's value; the reference is released when
    /// the chunk has been fully written.
    Splice { entry: EntryRef, written: usize },
}

/// The egress buffer.
pub(crate) struct XmitBuf {
    chunks: VecDeque<Chunk>,
    /// Write progress within the head chunk.
    head_written: usize,
}

// === impl XmitBuf ===

impl XmitBuf {
    pub(crate) fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            head_written: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Appends protocol text, coalescing into the trailing owned chunk.
    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) {
        if let Some(Chunk::Owned(tail)) = self.chunks.back_mut() {
            tail.extend_from_slice(bytes);
            return;
        }
        self.chunks.push_back(Chunk::Owned(bytes.to_vec()));
    }

    /// Splices an entry's value into the egress queue without copying; the
    /// entry stays reffed until transmitted.
    pub(crate) fn push_splice(&mut self, entry: EntryRef) {
        self.chunks.push_back(Chunk::Splice { entry, written: 0 });
    }

    /// The head chunk's unwritten bytes, or `None` when drained.
    pub(crate) fn front(&self) -> Option<&[u8]> {
        let chunk = self.chunks.front()?;
        Some(match chunk {
            Chunk::Owned(bytes) => &bytes[self.head_written..],
            Chunk::Splice { entry, written } => &entry.value()[*written..],
        })
    }

    /// Records `n` bytes written from [`front`](Self::front), releasing the
    /// head chunk (and any spliced entry reference) once complete.
    pub(crate) fn advance(&mut self, n: usize) {
        let done = {
            let chunk = self.chunks.front_mut().expect("advance on empty buffer");
            match chunk {
                Chunk::Owned(bytes) => {
                    self.head_written += n;
                    debug_assert!(self.head_written <= bytes.len());
                    self.head_written == bytes.len()
                }
                Chunk::Splice { entry, written } => {
                    *written += n;
                    debug_assert!(*written <= entry.value_len());
                    *written == entry.value_len()
                }
            }
        };

        if done {
            self.chunks.pop_front();
            self.head_written = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(buf: &mut RecvBuf, bytes: &[u8]) {
        let mut fed = 0;
        while fed < bytes.len() {
            let dst = buf.writable();
            let n = dst.len().min(bytes.len() - fed);
            dst[..n].copy_from_slice(&bytes[fed..fed + n]);
            buf.commit(n);
            fed += n;
        }
    }

    #[test]
    fn reads_crlf_and_bare_lf_lines() {
        let mut buf = RecvBuf::new();
        feed(&mut buf, b"first\r\nsecond\nthird");

        assert!(matches!(buf.read_line(), Line::Complete { len: 5 }));
        assert_eq!(buf.line_bytes(), b"first");
        assert!(matches!(buf.read_line(), Line::Complete { len: 6 }));
        assert_eq!(buf.line_bytes(), b"second");
        assert!(matches!(buf.read_line(), Line::Incomplete));

        feed(&mut buf, b"\r\n");
        assert!(matches!(buf.read_line(), Line::Complete { len: 5 }));
        assert_eq!(buf.line_bytes(), b"third");
    }

    #[test]
    fn line_spanning_segments_is_stitched() {
        let mut buf = RecvBuf::new();

        // fill almost a whole segment, then a line crossing the boundary
        let filler = vec![b'x'; SEG_SIZE - 4];
        feed(&mut buf, &filler);
        feed(&mut buf, b"\r\nspanning line\r\n");

        assert!(matches!(buf.read_line(), Line::Complete { .. }));
        assert_eq!(buf.line_bytes().len(), SEG_SIZE - 4);
        assert!(matches!(buf.read_line(), Line::Complete { len: 13 }));
        assert_eq!(buf.line_bytes(), b"spanning line");
    }

    #[test]
    fn payload_copy_waits_for_all_bytes() {
        let mut buf = RecvBuf::new();
        feed(&mut buf, b"abc");

        let mut dst = [0u8; 5];
        assert!(!buf.copy_payload(&mut dst));

        feed(&mut buf, b"de");
        assert!(buf.copy_payload(&mut dst));
        assert_eq!(&dst, b"abcde");
        assert_eq!(buf.available(), 0);
    }

    #[test]
    fn payload_larger_than_a_segment() {
        let mut buf = RecvBuf::new();
        let payload: Vec<u8> = (0..SEG_SIZE * 2 + 100)
            .map(|i| u8::try_from(i % 251).unwrap())
            .collect();
        feed(&mut buf, &payload);

        let mut dst = vec![0u8; payload.len()];
        assert!(buf.copy_payload(&mut dst));
        assert_eq!(dst, payload);
    }

    #[test]
    fn skip_past_lf_recovers_the_cursor() {
        let mut buf = RecvBuf::new();
        feed(&mut buf, b"garbage without end");
        assert!(!buf.skip_past_lf());

        feed(&mut buf, b"...\nset k\r\n");
        assert!(buf.skip_past_lf());
        assert!(matches!(buf.read_line(), Line::Complete { len: 5 }));
        assert_eq!(buf.line_bytes(), b"set k");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Chunk boundaries must be invisible: however a byte stream is
            /// split across reads (and therefore segments), the sequence of
            /// parsed lines is identical.
            #[test]
            fn segmentation_is_invisible_to_line_parsing(
                lines in proptest::collection::vec("[a-z ]{0,300}", 0..8),
                chunk_sizes in proptest::collection::vec(1usize..700, 1..64),
            ) {
                let mut stream = Vec::new();
                for line in &lines {
                    stream.extend_from_slice(line.as_bytes());
                    stream.extend_from_slice(b"\r\n");
                }

                let mut buf = RecvBuf::new();
                let mut fed = 0;
                let mut chunks = chunk_sizes.iter().cycle();
                let mut got = Vec::new();

                while got.len() < lines.len() {
                    match buf.read_line() {
                        Line::Complete { .. } => {
                            got.push(String::from_utf8(buf.line_bytes().to_vec()).unwrap());
                        }
                        Line::Incomplete => {
                            prop_assert!(fed < stream.len(), "ran out of input");
                            let n = (*chunks.next().unwrap()).min(stream.len() - fed);
                            feed(&mut buf, &stream[fed..fed + n]);
                            fed += n;
                        }
                    }
                }

                prop_assert_eq!(got, lines);
            }

            /// Payload copies see the same bytes regardless of how they were
            /// segmented on the way in.
            #[test]
            fn segmentation_is_invisible_to_payload_copy(
                payload in proptest::collection::vec(any::<u8>(), 0..(3 * SEG_SIZE)),
                chunk in 1usize..2048,
            ) {
                let mut buf = RecvBuf::new();
                let mut fed = 0;
                while fed < payload.len() {
                    let n = chunk.min(payload.len() - fed);
                    feed(&mut buf, &payload[fed..fed + n]);
                    fed += n;
                }

                let mut dst = vec![0u8; payload.len()];
                prop_assert!(buf.copy_payload(&mut dst));
                prop_assert_eq!(dst, payload);
                prop_assert_eq!(buf.available(), 0);
            }
        }
    }
}
