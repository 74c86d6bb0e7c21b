//! Draining a non-blocking socket into one text chunk.
//!
//! There is no framing on the wire, so a chunk is simply "everything that
//! was available when the readiness notification was handled". Several
//! client writes may arrive coalesced, and one write may be split over two
//! chunks.

use std::io::{self, ErrorKind, Read};

/// Bytes collected by one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// The peer closed its write side; no more data will follow.
    pub end_of_stream: bool,
}

impl Chunk {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Reads from `reader` in `buffer_size` steps until it would block or reports
/// end-of-stream.
///
/// A would-block result is "nothing more for now", not end-of-stream. Any
/// other I/O error is returned as-is so the caller can treat the peer as
/// gone. Decoding runs once over the concatenated bytes, so a read boundary
/// falling inside a multi-byte sequence does not matter.
pub fn drain<R: Read>(mut reader: R, buffer_size: usize) -> io::Result<Chunk> {
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut collected = Vec::new();
    let mut end_of_stream = false;

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                end_of_stream = true;
                break;
            }
            Ok(read) => collected.extend_from_slice(&buffer[..read]),
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(Chunk {
        text: String::from_utf8_lossy(&collected).into_owned(),
        end_of_stream,
    })
}
