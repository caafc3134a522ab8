//! Byte-counting write adapter

use std::io::{self, Write};

/// Counts every byte the inner writer accepts.
///
/// Placed *below* any buffering layer, so the count reflects bytes that have
/// actually been handed to the file, not bytes still sitting in a buffer.
#[derive(Debug)]
pub struct ByteTrackingSink<W> {
    inner: W,
    position: u64,
}

impl<W: Write> ByteTrackingSink<W> {
    /// `start_offset` is the size of the file the writer continues
    pub fn new(inner: W, start_offset: u64) -> Self {
        Self {
            inner,
            position: start_offset,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ByteTrackingSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
