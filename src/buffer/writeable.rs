//! Output queue entries. The original core modeled this as a `Writeable`
//! abstract base with `Buffer`, a sendfile-backed file range, and a raw
//! external-buffer subclass; a tagged enum says the same thing without the
//! indirection of a trait-object vtable for what is, in practice, a closed
//! set of three shapes.

use std::io::{self, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Arc;

use crate::buffer::PagedBuffer;
use crate::sys::fd::FileDesc;

/// A chunk of data queued for output on a connection.
pub enum Writeable {
    /// In-memory bytes, most commonly the tail of a handler's response.
    Buffer(PagedBuffer),
    /// A byte range of an open file, for serving static content without
    /// copying it through user-space buffers.
    FileRange {
        file: Arc<FileDesc>,
        offset: u64,
        remaining: u64,
    },
    /// A caller-owned buffer that isn't going through `PagedBuffer`'s page
    /// accounting — used for small fixed responses (error pages, FastCGI
    /// record headers) that don't need append/pop support.
    External(Vec<u8>),
}

impl Writeable {
    pub fn size(&self) -> u64 {
        match self {
            Writeable::Buffer(buf) => buf.len() as u64,
            Writeable::FileRange { remaining, .. } => *remaining,
            Writeable::External(v) => v.len() as u64,
        }
    }

    pub fn eof(&self) -> bool {
        self.size() == 0
    }

    pub fn memory_usage(&self) -> usize {
        match self {
            Writeable::Buffer(buf) => buf.len(),
            Writeable::FileRange { .. } => 0,
            Writeable::External(v) => v.len(),
        }
    }

    /// Appends to the writeable if its variant supports it. FastCGI
    /// response assembly and handler output both append to a `Buffer`
    /// writeable; file ranges and external buffers reject it, matching
    /// `Writeable::append`'s "may fail" contract in the original.
    pub fn append(&mut self, data: &[u8]) -> bool {
        match self {
            Writeable::Buffer(buf) => {
                buf.append(data);
                true
            }
            _ => false,
        }
    }

    /// Writes as much as possible to `fd` and advances internal cursors by
    /// however much actually landed. Does not pop consumed bytes from a
    /// `Buffer` variant — the caller does that once it knows the write
    /// succeeded, mirroring `BlockOutStage`'s write-then-pop sequencing.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        match self {
            Writeable::Buffer(buf) => buf.write_to_fd(fd),
            Writeable::External(data) => {
                let file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });
                (&*file).write(data)
            }
            Writeable::FileRange { file, offset, remaining } => {
                let chunk_len = (*remaining).min(crate::buffer::PAGE_SIZE as u64) as usize;
                let mut chunk = vec![0u8; chunk_len];
                let read = file.read_range(&mut chunk, *offset)?;
                if read == 0 {
                    *remaining = 0;
                    return Ok(0);
                }

                let out = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });
                let written = (&*out).write(&chunk[..read])?;
                *offset += written as u64;
                *remaining -= written as u64;
                Ok(written)
            }
        }
    }

    /// Drops the first `n` written bytes from a `Buffer` variant's backing
    /// store. No-op for the other variants, whose cursors `write_to_fd`
    /// already advanced in place.
    pub fn consume(&mut self, n: usize) {
        if let Writeable::Buffer(buf) = self {
            buf.pop(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_variant_reports_size_and_eof() {
        let mut buf = PagedBuffer::new();
        buf.append(b"abc");
        let w = Writeable::Buffer(buf);
        assert_eq!(w.size(), 3);
        assert!(!w.eof());
    }

    #[test]
    fn external_variant_rejects_append() {
        let mut w = Writeable::External(vec![1, 2, 3]);
        assert!(!w.append(&[4]));
        assert_eq!(w.size(), 3);
    }

    #[test]
    fn buffer_variant_accepts_append() {
        let mut w = Writeable::Buffer(PagedBuffer::new());
        assert!(w.append(b"hi"));
        assert_eq!(w.size(), 2);
    }
}
