//! Per-connection input/output streams: `InputStream` reads a connection's
//! fd into a single growable `PagedBuffer`, `OutputStream` is a queue of
//! `Writeable`s drained in order as the socket accepts writes.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};

use crate::buffer::writeable::Writeable;
use crate::buffer::PagedBuffer;

pub struct InputStream {
    fd: RawFd,
    buffer: PagedBuffer,
}

impl InputStream {
    pub fn new(fd: RawFd) -> InputStream {
        InputStream {
            fd,
            buffer: PagedBuffer::new(),
        }
    }

    /// Reads whatever is currently available on the fd into the buffer.
    pub fn read_into_buffer(&mut self) -> io::Result<usize> {
        let file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(self.fd) });
        let mut reader = &*file;
        self.buffer.read_from_fd(&mut reader)
    }

    pub fn buffer(&self) -> &PagedBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut PagedBuffer {
        &mut self.buffer
    }

    pub fn close(&mut self) {
        self.buffer.clear();
    }
}

/// A FIFO chain of `Writeable`s pending output on a connection's fd.
pub struct OutputStream {
    fd: RawFd,
    writeables: VecDeque<Writeable>,
    memory_usage: usize,
}

impl OutputStream {
    pub fn new(fd: RawFd) -> OutputStream {
        OutputStream {
            fd,
            writeables: VecDeque::new(),
            memory_usage: 0,
        }
    }

    pub fn append_data(&mut self, data: &[u8]) {
        if let Some(Writeable::Buffer(_)) = self.writeables.back() {
            let appended = self.writeables.back_mut().unwrap().append(data);
            if appended {
                self.memory_usage += data.len();
                return;
            }
        }

        self.append_writeable(Writeable::External(data.to_vec()));
    }

    pub fn append_file(&mut self, file: std::sync::Arc<crate::sys::fd::FileDesc>, offset: u64, len: u64) {
        self.append_writeable(Writeable::FileRange {
            file,
            offset,
            remaining: len,
        });
    }

    pub fn append_writeable(&mut self, w: Writeable) -> u64 {
        let size = w.size();
        self.memory_usage += w.memory_usage();
        self.writeables.push_back(w);
        size
    }

    pub fn is_done(&self) -> bool {
        self.writeables.is_empty()
    }

    pub fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    /// Writes as much of the front of the queue as the socket accepts in
    /// one call, popping fully-written entries. Returns bytes written;
    /// `Ok(0)` with the queue still non-empty means the socket would block.
    pub fn write_into_output(&mut self) -> io::Result<usize> {
        let mut total = 0;

        while let Some(front) = self.writeables.front_mut() {
            match front.write_to_fd(self.fd) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    front.consume(n);
                    self.memory_usage = self.memory_usage.saturating_sub(n);

                    if front.eof() {
                        self.writeables.pop_front();
                    } else {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => break,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn output_stream_tracks_memory_usage_and_drains() {
        let (mut a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let mut out = OutputStream::new(a.as_raw_fd());
        out.append_data(b"hello");
        assert!(!out.is_done());
        assert_eq!(out.memory_usage(), 5);

        let n = out.write_into_output().unwrap();
        assert_eq!(n, 5);
        assert!(out.is_done());

        let mut buf = [0u8; 5];
        std::io::Read::read_exact(&mut b, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
