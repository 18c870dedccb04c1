//! Channels between the event loop and the disk worker pool.
//!
//! Two one-way channels carry fixed-size records:
//! - the request queue (loop -> workers) is a bounded deque behind a mutex
//!   and condition variable, multi-consumer, produced into non-blockingly;
//! - the result channel (workers -> loop) is a datagram socket pair, so the
//!   loop can select on it alongside the client sockets and every record is
//!   delivered whole or not at all.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::net::UnixDatagram;
use std::sync::{Condvar, Mutex};

/// Direction of a disk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    /// pread from the file into the connection's ring buffer.
    Read,
    /// pwrite from the connection's ring buffer into the file.
    Write,
}

/// Raw cursor into a connection's ring buffer.
///
/// Safety: the pointer is only dereferenced by the worker that receives the
/// enclosing request, and only while the owning connection is marked as
/// waiting for the result. The connection (and its buffer) is not reclaimed
/// until that result has been delivered back to the loop.
#[derive(Debug, Clone, Copy)]
pub struct BufPtr(*mut u8);

unsafe impl Send for BufPtr {}

impl BufPtr {
    pub fn new(ptr: *mut u8) -> Self {
        BufPtr(ptr)
    }

    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0
    }
}

/// One disk request, immutable between submission and completion.
#[derive(Debug, Clone, Copy)]
pub struct IoRequest {
    /// Slab token of the owning connection.
    pub token: usize,
    /// Descriptor of the target file.
    pub fd: RawFd,
    /// Where in the ring buffer the transfer starts.
    pub buf: BufPtr,
    /// Bytes requested; workers may transfer less.
    pub len: usize,
    /// File offset of the transfer.
    pub offset: u64,
    pub kind: IoKind,
}

/// Completion record for one [`IoRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoResult {
    pub token: usize,
    pub bytes: usize,
}

const RESULT_RECORD_LEN: usize = 16;

impl IoResult {
    fn encode(self) -> [u8; RESULT_RECORD_LEN] {
        let mut record = [0u8; RESULT_RECORD_LEN];
        record[..8].copy_from_slice(&(self.token as u64).to_ne_bytes());
        record[8..].copy_from_slice(&(self.bytes as u64).to_ne_bytes());
        record
    }

    fn decode(record: &[u8; RESULT_RECORD_LEN]) -> IoResult {
        let mut word = [0u8; 8];
        word.copy_from_slice(&record[..8]);
        let token = u64::from_ne_bytes(word) as usize;
        word.copy_from_slice(&record[8..]);
        let bytes = u64::from_ne_bytes(word) as usize;
        IoResult { token, bytes }
    }
}

struct QueueInner {
    queue: VecDeque<IoRequest>,
    shutdown: bool,
}

/// Bounded multi-consumer request queue.
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    capacity: usize,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> RequestQueue {
        RequestQueue {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue without blocking. When the queue is full the request is
    /// handed back and the caller retries on a later loop tick.
    pub fn try_send(&self, request: IoRequest) -> Result<(), IoRequest> {
        let mut inner = self.inner.lock().expect("request queue poisoned");
        if inner.shutdown || inner.queue.len() >= self.capacity {
            return Err(request);
        }
        inner.queue.push_back(request);
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Dequeue one request, waiting on the condition variable while the
    /// queue is empty. Returns `None` once the queue is shut down and
    /// drained.
    pub fn recv(&self) -> Option<IoRequest> {
        let mut inner = self.inner.lock().expect("request queue poisoned");
        loop {
            if let Some(request) = inner.queue.pop_front() {
                return Some(request);
            }
            if inner.shutdown {
                return None;
            }
            inner = self
                .available
                .wait(inner)
                .expect("request queue poisoned");
        }
    }

    /// Wake every worker and make subsequent `recv` calls return `None`.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("request queue poisoned");
        inner.shutdown = true;
        drop(inner);
        self.available.notify_all();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("request queue poisoned").queue.len()
    }
}

/// Worker-side handle of the result channel. Sends block briefly if the
/// socket buffer fills; the loop drains the channel every iteration.
pub struct ResultSender {
    sock: UnixDatagram,
}

impl ResultSender {
    pub fn send(&self, result: IoResult) -> io::Result<()> {
        let record = result.encode();
        let sent = self.sock.send(&record)?;
        if sent != RESULT_RECORD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "partial result record sent",
            ));
        }
        Ok(())
    }

    pub fn try_clone(&self) -> io::Result<ResultSender> {
        Ok(ResultSender {
            sock: self.sock.try_clone()?,
        })
    }
}

/// Loop-side handle of the result channel, registrable with the poller.
pub struct ResultReceiver {
    sock: mio::net::UnixDatagram,
}

impl ResultReceiver {
    /// Pull one record if any is queued. `None` when the channel is empty.
    pub fn try_recv(&self) -> io::Result<Option<IoResult>> {
        let mut record = [0u8; RESULT_RECORD_LEN];
        match self.sock.recv(&mut record) {
            Ok(RESULT_RECORD_LEN) => Ok(Some(IoResult::decode(&record))),
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("partial result record of {n} bytes"),
            )),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The underlying socket, for poll registration.
    pub fn source(&mut self) -> &mut mio::net::UnixDatagram {
        &mut self.sock
    }
}

/// Create the worker-to-loop result channel.
pub fn result_channel() -> io::Result<(ResultSender, ResultReceiver)> {
    let (tx, rx) = UnixDatagram::pair()?;
    rx.set_nonblocking(true)?;
    Ok((
        ResultSender { sock: tx },
        ResultReceiver {
            sock: mio::net::UnixDatagram::from_std(rx),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn request(token: usize) -> IoRequest {
        IoRequest {
            token,
            fd: -1,
            buf: BufPtr::new(std::ptr::null_mut()),
            len: 0,
            offset: 0,
            kind: IoKind::Read,
        }
    }

    #[test]
    fn test_queue_fifo() {
        let queue = RequestQueue::new(8);
        queue.try_send(request(1)).unwrap();
        queue.try_send(request(2)).unwrap();

        assert_eq!(queue.recv().unwrap().token, 1);
        assert_eq!(queue.recv().unwrap().token, 2);
    }

    #[test]
    fn test_queue_full_hands_request_back() {
        let queue = RequestQueue::new(1);
        queue.try_send(request(1)).unwrap();

        let bounced = queue.try_send(request(2)).unwrap_err();
        assert_eq!(bounced.token, 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_shutdown_unblocks_consumers() {
        let queue = Arc::new(RequestQueue::new(8));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.recv().is_none())
        };
        // Give the consumer a moment to park on the condvar.
        thread::sleep(std::time::Duration::from_millis(50));
        queue.shutdown();
        assert!(consumer.join().unwrap());
    }

    #[test]
    fn test_queue_drains_after_shutdown() {
        let queue = RequestQueue::new(8);
        queue.try_send(request(7)).unwrap();
        queue.shutdown();

        assert_eq!(queue.recv().unwrap().token, 7);
        assert!(queue.recv().is_none());
        assert!(queue.try_send(request(8)).is_err());
    }

    #[test]
    fn test_result_channel_roundtrip() {
        let (tx, rx) = result_channel().unwrap();
        assert_eq!(rx.try_recv().unwrap(), None);

        tx.send(IoResult { token: 42, bytes: 8192 }).unwrap();
        tx.send(IoResult { token: 43, bytes: 0 }).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            Some(IoResult { token: 42, bytes: 8192 })
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Some(IoResult { token: 43, bytes: 0 })
        );
        assert_eq!(rx.try_recv().unwrap(), None);
    }
}
