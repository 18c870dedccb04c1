//! Disk I/O worker pool.
//!
//! Workers only ever touch files: each one loops pulling a request off the
//! shared queue, performs a single bounded pread/pwrite against the file
//! descriptor named in the request, and reports the transferred byte count
//! on the result channel. Sockets stay with the event loop.

use crate::runtime::queue::{IoKind, IoRequest, IoResult, RequestQueue, ResultSender};
use std::io;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, warn};

/// Fixed set of disk worker threads.
pub struct WorkerPool {
    queue: Arc<RequestQueue>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers consuming `queue` and reporting on `results`.
    ///
    /// `chunk_size` bounds the bytes moved per request so one large transfer
    /// cannot monopolise a worker.
    pub fn spawn(
        count: usize,
        queue: Arc<RequestQueue>,
        results: &ResultSender,
        chunk_size: usize,
    ) -> io::Result<WorkerPool> {
        let mut handles = Vec::with_capacity(count);

        for worker_id in 0..count {
            let queue = Arc::clone(&queue);
            let results = results.try_clone()?;

            let handle = thread::Builder::new()
                .name(format!("disk-io-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &queue, &results, chunk_size))?;

            handles.push(handle);
        }

        Ok(WorkerPool { queue, handles })
    }

    /// Close the request queue and wait for every worker to drain and exit.
    pub fn shutdown(self) {
        self.queue.shutdown();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(worker_id: usize, queue: &RequestQueue, results: &ResultSender, chunk_size: usize) {
    debug!(worker = worker_id, "Disk worker started");

    while let Some(request) = queue.recv() {
        let bytes = match do_io(&request, chunk_size) {
            Ok(n) => n,
            Err(e) => {
                warn!(
                    worker = worker_id,
                    token = request.token,
                    offset = request.offset,
                    error = %e,
                    "Disk I/O failed"
                );
                0
            }
        };

        let result = IoResult {
            token: request.token,
            bytes,
        };
        if let Err(e) = results.send(result) {
            error!(worker = worker_id, error = %e, "Result channel broken");
            break;
        }
    }

    debug!(worker = worker_id, "Disk worker exiting");
}

/// Perform one bounded transfer. `EAGAIN` counts as zero bytes moved; any
/// other failure is reported to the caller.
fn do_io(request: &IoRequest, chunk_size: usize) -> io::Result<usize> {
    let len = request.len.min(chunk_size);
    let offset = request.offset as libc::off_t;

    let transferred = match request.kind {
        IoKind::Read => unsafe {
            libc::pread(request.fd, request.buf.as_mut_ptr().cast(), len, offset)
        },
        IoKind::Write => unsafe {
            libc::pwrite(request.fd, request.buf.as_mut_ptr().cast(), len, offset)
        },
    };

    if transferred < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            Ok(0)
        } else {
            Err(err)
        }
    } else {
        Ok(transferred as usize)
    }
}
