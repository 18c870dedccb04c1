//! Per-connection state machine.
//!
//! A connection walks INIT -> HEADERS_RECEIVING -> HEADERS_RECEIVED ->
//! HEADERS_PROCESSED -> ON_TRANSMISSION -> CLOSED -> CLEANUP. The event loop
//! calls [`Connection::handle`] once per iteration; socket I/O happens here,
//! disk I/O is delegated to the worker pool through the request queue.
//!
//! At most one disk request is ever outstanding per connection. While
//! `waiting_result` is set the worker owns the ring-buffer span named in the
//! request; the loop keeps working the opposite region, which is disjoint.
//! A connection that closes with a request still in flight is parked in
//! CLOSED until the result record arrives, so the worker never touches a
//! reclaimed buffer or descriptor.

use crate::filecache::{FileCache, ReadHandle};
use crate::http::{self, HeaderDetector, Method, Request, ScanStatus};
use crate::runtime::pacing::{IdleTimer, RateWindow, HEADER_TIMEOUT};
use crate::runtime::queue::{BufPtr, IoKind, IoRequest, RequestQueue};
use crate::runtime::ring::RingBuffer;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Just accepted, nothing read yet.
    Init,
    /// Some of the request header has arrived.
    HeadersReceiving,
    /// The full header block is in the buffer, ready to parse.
    HeadersReceived,
    /// Parsed and the target resource is open.
    HeadersProcessed,
    /// Streaming bytes between socket and file.
    OnTransmission,
    /// Socket is shut; may still wait for an in-flight disk result.
    Closed,
    /// Being reclaimed by the loop's sweep.
    Cleanup,
}

/// The file side of a transfer.
enum Resource {
    /// Nothing open yet.
    None,
    /// Shared read descriptor from the open-file cache (GET).
    Cached(ReadHandle),
    /// Exclusive write descriptor (PUT).
    Owned(std::fs::File),
}

impl Resource {
    fn fd(&self) -> Option<std::os::fd::RawFd> {
        match self {
            Resource::None => None,
            Resource::Cached(handle) => Some(handle.fd),
            Resource::Owned(file) => Some(file.as_raw_fd()),
        }
    }
}

/// Everything a connection needs from the loop for one tick.
pub struct TickContext<'a> {
    pub registry: &'a Registry,
    pub cache: &'a mut FileCache,
    pub queue: &'a RequestQueue,
    pub send_rate: u64,
    pub body_timeout: Option<Duration>,
    pub now: Instant,
}

enum RecvOutcome {
    Data(usize),
    WouldBlock,
    Eof,
    BufferFull,
    Failed(io::Error),
}

/// One client connection and all of its transfer state.
pub struct Connection {
    stream: TcpStream,
    token: Token,
    state: ConnState,
    detector: HeaderDetector,
    request: Option<Request>,
    ring: RingBuffer,
    resource: Resource,
    /// Content length for PUT, `st_size` for GET.
    file_size: u64,
    /// Bytes moved between the file and the ring so far.
    file_offset: u64,
    /// Request built but not yet accepted by the queue.
    pending: Option<IoRequest>,
    /// A worker owns part of the ring until the result record arrives.
    waiting_result: bool,
    /// The client closed its sending half.
    peer_eof: bool,
    readable: bool,
    writable: bool,
    idle: IdleTimer,
    rate: RateWindow,
}

impl Connection {
    pub fn new(stream: TcpStream, token: Token, ring: RingBuffer, now: Instant) -> Connection {
        Connection {
            stream,
            token,
            state: ConnState::Init,
            detector: HeaderDetector::new(),
            request: None,
            ring,
            resource: Resource::None,
            file_size: 0,
            file_offset: 0,
            pending: None,
            waiting_result: false,
            peer_eof: false,
            readable: false,
            writable: false,
            idle: IdleTimer::new(now),
            rate: RateWindow::new(now),
        }
    }

    /// Register for reading; every connection starts by receiving a header.
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE)
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Record readiness reported by the poller. The flags stay up until a
    /// socket call returns `WouldBlock`.
    pub fn on_event(&mut self, event: &mio::event::Event) {
        if event.is_readable() || event.is_read_closed() {
            self.readable = true;
        }
        if event.is_writable() || event.is_write_closed() {
            self.writable = true;
        }
    }

    /// CLOSED with no in-flight disk request: safe to tear down.
    pub fn is_reclaimable(&self) -> bool {
        self.state == ConnState::Closed && !self.waiting_result
    }

    /// Release the file side and enter CLEANUP. Called by the loop's sweep
    /// right before the connection is dropped.
    pub fn release_resources(&mut self, cache: &mut FileCache) {
        if let Resource::Cached(handle) = &self.resource {
            cache.release(handle.ino);
        }
        self.resource = Resource::None;
        self.state = ConnState::Cleanup;
    }

    /// Drive the state machine for one loop iteration.
    pub fn handle(&mut self, ctx: &mut TickContext<'_>) {
        if matches!(self.state, ConnState::Init | ConnState::HeadersReceiving) {
            self.recv_headers(ctx);
        }
        if self.state == ConnState::HeadersReceived {
            self.process_headers(ctx);
        }
        if matches!(
            self.state,
            ConnState::HeadersProcessed | ConnState::OnTransmission
        ) {
            self.transmission(ctx);
        }
    }

    /// Apply a worker's completion record.
    pub fn apply_result(&mut self, registry: &Registry, bytes: usize) {
        self.waiting_result = false;

        if matches!(self.state, ConnState::Closed | ConnState::Cleanup) {
            // Torn down while the request was in flight; the sweep takes
            // over from here.
            return;
        }

        let Some(method) = self.request.as_ref().map(|r| r.method) else {
            return;
        };
        match method {
            Method::Get => self.ring.advance_write(bytes),
            Method::Put => self.ring.advance_read(bytes),
        }
        self.file_offset += bytes as u64;

        if bytes == 0 {
            // The request named a non-empty span, so zero progress means the
            // file shrank under us or the disk failed.
            warn!(token = self.token.0, "Disk transfer made no progress");
            self.close_now(registry);
        }
    }

    fn recv_headers(&mut self, ctx: &mut TickContext<'_>) {
        self.state = ConnState::HeadersReceiving;

        if !self.readable {
            if self.idle.expired(ctx.now, HEADER_TIMEOUT) {
                debug!(token = self.token.0, "Header receive timed out");
                self.reply_and_close(ctx.registry, http::BAD_REQUEST_400);
            }
            return;
        }

        let received = match self.recv_into_ring(ctx.now) {
            RecvOutcome::Data(n) => n,
            RecvOutcome::WouldBlock => return,
            RecvOutcome::Eof => {
                debug!(token = self.token.0, "Client went away mid-header");
                self.reply_and_close(ctx.registry, http::BAD_REQUEST_400);
                return;
            }
            RecvOutcome::BufferFull => {
                // The ring outsizes the header cap, so a full buffer without
                // a terminator is an oversize header.
                self.reply_and_close(ctx.registry, http::BAD_REQUEST_400);
                return;
            }
            RecvOutcome::Failed(e) => {
                debug!(token = self.token.0, error = %e, "Header recv failed");
                self.reply_and_close(ctx.registry, http::BAD_REQUEST_400);
                return;
            }
        };

        let used = self.ring.used();
        let status = self
            .detector
            .feed(&self.ring.read_slice()[used - received..]);
        match status {
            ScanStatus::Complete => self.state = ConnState::HeadersReceived,
            ScanStatus::Incomplete => {}
            ScanStatus::TooBig => {
                debug!(token = self.token.0, "Request header too big");
                self.reply_and_close(ctx.registry, http::BAD_REQUEST_400);
            }
        }
    }

    fn process_headers(&mut self, ctx: &mut TickContext<'_>) {
        let header_len = self.detector.header_end().unwrap_or(0);
        let first_line = self.detector.first_line_end().unwrap_or(0);

        let request =
            match http::parse_request(&self.ring.read_slice()[..header_len], first_line) {
                Ok(request) => request,
                Err(e) => {
                    debug!(token = self.token.0, error = %e, "Rejected request");
                    self.reply_and_close(ctx.registry, http::BAD_REQUEST_400);
                    return;
                }
            };

        // Everything before the body is consumed; for PUT the bytes after
        // the header stay in the ring as the start of the body.
        self.ring.advance_read(header_len);

        match request.method {
            Method::Get => {
                let handle = match ctx.cache.acquire_for_read(&request.target) {
                    Ok(handle) => handle,
                    Err(e) => {
                        debug!(token = self.token.0, target = %request.target, error = %e,
                               "GET target not available");
                        self.reply_and_close(ctx.registry, http::NOT_FOUND_404);
                        return;
                    }
                };
                self.file_size = handle.size;
                self.resource = Resource::Cached(handle);

                // The status line rides the ring ahead of the file bytes so
                // it shares the paced send path and always precedes the body.
                self.ring.clear();
                self.ring.write_slice()[..http::OK_200.len()].copy_from_slice(http::OK_200);
                self.ring.advance_write(http::OK_200.len());

                if let Err(e) =
                    ctx.registry
                        .reregister(&mut self.stream, self.token, Interest::WRITABLE)
                {
                    warn!(token = self.token.0, error = %e, "Reregister for write failed");
                    self.close_now(ctx.registry);
                    return;
                }
            }
            Method::Put => {
                let file = match ctx.cache.open_for_write(&request.target) {
                    Ok(file) => file,
                    Err(e) => {
                        debug!(token = self.token.0, target = %request.target, error = %e,
                               "PUT target not writable");
                        self.reply_and_close(ctx.registry, http::NOT_FOUND_404);
                        return;
                    }
                };
                self.file_size = request.content_length;
                self.resource = Resource::Owned(file);
            }
        }

        debug!(
            token = self.token.0,
            method = ?request.method,
            target = %request.target,
            size = self.file_size,
            "Request accepted"
        );
        self.request = Some(request);
        self.state = ConnState::HeadersProcessed;
    }

    fn transmission(&mut self, ctx: &mut TickContext<'_>) {
        self.state = ConnState::OnTransmission;
        let Some(method) = self.request.as_ref().map(|r| r.method) else {
            self.close_now(ctx.registry);
            return;
        };

        match method {
            Method::Get => {
                if self.writable {
                    if let Err(e) = self.send_from_ring(ctx) {
                        debug!(token = self.token.0, error = %e, "GET send failed");
                        self.close_now(ctx.registry);
                        return;
                    }
                } else if self.body_idle_expired(ctx) {
                    self.close_now(ctx.registry);
                    return;
                }
            }
            Method::Put => {
                if self.readable && !self.peer_eof {
                    match self.recv_into_ring(ctx.now) {
                        RecvOutcome::Data(_) | RecvOutcome::WouldBlock => {}
                        RecvOutcome::BufferFull => {
                            // Disk is behind the client; drain first.
                        }
                        RecvOutcome::Eof => {
                            self.peer_eof = true;
                            let received = self.file_offset + self.ring.used() as u64;
                            if received < self.file_size {
                                debug!(
                                    token = self.token.0,
                                    received,
                                    expected = self.file_size,
                                    "PUT body truncated by client"
                                );
                                self.close_now(ctx.registry);
                                return;
                            }
                        }
                        RecvOutcome::Failed(e) => {
                            debug!(token = self.token.0, error = %e, "PUT recv failed");
                            self.close_now(ctx.registry);
                            return;
                        }
                    }
                } else if self.body_idle_expired(ctx) {
                    self.close_now(ctx.registry);
                    return;
                }
            }
        }

        self.drive_io(ctx);
    }

    /// Body-phase idle cutoff; disabled unless configured.
    fn body_idle_expired(&self, ctx: &TickContext<'_>) -> bool {
        match ctx.body_timeout {
            Some(limit) if self.idle.expired(ctx.now, limit) => {
                debug!(token = self.token.0, "Transfer idle too long");
                true
            }
            _ => false,
        }
    }

    /// The queue side of the transmission sub-logic: build and submit at
    /// most one disk request, or finish the transfer.
    fn drive_io(&mut self, ctx: &mut TickContext<'_>) {
        if self.waiting_result {
            return;
        }

        let Some(method) = self.request.as_ref().map(|r| r.method) else {
            return;
        };

        if self.file_offset == self.file_size {
            // GET must also have drained the ring to the socket, or the tail
            // of the download would be cut off.
            let drained = match method {
                Method::Get => self.ring.used() == 0,
                Method::Put => true,
            };
            if drained {
                self.finalize(ctx, method);
            }
            return;
        }

        if self.pending.is_none() {
            let Some(fd) = self.resource.fd() else {
                self.close_now(ctx.registry);
                return;
            };
            let remaining = self.file_size - self.file_offset;
            let (kind, ptr, available) = match method {
                Method::Get => (IoKind::Read, self.ring.write_ptr(), self.ring.free()),
                Method::Put => (IoKind::Write, self.ring.read_ptr(), self.ring.used()),
            };
            let len = available.min(remaining.min(usize::MAX as u64) as usize);
            if len == 0 {
                // Ring full (GET) or empty (PUT); the socket side has to
                // move first.
                return;
            }
            self.pending = Some(IoRequest {
                token: self.token.0,
                fd,
                buf: BufPtr::new(ptr),
                len,
                offset: self.file_offset,
                kind,
            });
        }

        if let Some(request) = self.pending.take() {
            match ctx.queue.try_send(request) {
                Ok(()) => self.waiting_result = true,
                // Queue full; keep the prepared request for the next tick.
                Err(request) => self.pending = Some(request),
            }
        }
    }

    fn finalize(&mut self, ctx: &mut TickContext<'_>, method: Method) {
        if method == Method::Put {
            let _ = self.stream.write(http::CREATED_201);
        }
        debug!(
            token = self.token.0,
            bytes = self.file_offset,
            "Transfer complete"
        );
        self.close_now(ctx.registry);
    }

    /// Receive whatever fits into the free region of the ring.
    fn recv_into_ring(&mut self, now: Instant) -> RecvOutcome {
        if self.ring.free() == 0 {
            return RecvOutcome::BufferFull;
        }
        match self.stream.read(self.ring.write_slice()) {
            Ok(0) => RecvOutcome::Eof,
            Ok(n) => {
                self.ring.advance_write(n);
                self.idle.touch(now);
                RecvOutcome::Data(n)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.readable = false;
                RecvOutcome::WouldBlock
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => RecvOutcome::Data(0),
            Err(e) => RecvOutcome::Failed(e),
        }
    }

    /// Send from the used region of the ring, within the rate window.
    fn send_from_ring(&mut self, ctx: &mut TickContext<'_>) -> io::Result<()> {
        let want = self.ring.used();
        let Some(budget) = self.rate.budget(ctx.now, want, ctx.send_rate) else {
            // Nothing to send or quota exhausted; retry on a later tick.
            return Ok(());
        };

        match self.stream.write(&self.ring.read_slice()[..budget]) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "send returned zero",
            )),
            Ok(n) => {
                self.ring.advance_read(n);
                self.rate.record(n);
                self.idle.touch(ctx.now);
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.writable = false;
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Best-effort status reply, then close.
    fn reply_and_close(&mut self, registry: &Registry, response: &[u8]) {
        let _ = self.stream.write(response);
        self.close_now(registry);
    }

    /// Shut the socket and leave the live states for CLOSED. File-side
    /// resources are released by the sweep once no disk result is owed.
    fn close_now(&mut self, registry: &Registry) {
        let _ = self.stream.shutdown(Shutdown::Both);
        let _ = registry.deregister(&mut self.stream);
        self.readable = false;
        self.writable = false;
        self.state = ConnState::Closed;
    }

    #[cfg(test)]
    pub fn force_readiness(&mut self, readable: bool, writable: bool) {
        self.readable = readable;
        self.writable = writable;
    }

    #[cfg(test)]
    pub fn waiting_result(&self) -> bool {
        self.waiting_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ring::page_shift;
    use std::io::Write as _;
    use std::sync::Arc;

    struct Rig {
        poll: mio::Poll,
        cache: FileCache,
        queue: Arc<RequestQueue>,
        root: tempfile::TempDir,
        client: std::net::TcpStream,
        conn: Connection,
    }

    fn rig() -> Rig {
        let root = tempfile::tempdir().unwrap();
        let cache = FileCache::new(root.path().to_path_buf());
        let queue = Arc::new(RequestQueue::new(16));
        let poll = mio::Poll::new().unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let ring = RingBuffer::with_order(page_shift()).unwrap();
        let mut conn = Connection::new(
            TcpStream::from_std(accepted),
            Token(3),
            ring,
            Instant::now(),
        );
        conn.register(poll.registry()).unwrap();

        Rig {
            poll,
            cache,
            queue,
            root,
            client,
            conn,
        }
    }

    fn tick(rig: &mut Rig) {
        let mut ctx = TickContext {
            registry: rig.poll.registry(),
            cache: &mut rig.cache,
            queue: rig.queue.as_ref(),
            send_rate: 1 << 30,
            body_timeout: None,
            now: Instant::now(),
        };
        rig.conn.handle(&mut ctx);
    }

    fn tick_until<F: Fn(&Connection) -> bool>(rig: &mut Rig, pred: F) {
        for _ in 0..200 {
            rig.conn.force_readiness(true, true);
            tick(rig);
            if pred(&rig.conn) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("connection never reached expected state");
    }

    #[test]
    fn test_starts_in_init() {
        let rig = rig();
        assert_eq!(rig.conn.state(), ConnState::Init);
    }

    #[test]
    fn test_get_pipeline_end_to_end() {
        let mut rig = rig();
        std::fs::write(rig.root.path().join("hello.txt"), b"Hello, world!").unwrap();

        rig.client
            .write_all(b"GET /hello.txt HTTP/1.0\r\n\r\n")
            .unwrap();

        // Header parse, open, and the first disk request.
        tick_until(&mut rig, |c| c.waiting_result());
        assert_eq!(rig.conn.state(), ConnState::OnTransmission);
        assert_eq!(rig.cache.len(), 1);

        // Play the worker: fill the requested span and complete the record.
        let request = rig.queue.recv().unwrap();
        assert_eq!(request.kind, IoKind::Read);
        assert_eq!(request.len, 13);
        assert_eq!(request.offset, 0);
        unsafe {
            std::ptr::copy_nonoverlapping(
                b"Hello, world!".as_ptr(),
                request.buf.as_mut_ptr(),
                13,
            );
        }
        rig.conn.apply_result(rig.poll.registry(), 13);

        // Status line and body flush to the socket, then the close.
        tick_until(&mut rig, |c| c.state() == ConnState::Closed);

        use std::io::Read as _;
        let mut response = Vec::new();
        rig.client.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\nHello, world!");
    }

    #[test]
    fn test_get_missing_file_gets_404() {
        let mut rig = rig();
        rig.client
            .write_all(b"GET /nothing HTTP/1.0\r\n\r\n")
            .unwrap();

        tick_until(&mut rig, |c| c.state() == ConnState::Closed);

        use std::io::Read as _;
        let mut response = Vec::new();
        rig.client.read_to_end(&mut response).unwrap();
        assert_eq!(response, http::NOT_FOUND_404);
        assert!(rig.cache.is_empty());
    }

    #[test]
    fn test_unknown_method_gets_400() {
        let mut rig = rig();
        rig.client.write_all(b"DELETE /x HTTP/1.0\r\n\r\n").unwrap();

        tick_until(&mut rig, |c| c.state() == ConnState::Closed);

        use std::io::Read as _;
        let mut response = Vec::new();
        rig.client.read_to_end(&mut response).unwrap();
        assert_eq!(response, http::BAD_REQUEST_400);
    }

    #[test]
    fn test_put_pipeline_end_to_end() {
        let mut rig = rig();
        rig.client
            .write_all(b"PUT /up.bin HTTP/1.0\r\nContent-Length: 5\r\n\r\nABCDE")
            .unwrap();

        tick_until(&mut rig, |c| c.waiting_result());
        assert_eq!(rig.conn.state(), ConnState::OnTransmission);

        let request = rig.queue.recv().unwrap();
        assert_eq!(request.kind, IoKind::Write);
        assert_eq!(request.len, 5);
        let span =
            unsafe { std::slice::from_raw_parts(request.buf.as_mut_ptr(), request.len) };
        assert_eq!(span, b"ABCDE");

        // Play the worker writing to disk.
        let written = unsafe {
            libc::pwrite(request.fd, request.buf.as_mut_ptr().cast(), request.len, 0)
        };
        assert_eq!(written, 5);
        rig.conn.apply_result(rig.poll.registry(), 5);

        tick_until(&mut rig, |c| c.state() == ConnState::Closed);

        use std::io::Read as _;
        let mut response = Vec::new();
        rig.client.read_to_end(&mut response).unwrap();
        assert_eq!(response, http::CREATED_201);
        assert_eq!(
            std::fs::read(rig.root.path().join("up.bin")).unwrap(),
            b"ABCDE"
        );
    }

    #[test]
    fn test_put_zero_length_creates_empty_file() {
        let mut rig = rig();
        rig.client
            .write_all(b"PUT /empty HTTP/1.0\r\nContent-Length: 0\r\n\r\n")
            .unwrap();

        tick_until(&mut rig, |c| c.state() == ConnState::Closed);

        use std::io::Read as _;
        let mut response = Vec::new();
        rig.client.read_to_end(&mut response).unwrap();
        assert_eq!(response, http::CREATED_201);
        assert_eq!(
            std::fs::read(rig.root.path().join("empty")).unwrap().len(),
            0
        );
    }

    #[test]
    fn test_truncated_put_parks_until_result_arrives() {
        let mut rig = rig();
        rig.client
            .write_all(b"PUT /part HTTP/1.0\r\nContent-Length: 100\r\n\r\nABCDEFGHIJ")
            .unwrap();

        // Ten body bytes arrive and go out to the worker.
        tick_until(&mut rig, |c| c.waiting_result());
        let request = rig.queue.recv().unwrap();
        assert_eq!(request.kind, IoKind::Write);
        assert_eq!(request.len, 10);

        // The client gives up mid-body. The connection must close, but with
        // the worker still holding a request it cannot be reclaimed yet.
        rig.client.shutdown(Shutdown::Write).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        for _ in 0..50 {
            rig.conn.force_readiness(true, false);
            tick(&mut rig);
            if rig.conn.state() == ConnState::Closed {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert_eq!(rig.conn.state(), ConnState::Closed);
        assert!(rig.conn.waiting_result());
        assert!(!rig.conn.is_reclaimable());

        // The late result frees the connection for the sweep.
        rig.conn.apply_result(rig.poll.registry(), 10);
        assert!(rig.conn.is_reclaimable());

        rig.conn.release_resources(&mut rig.cache);
        assert_eq!(rig.conn.state(), ConnState::Cleanup);
    }
}
