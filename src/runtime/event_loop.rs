//! The event loop: one thread owning all socket I/O.
//!
//! Readiness-based model: the poller watches the listen socket, every client
//! socket, and the read side of the worker result channel. Each iteration
//! accepts new clients, drains completion records, steps every connection's
//! state machine, and reclaims the ones that finished.
//!
//! The poll timeout is zero whenever any connection is live: connections
//! make progress through their ring buffers and the request queue even when
//! their socket reports nothing, so they must be stepped every iteration.
//! With no connections the loop parks in the poller until a socket or a
//! signal wakes it.

use crate::config::{Config, ReloadFile, RELOAD_FILE};
use crate::filecache::FileCache;
use crate::runtime::connection::{Connection, TickContext};
use crate::runtime::queue::{RequestQueue, ResultReceiver};
use crate::runtime::ring::RingBuffer;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const RESULTS_TOKEN: Token = Token(usize::MAX - 1);

/// The single-threaded server core.
pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    results: ResultReceiver,
    queue: Arc<RequestQueue>,
    conns: Slab<Connection>,
    cache: FileCache,
    send_rate: u64,
    buffer_order: u32,
    max_connections: usize,
    body_timeout: Option<Duration>,
    accept_ready: bool,
    shutdown: &'static AtomicBool,
    reload: &'static AtomicBool,
}

impl EventLoop {
    pub fn new(
        config: &Config,
        listener: std::net::TcpListener,
        queue: Arc<RequestQueue>,
        mut results: ResultReceiver,
        shutdown: &'static AtomicBool,
        reload: &'static AtomicBool,
    ) -> io::Result<EventLoop> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(listener);

        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(results.source(), RESULTS_TOKEN, Interest::READABLE)?;

        Ok(EventLoop {
            poll,
            listener,
            results,
            queue,
            conns: Slab::with_capacity(config.max_connections),
            cache: FileCache::new(config.root_path.clone()),
            send_rate: config.send_rate,
            buffer_order: config.buffer_order,
            max_connections: config.max_connections,
            body_timeout: config.body_timeout,
            accept_ready: false,
            shutdown,
            reload,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until the shutdown flag is raised.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        info!("Event loop running");

        while !self.shutdown.load(Ordering::Acquire) {
            if self.reload.swap(false, Ordering::AcqRel) {
                self.reload_config();
            }

            // Live connections need stepping regardless of socket readiness.
            let timeout = if self.conns.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready = true,
                    RESULTS_TOKEN => {}
                    Token(id) => {
                        if let Some(conn) = self.conns.get_mut(id) {
                            conn.on_event(event);
                        }
                    }
                }
            }

            self.accept_burst();
            self.drain_results();
            self.step_connections();
            self.sweep();
        }

        info!("Event loop stopped");
        Ok(())
    }

    /// Accept everything the backlog holds. Readiness is edge-style, so the
    /// flag only clears once accept reports `WouldBlock`.
    fn accept_burst(&mut self) {
        if !self.accept_ready {
            return;
        }
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.conns.len() >= self.max_connections {
                        warn!(peer = %peer, "Connection limit reached, rejecting");
                        continue;
                    }
                    let ring = match RingBuffer::with_order(self.buffer_order) {
                        Ok(ring) => ring,
                        Err(e) => {
                            error!(error = %e, "Ring buffer allocation failed");
                            continue;
                        }
                    };

                    let entry = self.conns.vacant_entry();
                    let token = Token(entry.key());
                    let mut conn = Connection::new(stream, token, ring, Instant::now());
                    match conn.register(self.poll.registry()) {
                        Ok(()) => {
                            debug!(token = token.0, peer = %peer, "Accepted connection");
                            entry.insert(conn);
                        }
                        Err(e) => warn!(error = %e, "Failed to register connection"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.accept_ready = false;
                    break;
                }
                Err(e) => match e.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        // Out of descriptors; leave the flag up and retry
                        // once something closes.
                        warn!("Descriptor limit hit on accept");
                        break;
                    }
                    _ => {
                        error!(error = %e, "Accept failed");
                        break;
                    }
                },
            }
        }
    }

    /// Pull every queued completion record and credit the owning connection.
    fn drain_results(&mut self) {
        loop {
            match self.results.try_recv() {
                Ok(Some(result)) => match self.conns.get_mut(result.token) {
                    Some(conn) => conn.apply_result(self.poll.registry(), result.bytes),
                    None => warn!(token = result.token, "Result for unknown connection"),
                },
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Result channel read failed");
                    break;
                }
            }
        }
    }

    /// Run every connection's per-tick handler.
    fn step_connections(&mut self) {
        let now = Instant::now();
        let Self {
            poll,
            conns,
            cache,
            queue,
            send_rate,
            body_timeout,
            ..
        } = self;

        let mut ctx = TickContext {
            registry: poll.registry(),
            cache,
            queue: &**queue,
            send_rate: *send_rate,
            body_timeout: *body_timeout,
            now,
        };

        for (_, conn) in conns.iter_mut() {
            conn.handle(&mut ctx);
        }
    }

    /// Reclaim connections that closed and owe the workers nothing.
    fn sweep(&mut self) {
        let reclaimable: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.is_reclaimable())
            .map(|(key, _)| key)
            .collect();

        for key in reclaimable {
            let mut conn = self.conns.remove(key);
            conn.release_resources(&mut self.cache);
            debug!(
                token = key,
                cached_files = self.cache.len(),
                "Connection reclaimed"
            );
        }
    }

    /// SIGUSR1: re-read the reload file, rebind, swap the listen socket.
    /// Anything invalid leaves the current settings untouched.
    fn reload_config(&mut self) {
        let Some(reload) = ReloadFile::load(Path::new(RELOAD_FILE)) else {
            warn!(file = RELOAD_FILE, "Ignoring unreadable reload file");
            return;
        };
        if !reload.root_accessible() {
            warn!(root = %reload.root_path.display(), "New root not accessible, keeping settings");
            return;
        }

        let std_listener = match crate::server::bind_listener(reload.port) {
            Ok(listener) => listener,
            Err(e) => {
                warn!(port = reload.port, error = %e, "Rebind failed, keeping old listener");
                return;
            }
        };

        let mut new_listener = TcpListener::from_std(std_listener);
        let _ = self.poll.registry().deregister(&mut self.listener);
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut new_listener, LISTENER_TOKEN, Interest::READABLE)
        {
            error!(error = %e, "Could not register rebound listener");
            return;
        }

        self.listener = new_listener;
        self.cache.set_root(reload.root_path.clone());
        self.send_rate = reload.send_rate;
        self.accept_ready = false;
        info!(
            root = %reload.root_path.display(),
            port = reload.port,
            send_rate = reload.send_rate,
            "Configuration reloaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::queue::result_channel;
    use crate::runtime::ring::page_shift;
    use crate::runtime::worker::WorkerPool;
    use crate::server::bind_listener;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    struct TestServer {
        addr: SocketAddr,
        root: std::path::PathBuf,
        _root_dir: tempfile::TempDir,
        shutdown: &'static AtomicBool,
        pool: Option<WorkerPool>,
        handle: Option<thread::JoinHandle<io::Result<()>>>,
    }

    fn start_server(send_rate: u64) -> TestServer {
        let root_dir = tempfile::tempdir().unwrap();
        let config = Config {
            root_path: root_dir.path().to_path_buf(),
            port: 0,
            send_rate,
            io_threads: 2,
            buffer_order: page_shift(),
            chunk_size: 8192,
            queue_depth: 64,
            max_connections: 64,
            body_timeout: None,
            log_level: "info".to_string(),
        };

        let listener = bind_listener(0).unwrap();
        let queue = Arc::new(RequestQueue::new(config.queue_depth));
        let (result_tx, result_rx) = result_channel().unwrap();
        let pool =
            WorkerPool::spawn(config.io_threads, Arc::clone(&queue), &result_tx, config.chunk_size)
                .unwrap();

        let shutdown: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));
        let reload: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));

        let mut event_loop =
            EventLoop::new(&config, listener, queue, result_rx, shutdown, reload).unwrap();
        let port = event_loop.local_addr().unwrap().port();

        let handle = thread::spawn(move || event_loop.run());

        TestServer {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            root: root_dir.path().to_path_buf(),
            _root_dir: root_dir,
            shutdown,
            pool: Some(pool),
            handle: Some(handle),
        }
    }

    impl TestServer {
        fn write_file(&self, name: &str, content: &[u8]) {
            std::fs::write(self.root.join(name), content).unwrap();
        }

        fn connect(&self) -> TcpStream {
            let stream = TcpStream::connect(self.addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            stream
        }

        fn request(&self, bytes: &[u8]) -> Vec<u8> {
            let mut stream = self.connect();
            stream.write_all(bytes).unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).unwrap();
            response
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.shutdown.store(true, Ordering::Release);
            // A throwaway connection wakes the parked poller.
            let _ = TcpStream::connect(self.addr);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            if let Some(pool) = self.pool.take() {
                pool.shutdown();
            }
        }
    }

    #[test]
    fn test_get_serves_file_behind_status_line() {
        let server = start_server(1 << 30);
        server.write_file("hello.txt", b"Hello, world!");

        let response = server.request(b"GET /hello.txt HTTP/1.0\r\n\r\n");
        assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\nHello, world!");
    }

    #[test]
    fn test_get_missing_file_is_404() {
        let server = start_server(1 << 30);

        let response = server.request(b"GET /missing HTTP/1.0\r\n\r\n");
        assert_eq!(response, b"HTTP/1.0 404 NOT FOUND\r\n\r\n");
    }

    #[test]
    fn test_unknown_method_is_400() {
        let server = start_server(1 << 30);

        let response = server.request(b"DELETE /x HTTP/1.0\r\n\r\n");
        assert_eq!(response, b"HTTP/1.0 400 BAD REQUEST\r\n\r\n");
    }

    #[test]
    fn test_put_stores_body_and_replies_201() {
        let server = start_server(1 << 30);

        // Body delivered in two pieces to exercise the incremental path.
        let mut stream = server.connect();
        stream
            .write_all(b"PUT /upload.bin HTTP/1.0\r\nContent-Length: 5\r\n\r\nAB")
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        stream.write_all(b"CDE").unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"HTTP/1.0 201 CREATED\r\n\r\n");
        assert_eq!(
            std::fs::read(server.root.join("upload.bin")).unwrap(),
            b"ABCDE"
        );
    }

    #[test]
    fn test_put_zero_length_creates_empty_file() {
        let server = start_server(1 << 30);

        let response = server.request(b"PUT /empty HTTP/1.0\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(response, b"HTTP/1.0 201 CREATED\r\n\r\n");
        assert_eq!(std::fs::read(server.root.join("empty")).unwrap(), b"");
    }

    #[test]
    fn test_put_then_get_round_trip() {
        let server = start_server(1 << 30);
        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();

        let mut upload = b"PUT /blob HTTP/1.0\r\nContent-Length: 2048\r\n\r\n".to_vec();
        upload.extend_from_slice(&payload);
        assert_eq!(server.request(&upload), b"HTTP/1.0 201 CREATED\r\n\r\n");

        let response = server.request(b"GET /blob HTTP/1.0\r\n\r\n");
        let mut expected = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
        expected.extend_from_slice(&payload);
        assert_eq!(response, expected);
    }

    #[test]
    fn test_oversize_header_is_400() {
        let server = start_server(1 << 30);

        let mut request = b"GET /".to_vec();
        request.resize(8100, b'a');
        let response = server.request(&request);
        assert_eq!(response, b"HTTP/1.0 400 BAD REQUEST\r\n\r\n");
    }

    #[test]
    fn test_concurrent_gets_of_one_file() {
        let server = start_server(1 << 30);
        let payload: Vec<u8> = (0..8192u32).map(|i| (i * 7 % 256) as u8).collect();
        server.write_file("same", &payload);

        let addr = server.addr;
        let expected = {
            let mut v = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
            v.extend_from_slice(&payload);
            v
        };

        let clients: Vec<_> = (0..4)
            .map(|_| {
                let expected = expected.clone();
                thread::spawn(move || {
                    let mut stream = TcpStream::connect(addr).unwrap();
                    stream
                        .set_read_timeout(Some(Duration::from_secs(10)))
                        .unwrap();
                    stream.write_all(b"GET /same HTTP/1.0\r\n\r\n").unwrap();
                    let mut response = Vec::new();
                    stream.read_to_end(&mut response).unwrap();
                    assert_eq!(response, expected);
                })
            })
            .collect();

        for client in clients {
            client.join().unwrap();
        }
    }

    #[test]
    fn test_send_rate_stretches_transfer() {
        let server = start_server(1000);
        let payload = vec![42u8; 3000];
        server.write_file("big", &payload);

        let started = Instant::now();
        let response = server.request(b"GET /big HTTP/1.0\r\n\r\n");
        let elapsed = started.elapsed();

        let mut expected = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
        expected.extend_from_slice(&payload);
        assert_eq!(response, expected);

        // 3019 bytes at 1000 B/s span at least four one-second windows, so
        // the transfer cannot complete in under ~3 seconds.
        assert!(
            elapsed >= Duration::from_millis(2500),
            "transfer finished too fast: {elapsed:?}"
        );
    }
}
