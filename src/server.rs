//! Server assembly and lifecycle.
//!
//! Wires the pieces together in dependency order: signal handlers, the
//! listen socket, the request queue and result channel, the disk worker
//! pool, and finally the event loop. Shutdown reverses it: the loop exits
//! on SIGTERM, the queue closes, and the workers drain and join.

use crate::config::Config;
use crate::runtime::event_loop::EventLoop;
use crate::runtime::queue::{result_channel, RequestQueue};
use crate::runtime::ring::page_shift;
use crate::runtime::worker::WorkerPool;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

/// Raised by SIGTERM; the event loop drains and exits cleanly.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);
/// Raised by SIGUSR1; the event loop re-reads the reload file.
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown(_: libc::c_int) {
    SHUTDOWN.store(true, std::sync::atomic::Ordering::Release);
}

extern "C" fn handle_reload(_: libc::c_int) {
    RELOAD.store(true, std::sync::atomic::Ordering::Release);
}

/// SIGTERM and SIGUSR1 set flags the loop polls once per iteration;
/// SIGUSR2 and SIGPIPE would otherwise kill the process and are ignored.
fn setup_signal_handlers() -> io::Result<()> {
    unsafe {
        if libc::signal(libc::SIGTERM, handle_shutdown as libc::sighandler_t) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
        if libc::signal(libc::SIGUSR1, handle_reload as libc::sighandler_t) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
        if libc::signal(libc::SIGUSR2, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create the non-blocking listen socket on all interfaces.
pub(crate) fn bind_listener(port: u16) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Server instance
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Server { config }
    }

    /// Start everything and run the event loop until SIGTERM.
    pub fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let root_meta = std::fs::metadata(&self.config.root_path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("root path '{}': {e}", self.config.root_path.display()),
            )
        })?;
        if !root_meta.is_dir() {
            return Err(Box::new(io::Error::new(
                io::ErrorKind::InvalidInput,
                "root path is not a directory",
            )));
        }
        if self.config.buffer_order < page_shift() {
            return Err(Box::new(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "buffer_order {} below the page shift {}",
                    self.config.buffer_order,
                    page_shift()
                ),
            )));
        }

        setup_signal_handlers()?;

        let listener = bind_listener(self.config.port)?;
        let queue = Arc::new(RequestQueue::new(self.config.queue_depth));
        let (result_tx, result_rx) = result_channel()?;
        let pool = WorkerPool::spawn(
            self.config.io_threads,
            Arc::clone(&queue),
            &result_tx,
            self.config.chunk_size,
        )?;

        info!(
            port = self.config.port,
            root = %self.config.root_path.display(),
            send_rate = self.config.send_rate,
            workers = self.config.io_threads,
            "Server listening"
        );

        let mut event_loop = EventLoop::new(
            &self.config,
            listener,
            Arc::clone(&queue),
            result_rx,
            &SHUTDOWN,
            &RELOAD,
        )?;
        let result = event_loop.run();

        info!("Draining disk workers");
        pool.shutdown();

        result?;
        Ok(())
    }
}
