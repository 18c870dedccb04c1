//! Double-mapped ring buffer.
//!
//! The backing pages are mapped twice, back to back, so the used and free
//! regions are always one contiguous span no matter where the cursors sit.
//! A `recv` or `pread` of `free()` bytes (or a `send`/`pwrite` of `used()`
//! bytes) never has to be split at the wrap point.
//!
//! Offsets grow monotonically modulo twice the capacity. Whenever the read
//! offset passes the capacity, both offsets are pulled back by one capacity;
//! raw pointers handed out before the normalisation stay valid because both
//! mappings alias the same pages.
//!
//! Sharing contract: the event loop owns the buffer. While a disk request is
//! outstanding (`is_waiting_result` on the connection), the worker owns the
//! span named in the request and the loop must not touch it — the loop may
//! still operate on the opposite region, which is disjoint by construction.

use std::io;
use std::os::unix::ffi::OsStringExt;
use std::slice;

/// Smallest legal buffer order: log2 of the system page size.
pub fn page_shift() -> u32 {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    (page as usize).trailing_zeros()
}

/// Fixed-capacity byte ring with always-contiguous read/write views.
pub struct RingBuffer {
    base: *mut u8,
    capacity: usize,
    write_off: usize,
    read_off: usize,
}

// The buffer is only ever driven from the event-loop thread; workers receive
// raw pointers into it under the sharing contract above. Moving the owner
// between threads is safe.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Create a buffer of `2^order` bytes. `order` must be at least
    /// [`page_shift`] so the capacity is page-aligned.
    pub fn with_order(order: u32) -> io::Result<RingBuffer> {
        if order < page_shift() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer order {order} below page shift {}", page_shift()),
            ));
        }
        if order >= usize::BITS - 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer order too large",
            ));
        }
        let capacity = 1usize << order;

        // Anonymous backing file: created, unlinked, truncated to capacity.
        let mut template = std::env::temp_dir()
            .join("ferryd-ring-XXXXXX")
            .into_os_string()
            .into_vec();
        template.push(0);

        let fd = unsafe { libc::mkstemp(template.as_mut_ptr().cast()) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let result = Self::map_backing(fd, &template, capacity);
        unsafe { libc::close(fd) };
        result.map(|base| RingBuffer {
            base,
            capacity,
            write_off: 0,
            read_off: 0,
        })
    }

    fn map_backing(fd: i32, template: &[u8], capacity: usize) -> io::Result<*mut u8> {
        if unsafe { libc::unlink(template.as_ptr().cast()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::ftruncate(fd, capacity as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        // Reserve both halves, then pin the file over each half.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity << 1,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        for half in 0..2 {
            let want = unsafe { base.cast::<u8>().add(half * capacity) };
            let got = unsafe {
                libc::mmap(
                    want.cast(),
                    capacity,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_FIXED | libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            if got != want.cast() {
                let err = io::Error::last_os_error();
                unsafe { libc::munmap(base, capacity << 1) };
                return Err(err);
            }
        }

        Ok(base.cast())
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently stored.
    pub fn used(&self) -> usize {
        self.write_off - self.read_off
    }

    /// Bytes of remaining space.
    pub fn free(&self) -> usize {
        self.capacity - self.used()
    }

    /// Contiguous view of the free region, `free()` bytes long.
    pub fn write_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.base.add(self.write_off), self.free()) }
    }

    /// Contiguous view of the used region, `used()` bytes long.
    pub fn read_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base.add(self.read_off), self.used()) }
    }

    /// Raw cursor into the free region, for handing to an I/O worker.
    pub fn write_ptr(&mut self) -> *mut u8 {
        unsafe { self.base.add(self.write_off) }
    }

    /// Raw cursor into the used region, for handing to an I/O worker.
    pub fn read_ptr(&mut self) -> *mut u8 {
        unsafe { self.base.add(self.read_off) }
    }

    /// Commit `n` bytes written at the write cursor. `n` must not exceed
    /// `free()`.
    pub fn advance_write(&mut self, n: usize) {
        assert!(n <= self.free(), "advance_write past free space");
        self.write_off += n;
    }

    /// Consume `n` bytes at the read cursor. `n` must not exceed `used()`.
    pub fn advance_read(&mut self, n: usize) {
        assert!(n <= self.used(), "advance_read past used bytes");
        self.read_off += n;
        if self.read_off >= self.capacity {
            self.read_off -= self.capacity;
            self.write_off -= self.capacity;
        }
    }

    /// Drop all stored bytes and reset both cursors.
    pub fn clear(&mut self) {
        self.write_off = 0;
        self.read_off = 0;
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.capacity << 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_sub_page_order() {
        assert!(RingBuffer::with_order(page_shift() - 1).is_err());
    }

    #[test]
    fn test_empty_invariants() {
        let ring = RingBuffer::with_order(page_shift()).unwrap();
        assert_eq!(ring.used(), 0);
        assert_eq!(ring.free(), ring.capacity());
    }

    #[test]
    fn test_write_then_read() {
        let mut ring = RingBuffer::with_order(page_shift()).unwrap();
        ring.write_slice()[..5].copy_from_slice(b"hello");
        ring.advance_write(5);

        assert_eq!(ring.used(), 5);
        assert_eq!(ring.free(), ring.capacity() - 5);
        assert_eq!(&ring.read_slice()[..5], b"hello");

        ring.advance_read(5);
        assert_eq!(ring.used(), 0);
    }

    #[test]
    fn test_contiguous_across_wrap() {
        let mut ring = RingBuffer::with_order(page_shift()).unwrap();
        let cap = ring.capacity();
        let chunk = cap * 3 / 4;

        // Push the cursors past the midpoint, then write a span that
        // straddles the physical end of the backing pages.
        ring.advance_write(chunk);
        ring.advance_read(chunk);

        let pattern: Vec<u8> = (0..chunk).map(|i| (i % 251) as u8).collect();
        assert!(ring.free() >= chunk);
        ring.write_slice()[..chunk].copy_from_slice(&pattern);
        ring.advance_write(chunk);

        assert_eq!(ring.read_slice(), &pattern[..]);
        ring.advance_read(chunk);
        assert_eq!(ring.used(), 0);
        assert_eq!(ring.used() + ring.free(), cap);
    }

    #[test]
    fn test_offsets_normalise() {
        let mut ring = RingBuffer::with_order(page_shift()).unwrap();
        let cap = ring.capacity();

        // Cycle more than 2*capacity bytes through the ring; accounting
        // must stay exact the whole way.
        for round in 0..5 {
            let n = cap / 2 + round;
            ring.write_slice()[..n].fill(round as u8);
            ring.advance_write(n);
            assert_eq!(ring.used(), n);
            assert!(ring.read_slice().iter().all(|&b| b == round as u8));
            ring.advance_read(n);
            assert_eq!(ring.used(), 0);
        }
    }

    #[test]
    fn test_clear() {
        let mut ring = RingBuffer::with_order(page_shift()).unwrap();
        ring.advance_write(100);
        ring.advance_read(10);
        ring.clear();
        assert_eq!(ring.used(), 0);
        assert_eq!(ring.free(), ring.capacity());
    }

    #[test]
    #[should_panic(expected = "advance_read past used bytes")]
    fn test_advance_read_guard() {
        let mut ring = RingBuffer::with_order(page_shift()).unwrap();
        ring.advance_read(1);
    }
}
