//! Aligned direct-I/O reader over Linux AIO
//!
//! Graph search over compressed codes is I/O-bound: every hop fetches a few
//! small neighbor/code pages. The reader opens the data file with
//! `O_DIRECT` and submits each caller's batch of 512-aligned reads as raw
//! `io_submit` control blocks, draining completions from the same context
//! before returning, so a batch costs one syscall pair instead of one
//! syscall per page.
//!
//! Every worker thread registers once and gets its own kernel AIO context;
//! after that its reads never touch the registry lock. The registry itself
//! (thread-id → context) is the only shared-mutable state and sits behind a
//! single mutex.
//!
//! Alignment of buffer, offset and length to 512 bytes is a precondition of
//! `O_DIRECT`; [`AlignedRead::new`] rejects violations up front and
//! [`AlignedBuf`] exists so callers can actually allocate conforming
//! buffers.

use std::alloc::Layout;
use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use thiserror::Error;

/// Kernel slots reserved per context; also the largest single submission.
pub const MAX_EVENTS: usize = 1024;

/// Required alignment of buffers, offsets and lengths.
pub const SECTOR_LEN: usize = 512;

/// Partial submits/drains tolerated before a read fails fatally.
const MAX_IO_ATTEMPTS: usize = 10;

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;

/// Kernel ABI of `struct iocb` (linux/aio_abi.h, little-endian layout).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct Iocb {
    aio_data: u64,
    aio_key: u32,
    aio_rw_flags: i32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

/// Kernel ABI of `struct io_event`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("{what} is not 512-byte aligned (value {value})")]
    Unaligned { what: &'static str, value: u64 },

    #[error("{}: open(O_DIRECT) failed: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("io_setup failed: {source}")]
    Setup {
        #[source]
        source: io::Error,
    },

    #[error(
        "io_setup returned EAGAIN: kernel AIO slots exhausted; \
         consider raising /proc/sys/fs/aio-max-nr"
    )]
    AioSlotsExhausted,

    #[error("bad worker: calling thread has no registered I/O context")]
    BadWorker,

    #[error("{}: io_submit failed: {source}", path.display())]
    Submit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: io_getevents failed: {source}", path.display())]
    Drain {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{op} still incomplete after {attempts} attempts")]
    RetriesExhausted { op: &'static str, attempts: usize },

    #[error("{}: read at offset {offset} failed: {source}", path.display())]
    Completion {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error(
        "{}: short read at offset {offset}: expected {expected} bytes, got {got}",
        path.display()
    )]
    ShortRead {
        path: PathBuf,
        offset: u64,
        expected: usize,
        got: usize,
    },

    #[error("reader already closed")]
    Closed,
}

/// One aligned pread: destination buffer and file offset, all 512-aligned.
pub struct AlignedRead<'a> {
    offset: u64,
    buf: &'a mut [u8],
}

impl<'a> AlignedRead<'a> {
    pub fn new(offset: u64, buf: &'a mut [u8]) -> Result<Self, ReaderError> {
        if offset % SECTOR_LEN as u64 != 0 {
            return Err(ReaderError::Unaligned {
                what: "offset",
                value: offset,
            });
        }
        if buf.is_empty() || buf.len() % SECTOR_LEN != 0 {
            return Err(ReaderError::Unaligned {
                what: "length",
                value: buf.len() as u64,
            });
        }
        if buf.as_ptr() as u64 % SECTOR_LEN as u64 != 0 {
            return Err(ReaderError::Unaligned {
                what: "buffer",
                value: buf.as_ptr() as u64,
            });
        }
        Ok(Self { offset, buf })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn buf(&self) -> &[u8] {
        self.buf
    }
}

/// Heap allocation aligned to 512 bytes, suitable for `O_DIRECT` reads.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes. `len` must be a positive multiple of 512.
    pub fn zeroed(len: usize) -> Self {
        assert!(
            len > 0 && len % SECTOR_LEN == 0,
            "AlignedBuf length must be a positive multiple of {}",
            SECTOR_LEN
        );
        let layout = Layout::from_size_align(len, SECTOR_LEN).expect("valid layout");
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { ptr, len }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, SECTOR_LEN).expect("valid layout");
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

unsafe impl Send for AlignedBuf {}

/// Non-owning handle to a worker's AIO context. Obtained from
/// [`AlignedFileReader::register_worker`] (or looked up via
/// [`AlignedFileReader::ctx`]) and presented on every read.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext(AioContext);

/// `O_DIRECT` file handle plus the registry of per-worker AIO contexts.
///
/// The reader owns the descriptor and every context; workers hold
/// non-owning [`WorkerContext`] handles. [`Self::close`] is the supported
/// shutdown path — dropping an open reader force-destroys whatever is left
/// and complains.
pub struct AlignedFileReader {
    fd: libc::c_int,
    path: PathBuf,
    contexts: Mutex<HashMap<ThreadId, AioContext>>,
    closed: AtomicBool,
}

impl AlignedFileReader {
    /// Open `path` with `O_DIRECT | O_RDONLY | O_LARGEFILE`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ReaderError> {
        let path = path.as_ref().to_path_buf();
        let cpath = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            ReaderError::Open {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"),
            }
        })?;
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_DIRECT | libc::O_RDONLY | libc::O_LARGEFILE,
            )
        };
        if fd < 0 {
            return Err(ReaderError::Open {
                path,
                source: io::Error::last_os_error(),
            });
        }
        tracing::info!(path = %path.display(), fd, "opened file for direct I/O");
        Ok(Self {
            fd,
            path,
            contexts: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Set up an AIO context for the calling thread.
    ///
    /// Registering twice from the same thread warns and returns the
    /// existing context.
    pub fn register_worker(&self) -> Result<WorkerContext, ReaderError> {
        let tid = thread::current().id();
        let mut contexts = self.contexts.lock();
        if let Some(&ctx) = contexts.get(&tid) {
            tracing::warn!(?tid, "multiple register_worker calls from the same thread");
            return Ok(WorkerContext(ctx));
        }

        let mut ctx: AioContext = 0;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                MAX_EVENTS as libc::c_long,
                &mut ctx as *mut AioContext,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::EAGAIN) {
                ReaderError::AioSlotsExhausted
            } else {
                ReaderError::Setup { source: err }
            });
        }

        tracing::debug!(?tid, ctx, "allocated AIO context");
        contexts.insert(tid, ctx);
        Ok(WorkerContext(ctx))
    }

    /// Look up the calling thread's context.
    pub fn ctx(&self) -> Result<WorkerContext, ReaderError> {
        self.contexts
            .lock()
            .get(&thread::current().id())
            .copied()
            .map(WorkerContext)
            .ok_or(ReaderError::BadWorker)
    }

    /// Tear down the calling thread's context.
    pub fn deregister_worker(&self) {
        let tid = thread::current().id();
        match self.contexts.lock().remove(&tid) {
            Some(ctx) => {
                unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
                tracing::debug!(?tid, "returned AIO context");
            }
            None => {
                tracing::warn!(?tid, "deregister_worker called by an unregistered thread");
            }
        }
    }

    /// Tear down every outstanding context.
    pub fn deregister_all(&self) {
        let mut contexts = self.contexts.lock();
        for (_, ctx) in contexts.drain() {
            unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
        }
    }

    /// Issue every request and wait until all completions have landed.
    ///
    /// Requests are submitted in waves of at most [`MAX_EVENTS`]. Partial
    /// submits and drains resume where they stopped and count one attempt
    /// each; `EINTR` retries transparently. All bytes are in the caller's
    /// buffers when this returns `Ok`.
    pub fn read(
        &self,
        reqs: &mut [AlignedRead<'_>],
        ctx: &WorkerContext,
    ) -> Result<(), ReaderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReaderError::Closed);
        }

        for wave in reqs.chunks_mut(MAX_EVENTS) {
            self.execute_wave(wave, ctx)?;
        }
        Ok(())
    }

    fn execute_wave(
        &self,
        wave: &mut [AlignedRead<'_>],
        ctx: &WorkerContext,
    ) -> Result<(), ReaderError> {
        let n_ops = wave.len();
        let mut iocbs: Vec<Iocb> = wave
            .iter_mut()
            .enumerate()
            .map(|(i, req)| Iocb {
                aio_data: i as u64,
                aio_lio_opcode: IOCB_CMD_PREAD,
                aio_fildes: self.fd as u32,
                aio_buf: req.buf.as_mut_ptr() as u64,
                aio_nbytes: req.buf.len() as u64,
                aio_offset: req.offset as i64,
                ..Iocb::default()
            })
            .collect();
        let mut cb_ptrs: Vec<*mut Iocb> = iocbs.iter_mut().map(|cb| cb as *mut Iocb).collect();
        let mut events = vec![IoEvent::default(); n_ops];

        let mut submitted = 0usize;
        let mut attempts = 0usize;
        while submitted < n_ops {
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_io_submit,
                    ctx.0,
                    (n_ops - submitted) as libc::c_long,
                    cb_ptrs.as_mut_ptr().add(submitted),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(ReaderError::Submit {
                    path: self.path.clone(),
                    source: err,
                });
            }
            submitted += ret as usize;
            if submitted < n_ops {
                attempts += 1;
                if attempts > MAX_IO_ATTEMPTS {
                    return Err(ReaderError::RetriesExhausted {
                        op: "io_submit",
                        attempts: MAX_IO_ATTEMPTS,
                    });
                }
                tracing::warn!(submitted, expected = n_ops, attempts, "partial io_submit");
            }
        }

        let mut collected = 0usize;
        let mut attempts = 0usize;
        while collected < n_ops {
            let want = (n_ops - collected) as libc::c_long;
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_io_getevents,
                    ctx.0,
                    want,
                    want,
                    events.as_mut_ptr().add(collected),
                    std::ptr::null_mut::<libc::timespec>(),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(ReaderError::Drain {
                    path: self.path.clone(),
                    source: err,
                });
            }
            collected += ret as usize;
            if collected < n_ops {
                attempts += 1;
                if attempts > MAX_IO_ATTEMPTS {
                    return Err(ReaderError::RetriesExhausted {
                        op: "io_getevents",
                        attempts: MAX_IO_ATTEMPTS,
                    });
                }
                tracing::warn!(collected, expected = n_ops, attempts, "partial io_getevents");
            }
        }

        for event in &events {
            let req = &wave[event.data as usize];
            if event.res < 0 {
                return Err(ReaderError::Completion {
                    path: self.path.clone(),
                    offset: req.offset,
                    source: io::Error::from_raw_os_error(-event.res as i32),
                });
            }
            if event.res as usize != req.buf.len() {
                return Err(ReaderError::ShortRead {
                    path: self.path.clone(),
                    offset: req.offset,
                    expected: req.buf.len(),
                    got: event.res as usize,
                });
            }
        }
        Ok(())
    }

    /// Destroy every context and close the descriptor. The supported
    /// shutdown path; call after all workers have deregistered.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.deregister_all();
        let ret = unsafe { libc::close(self.fd) };
        if ret != 0 {
            tracing::warn!(
                path = %self.path.display(),
                error = %io::Error::last_os_error(),
                "close() failed"
            );
        }
    }
}

impl Drop for AlignedFileReader {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            tracing::warn!(
                path = %self.path.display(),
                "reader dropped without close(); forcing context teardown"
            );
            self.close();
            debug_assert!(
                thread::panicking(),
                "AlignedFileReader must be close()d before drop"
            );
        }
    }
}
