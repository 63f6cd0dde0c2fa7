//! Completion dispatcher: one ring, one operation arena, and a pool of
//! worker threads draining completions.
//!
//! Submissions push an SQE tagged with the arena key of its
//! [`Continuation`](crate::op::Continuation); workers block on the
//! completion side of the ring, pop one CQE at a time, vacate the slot,
//! and run the continuation. Which worker runs which completion is up to
//! the kernel and the lock queue; the dispatcher promises nothing about
//! cross-handle ordering.

use std::collections::HashSet;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use io_uring::{cqueue, opcode, squeue, IoUring};
use parking_lot::Mutex;
use slab::Slab;

use crate::builder::DispatcherBuilder;
use crate::handle::Handle;
use crate::op::{cqe_result, AddrBlock, Continuation, MsgBlock, OpSlot, ORPHAN_TOKEN, POISON_TOKEN};
use crate::pool::SharedPool;

/// Sink for unexpected failures inside worker threads.
pub type ErrorSink = Arc<dyn Fn(&io::Error) + Send + Sync>;

/// Hook run on each worker thread as it starts or shuts down.
pub type WorkerHook = Arc<dyn Fn() + Send + Sync>;

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// Handle to the dispatcher; cheap to clone, shared by every I/O handle
/// bound to it.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    ring: IoUring,
    /// Guards the submission side of the ring.
    sq: Mutex<()>,
    /// Guards the completion side; the holder may block waiting for a CQE.
    cq: Mutex<()>,
    ops: Mutex<Slab<OpSlot>>,
    bound: Mutex<HashSet<RawFd>>,
    /// Fixed single-size pool for the sockaddr/msghdr scratch retained by
    /// address-carrying operations.
    msg_blocks: SharedPool,
    state: AtomicU8,
    in_flight: AtomicUsize,
    error_sink: ErrorSink,
    init_hook: Option<WorkerHook>,
    teardown_hook: Option<WorkerHook>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Dispatcher with `threads` workers and default settings.
    pub fn new(threads: usize) -> io::Result<Dispatcher> {
        DispatcherBuilder::new().threads(threads).build()
    }

    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub(crate) fn start(
        queue_depth: u32,
        threads: usize,
        error_sink: ErrorSink,
        init_hook: Option<WorkerHook>,
        teardown_hook: Option<WorkerHook>,
    ) -> io::Result<Dispatcher> {
        let ring = IoUring::builder().build(queue_depth)?;
        let inner = Arc::new(Inner {
            ring,
            sq: Mutex::new(()),
            cq: Mutex::new(()),
            ops: Mutex::new(Slab::new()),
            bound: Mutex::new(HashSet::new()),
            msg_blocks: SharedPool::fixed(mem::size_of::<MsgBlock>()),
            state: AtomicU8::new(RUNNING),
            in_flight: AtomicUsize::new(0),
            error_sink,
            init_hook,
            teardown_hook,
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let inner = Arc::clone(&inner);
            let worker = std::thread::Builder::new()
                .name(format!("stratus-worker-{i}"))
                .spawn(move || drain_loop(inner))?;
            workers.push(worker);
        }
        *inner.workers.lock() = workers;

        tracing::debug!(threads, queue_depth, "dispatcher running");
        Ok(Dispatcher { inner })
    }

    /// Register a handle with the completion channel.
    ///
    /// Required exactly once, before the first async operation on the
    /// handle; a second bind is a lifecycle-misuse error and leaves the
    /// first binding intact.
    pub fn bind(&self, handle: &Handle) -> io::Result<()> {
        if !handle.belongs_to(self) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "handle was created for a different dispatcher",
            ));
        }
        if !handle.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "cannot bind a closed handle",
            ));
        }
        let fd = handle.raw_fd();
        if !self.inner.bound.lock().insert(fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "handle already bound to the dispatcher",
            ));
        }
        handle.mark_bound();
        Ok(())
    }

    /// Inject a work item into the worker pool as a zero-byte, no-error
    /// pseudo-completion. This is the only way external collaborators
    /// (timers, cross-thread callbacks) enter the pool.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> io::Result<()> {
        self.submit_op(-1, opcode::Nop::new().build(), Continuation::Task(Box::new(task)))
            .map_err(|(e, _)| e)
    }

    /// Stop the worker pool: one poison completion per worker, then join
    /// them all. Idempotent once stopped. Must not be called from inside
    /// a continuation — a worker cannot join itself.
    pub fn stop(&self) -> io::Result<()> {
        match self.inner.state.compare_exchange(
            RUNNING,
            STOPPING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STOPPED) => return Ok(()),
            Err(_) => {
                // Another caller is stopping; wait for it to finish.
                while self.inner.state.load(Ordering::Acquire) != STOPPED {
                    std::thread::yield_now();
                }
                return Ok(());
            }
        }

        let workers: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        for _ in 0..workers.len() {
            self.inner
                .push_raw(&opcode::Nop::new().build().user_data(POISON_TOKEN))?;
        }
        for worker in workers {
            let _ = worker.join();
        }
        self.inner.state.store(STOPPED, Ordering::Release);
        tracing::debug!("dispatcher stopped");
        Ok(())
    }

    /// Release dispatcher-held resources. Only legal after [`stop`]
    /// has returned; the ring itself is released when the last clone
    /// (including handle-embedded ones) goes away.
    ///
    /// [`stop`]: Self::stop
    pub fn close(&self) -> io::Result<()> {
        if self.inner.state.load(Ordering::Acquire) != STOPPED {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "close called before stop",
            ));
        }
        self.inner.ops.lock().clear();
        self.inner.bound.lock().clear();
        Ok(())
    }

    /// Operations currently submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == RUNNING
    }

    /// Submit one SQE owning `cont`. On submission failure the context is
    /// destroyed before returning and no completion will ever fire; the
    /// continuation is handed back so the caller decides whether the
    /// failure surfaces synchronously or through a handler.
    pub(crate) fn submit_op(
        &self,
        fd: RawFd,
        sqe: squeue::Entry,
        cont: Continuation,
    ) -> Result<(), (io::Error, Continuation)> {
        if !self.is_running() {
            return Err((
                io::Error::new(io::ErrorKind::Other, "dispatcher is not running"),
                cont,
            ));
        }
        let token = self.inner.ops.lock().insert(OpSlot { fd, cont });
        debug_assert!((token as u64) < POISON_TOKEN);
        match self.inner.push_raw(&sqe.user_data(token as u64)) {
            Ok(()) => {
                self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let slot = self.inner.ops.lock().remove(token);
                Err((e, slot.cont))
            }
        }
    }

    /// Ask the kernel to abort every pending operation on `fd`. The
    /// aborted completions still arrive (with `ECANCELED`) and destroy
    /// their contexts through the normal path.
    pub(crate) fn cancel_fd(&self, fd: RawFd) -> io::Result<()> {
        let tokens: Vec<u64> = {
            let ops = self.inner.ops.lock();
            ops.iter()
                .filter(|(_, slot)| slot.fd == fd)
                .map(|(token, _)| token as u64)
                .collect()
        };
        for token in tokens {
            self.inner.push_raw(
                &opcode::AsyncCancel::new(token)
                    .build()
                    .user_data(ORPHAN_TOKEN),
            )?;
        }
        Ok(())
    }

    pub(crate) fn unbind_fd(&self, fd: RawFd) {
        self.inner.bound.lock().remove(&fd);
    }

    pub(crate) fn alloc_msg_block(&self) -> AddrBlock {
        let ptr = self.inner.msg_blocks.allocate(mem::size_of::<MsgBlock>());
        let block = ptr.cast::<MsgBlock>();
        unsafe { block.as_ptr().write(mem::zeroed()) };
        AddrBlock(block)
    }

    pub(crate) fn free_msg_block(&self, block: AddrBlock) {
        self.inner
            .msg_blocks
            .deallocate(block.0.cast(), mem::size_of::<MsgBlock>());
    }
}

impl Inner {
    /// Push one SQE and flush it to the kernel.
    fn push_raw(&self, sqe: &squeue::Entry) -> io::Result<()> {
        let _guard = self.sq.lock();
        // Safety: `sq` serializes every access to the submission side.
        unsafe {
            let mut queue = self.ring.submission_shared();
            if queue.push(sqe).is_err() {
                drop(queue);
                self.flush()?;
                let mut queue = self.ring.submission_shared();
                queue.push(sqe).map_err(|_| {
                    io::Error::new(io::ErrorKind::WouldBlock, "submission queue full")
                })?;
            }
        }
        self.flush()
    }

    fn flush(&self) -> io::Result<()> {
        loop {
            match self.ring.submitter().submit() {
                Ok(_) => return Ok(()),
                // CQ backpressure: the workers are draining, try again.
                Err(ref e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    std::thread::yield_now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Block until one completion is available and take it.
    fn dequeue(&self) -> io::Result<cqueue::Entry> {
        let _guard = self.cq.lock();
        loop {
            // Safety: `cq` serializes every access to the completion side.
            let mut queue = unsafe { self.ring.completion_shared() };
            if let Some(entry) = queue.next() {
                return Ok(entry);
            }
            drop(queue);
            self.ring.submitter().submit_and_wait(1)?;
        }
    }
}

fn drain_loop(inner: Arc<Inner>) {
    if let Some(hook) = &inner.init_hook {
        hook();
    }
    loop {
        let entry = match inner.dequeue() {
            Ok(entry) => entry,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                (inner.error_sink)(&e);
                std::thread::yield_now();
                continue;
            }
        };
        match entry.user_data() {
            POISON_TOKEN => break,
            ORPHAN_TOKEN => continue,
            token => {
                let slot = {
                    let mut ops = inner.ops.lock();
                    if ops.contains(token as usize) {
                        Some(ops.remove(token as usize))
                    } else {
                        None
                    }
                };
                match slot {
                    Some(slot) => {
                        inner.in_flight.fetch_sub(1, Ordering::Relaxed);
                        let dispatcher = Dispatcher {
                            inner: Arc::clone(&inner),
                        };
                        // No lock is held here: the continuation may
                        // submit follow-up operations.
                        slot.cont
                            .complete(&dispatcher, cqe_result(entry.result()));
                    }
                    None => (inner.error_sink)(&io::Error::new(
                        io::ErrorKind::Other,
                        format!("completion for unknown token {token}"),
                    )),
                }
            }
        }
    }
    if let Some(hook) = &inner.teardown_hook {
        hook();
    }
    tracing::trace!("worker exiting on poison completion");
}

/// Default sink: report through the logging layer.
pub(crate) fn default_error_sink() -> ErrorSink {
    Arc::new(|e: &io::Error| tracing::error!(error = %e, "worker thread failure"))
}
