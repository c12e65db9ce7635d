use std::cell::{Cell, Ref, RefCell};
use std::collections::VecDeque;
use std::ffi::CStr;
use std::future::Future;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use io_uring::types::{Fd, FsyncFlags};
use io_uring::{IoUring, opcode, squeue, types};

use crate::completion::{self, Completion, MsgStash, Stash};
use crate::config::Config;
use crate::error::Error;
use crate::executor::{self, JoinHandle, TaskSlab};
use crate::op::Op;
use crate::ring::Ring;

/// Handle to a single-threaded io_uring I/O service.
///
/// One service owns one submission/completion queue pair. Every
/// operation method queues an SQE tagged with a fresh completion slot
/// and returns a future resolving to the kernel's signed result;
/// [`run`](Self::run) drives a future to completion by flushing queued
/// entries, blocking for completions, and waking the tasks they belong
/// to.
///
/// Cloning is cheap: all clones refer to the same ring. Use a clone to
/// move the service into a future passed to [`spawn`](Self::spawn).
#[derive(Clone)]
pub struct IoService {
    inner: Rc<ServiceInner>,
}

pub(crate) struct ServiceInner {
    ring: RefCell<Ring>,
    tasks: RefCell<TaskSlab>,
    running: Cell<bool>,
}

impl ServiceInner {
    /// Attach the completion slot and per-op flags to a prepared entry
    /// and push it. A failed flush resolves the slot with the negative
    /// errno, so the operation still completes through the normal
    /// await path.
    fn submit(&self, entry: squeue::Entry, completion: &Rc<Completion>, iflags: u8) {
        let user_data = completion::into_user_data(completion);
        let entry = entry
            .flags(squeue::Flags::from_bits_truncate(iflags))
            .user_data(user_data);
        if let Err(e) = self.ring.borrow_mut().push(&entry) {
            // The kernel never saw the entry: reclaim its reference
            // and fail the op in place.
            unsafe { completion::reclaim_user_data(user_data) };
            completion.resolve(-e.raw_os_error().unwrap_or(libc::EIO));
        }
    }

    /// Queue an `ASYNC_CANCEL` for the operation identified by
    /// `target`. Best effort: the cancel's own CQE carries a zero
    /// user_data and is skipped by the drain.
    pub(crate) fn submit_cancel(&self, target: u64) {
        let entry = opcode::AsyncCancel::new(target).build().user_data(0);
        let _ = self.ring.borrow_mut().push(&entry);
    }

    fn supports(&self, code: u8) -> bool {
        self.ring.borrow().supports(code)
    }
}

impl IoService {
    /// Create a service with the given SQ depth and default settings
    /// otherwise.
    pub fn new(entries: u32) -> Result<IoService, Error> {
        IoService::with_config(&Config {
            entries,
            ..Config::default()
        })
    }

    /// Create a service from a full [`Config`].
    pub fn with_config(config: &Config) -> Result<IoService, Error> {
        let ring = Ring::setup(config)?;
        Ok(IoService {
            inner: Rc::new(ServiceInner {
                ring: RefCell::new(ring),
                tasks: RefCell::new(TaskSlab::new()),
                running: Cell::new(false),
            }),
        })
    }

    fn op(&self, entry: squeue::Entry, iflags: u8) -> Op {
        let completion = Completion::new();
        self.inner.submit(entry, &completion, iflags);
        Op::new(&self.inner, completion)
    }

    // ── Vectored file I/O ───────────────────────────────────────────

    /// Read into multiple buffers at the given offset
    /// (`IORING_OP_READV`).
    ///
    /// # Safety
    ///
    /// `iovecs` must point to `nr_vecs` valid entries, and both the
    /// array and the buffers it references must remain valid until the
    /// returned op resolves.
    pub unsafe fn readv(
        &self,
        fd: RawFd,
        iovecs: *const libc::iovec,
        nr_vecs: u32,
        offset: u64,
        iflags: u8,
    ) -> Op {
        let entry = opcode::Readv::new(Fd(fd), iovecs, nr_vecs)
            .offset(offset)
            .build();
        self.op(entry, iflags)
    }

    /// Write from multiple buffers at the given offset
    /// (`IORING_OP_WRITEV`).
    ///
    /// # Safety
    ///
    /// Same contract as [`readv`](Self::readv).
    pub unsafe fn writev(
        &self,
        fd: RawFd,
        iovecs: *const libc::iovec,
        nr_vecs: u32,
        offset: u64,
        iflags: u8,
    ) -> Op {
        let entry = opcode::Writev::new(Fd(fd), iovecs, nr_vecs)
            .offset(offset)
            .build();
        self.op(entry, iflags)
    }

    // ── Plain file I/O ──────────────────────────────────────────────

    /// Read into a buffer at the given offset (`IORING_OP_READ`; on
    /// kernels without it, a single-iovec `IORING_OP_READV` with the
    /// iovec held by the service).
    ///
    /// # Safety
    ///
    /// `buf` must be valid for `nbytes` writable bytes until the
    /// returned op resolves.
    pub unsafe fn read(&self, fd: RawFd, buf: *mut u8, nbytes: u32, offset: u64, iflags: u8) -> Op {
        if self.inner.supports(opcode::Read::CODE) {
            let entry = opcode::Read::new(Fd(fd), buf, nbytes).offset(offset).build();
            return self.op(entry, iflags);
        }
        let completion = Completion::new();
        let iov = Box::new(libc::iovec {
            iov_base: buf as *mut libc::c_void,
            iov_len: nbytes as usize,
        });
        let entry = opcode::Readv::new(Fd(fd), &*iov as *const libc::iovec, 1)
            .offset(offset)
            .build();
        completion.hold(Stash::Iovec(iov));
        self.inner.submit(entry, &completion, iflags);
        Op::new(&self.inner, completion)
    }

    /// Write from a buffer at the given offset (`IORING_OP_WRITE`; on
    /// kernels without it, a single-iovec `IORING_OP_WRITEV` with the
    /// iovec held by the service).
    ///
    /// # Safety
    ///
    /// `buf` must be valid for `nbytes` readable bytes until the
    /// returned op resolves.
    pub unsafe fn write(
        &self,
        fd: RawFd,
        buf: *const u8,
        nbytes: u32,
        offset: u64,
        iflags: u8,
    ) -> Op {
        if self.inner.supports(opcode::Write::CODE) {
            let entry = opcode::Write::new(Fd(fd), buf, nbytes).offset(offset).build();
            return self.op(entry, iflags);
        }
        let completion = Completion::new();
        let iov = Box::new(libc::iovec {
            iov_base: buf as *mut libc::c_void,
            iov_len: nbytes as usize,
        });
        let entry = opcode::Writev::new(Fd(fd), &*iov as *const libc::iovec, 1)
            .offset(offset)
            .build();
        completion.hold(Stash::Iovec(iov));
        self.inner.submit(entry, &completion, iflags);
        Op::new(&self.inner, completion)
    }

    // ── Fixed-buffer I/O ────────────────────────────────────────────

    /// Read into a registered buffer (`IORING_OP_READ_FIXED`).
    /// `buf_index` is the buffer's index from
    /// [`register_buffers`](Self::register_buffers); `buf` must lie
    /// within that registration.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for `nbytes` writable bytes until the
    /// returned op resolves.
    pub unsafe fn read_fixed(
        &self,
        fd: RawFd,
        buf: *mut u8,
        nbytes: u32,
        offset: u64,
        buf_index: u16,
        iflags: u8,
    ) -> Op {
        let entry = opcode::ReadFixed::new(Fd(fd), buf, nbytes, buf_index)
            .offset(offset)
            .build();
        self.op(entry, iflags)
    }

    /// Write from a registered buffer (`IORING_OP_WRITE_FIXED`).
    ///
    /// # Safety
    ///
    /// Same contract as [`read_fixed`](Self::read_fixed), with `buf`
    /// readable.
    pub unsafe fn write_fixed(
        &self,
        fd: RawFd,
        buf: *const u8,
        nbytes: u32,
        offset: u64,
        buf_index: u16,
        iflags: u8,
    ) -> Op {
        let entry = opcode::WriteFixed::new(Fd(fd), buf, nbytes, buf_index)
            .offset(offset)
            .build();
        self.op(entry, iflags)
    }

    // ── File synchronization ────────────────────────────────────────

    /// Synchronize a file's in-core state with the storage device
    /// (`IORING_OP_FSYNC`).
    pub fn fsync(&self, fd: RawFd, flags: FsyncFlags, iflags: u8) -> Op {
        let entry = opcode::Fsync::new(Fd(fd)).flags(flags).build();
        self.op(entry, iflags)
    }

    /// Sync a file segment with disk (`IORING_OP_SYNC_FILE_RANGE`).
    pub fn sync_file_range(
        &self,
        fd: RawFd,
        offset: u64,
        nbytes: u32,
        range_flags: u32,
        iflags: u8,
    ) -> Op {
        let entry = opcode::SyncFileRange::new(Fd(fd), nbytes)
            .offset(offset)
            .flags(range_flags)
            .build();
        self.op(entry, iflags)
    }

    // ── Socket I/O ──────────────────────────────────────────────────

    /// Receive a message from a socket (`IORING_OP_RECVMSG`).
    ///
    /// # Safety
    ///
    /// `msg` and everything it references (iovecs, buffers, name,
    /// control) must remain valid until the returned op resolves.
    pub unsafe fn recvmsg(&self, fd: RawFd, msg: *mut libc::msghdr, flags: u32, iflags: u8) -> Op {
        let entry = opcode::RecvMsg::new(Fd(fd), msg).flags(flags).build();
        self.op(entry, iflags)
    }

    /// Send a message on a socket (`IORING_OP_SENDMSG`).
    ///
    /// # Safety
    ///
    /// Same contract as [`recvmsg`](Self::recvmsg).
    pub unsafe fn sendmsg(
        &self,
        fd: RawFd,
        msg: *const libc::msghdr,
        flags: u32,
        iflags: u8,
    ) -> Op {
        let entry = opcode::SendMsg::new(Fd(fd), msg).flags(flags).build();
        self.op(entry, iflags)
    }

    /// Receive from a socket (`IORING_OP_RECV`; on kernels without it,
    /// an `IORING_OP_RECVMSG` whose msghdr the service holds).
    ///
    /// # Safety
    ///
    /// `buf` must be valid for `nbytes` writable bytes until the
    /// returned op resolves.
    pub unsafe fn recv(&self, fd: RawFd, buf: *mut u8, nbytes: u32, flags: i32, iflags: u8) -> Op {
        if self.inner.supports(opcode::Recv::CODE) {
            let entry = opcode::Recv::new(Fd(fd), buf, nbytes).flags(flags).build();
            return self.op(entry, iflags);
        }
        let completion = Completion::new();
        let mut stash = Box::new(MsgStash {
            iov: libc::iovec {
                iov_base: buf as *mut libc::c_void,
                iov_len: nbytes as usize,
            },
            msg: unsafe { std::mem::zeroed() },
        });
        stash.msg.msg_iov = &mut stash.iov;
        stash.msg.msg_iovlen = 1;
        let msg_ptr: *mut libc::msghdr = &mut stash.msg;
        completion.hold(Stash::Msg(stash));
        let entry = opcode::RecvMsg::new(Fd(fd), msg_ptr).flags(flags as u32).build();
        self.inner.submit(entry, &completion, iflags);
        Op::new(&self.inner, completion)
    }

    /// Send on a socket (`IORING_OP_SEND`; on kernels without it, an
    /// `IORING_OP_SENDMSG` whose msghdr the service holds).
    ///
    /// # Safety
    ///
    /// `buf` must be valid for `nbytes` readable bytes until the
    /// returned op resolves.
    pub unsafe fn send(&self, fd: RawFd, buf: *const u8, nbytes: u32, flags: i32, iflags: u8) -> Op {
        if self.inner.supports(opcode::Send::CODE) {
            let entry = opcode::Send::new(Fd(fd), buf, nbytes).flags(flags).build();
            return self.op(entry, iflags);
        }
        let completion = Completion::new();
        let mut stash = Box::new(MsgStash {
            iov: libc::iovec {
                iov_base: buf as *mut libc::c_void,
                iov_len: nbytes as usize,
            },
            msg: unsafe { std::mem::zeroed() },
        });
        stash.msg.msg_iov = &mut stash.iov;
        stash.msg.msg_iovlen = 1;
        let msg_ptr: *const libc::msghdr = &stash.msg;
        completion.hold(Stash::Msg(stash));
        let entry = opcode::SendMsg::new(Fd(fd), msg_ptr).flags(flags as u32).build();
        self.inner.submit(entry, &completion, iflags);
        Op::new(&self.inner, completion)
    }

    // ── Readiness, scheduling, timers ───────────────────────────────

    /// Wait for events on a file descriptor (`IORING_OP_POLL_ADD`).
    /// Resolves with the returned event mask.
    pub fn poll(&self, fd: RawFd, poll_mask: u32, iflags: u8) -> Op {
        let entry = opcode::PollAdd::new(Fd(fd), poll_mask).build();
        self.op(entry, iflags)
    }

    /// Queue a no-op (`IORING_OP_NOP`). Awaiting it round-trips
    /// through the ring once — a cooperative yield that lets every
    /// other ready task run.
    pub fn yield_now(&self, iflags: u8) -> Op {
        let entry = opcode::Nop::new().build();
        self.op(entry, iflags)
    }

    /// Complete with `-ETIME` after `duration` (`IORING_OP_TIMEOUT`).
    /// The kernel timespec is held by the service until the completion
    /// arrives.
    pub fn timeout(&self, duration: Duration, iflags: u8) -> Op {
        let completion = Completion::new();
        let ts = Box::new(
            types::Timespec::new()
                .sec(duration.as_secs())
                .nsec(duration.subsec_nanos()),
        );
        let entry = opcode::Timeout::new(&*ts as *const types::Timespec).build();
        completion.hold(Stash::Timespec(ts));
        self.inner.submit(entry, &completion, iflags);
        Op::new(&self.inner, completion)
    }

    /// Complete with `-ETIME` when the given timespec expires
    /// (`IORING_OP_TIMEOUT`).
    ///
    /// # Safety
    ///
    /// `ts` must remain valid until the returned op resolves.
    pub unsafe fn timeout_ts(&self, ts: *const types::Timespec, iflags: u8) -> Op {
        let entry = opcode::Timeout::new(ts).build();
        self.op(entry, iflags)
    }

    // ── Connection management ───────────────────────────────────────

    /// Accept a connection on a listening socket (`IORING_OP_ACCEPT`).
    /// Resolves with the accepted fd. `addr`/`addrlen` may be null.
    ///
    /// # Safety
    ///
    /// When non-null, `addr` and `addrlen` must remain valid until the
    /// returned op resolves.
    pub unsafe fn accept(
        &self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: i32,
        iflags: u8,
    ) -> Op {
        let entry = opcode::Accept::new(Fd(fd), addr, addrlen).flags(flags).build();
        self.op(entry, iflags)
    }

    /// Initiate a connection on a socket (`IORING_OP_CONNECT`).
    ///
    /// # Safety
    ///
    /// `addr` must remain valid for `addrlen` bytes until the returned
    /// op resolves.
    pub unsafe fn connect(
        &self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
        iflags: u8,
    ) -> Op {
        let entry = opcode::Connect::new(Fd(fd), addr, addrlen).build();
        self.op(entry, iflags)
    }

    // ── Open / close ────────────────────────────────────────────────

    /// Open a file relative to `dirfd` (`IORING_OP_OPENAT`). Resolves
    /// with the new fd. The path bytes are copied and held by the
    /// service until the completion arrives.
    ///
    /// On kernels without the opcode this degrades to the synchronous
    /// `openat(2)` after one NOP round-trip through the ring: the
    /// caller still suspends at least once, but the syscall itself
    /// then runs in the caller's context.
    pub async fn openat(&self, dirfd: RawFd, path: &CStr, flags: i32, mode: u32, iflags: u8) -> i32 {
        if self.inner.supports(opcode::OpenAt::CODE) {
            let completion = Completion::new();
            let path = path.to_owned();
            let path_ptr = path.as_ptr();
            completion.hold(Stash::Path(path));
            let entry = opcode::OpenAt::new(Fd(dirfd), path_ptr)
                .flags(flags)
                .mode(mode)
                .build();
            self.inner.submit(entry, &completion, iflags);
            Op::new(&self.inner, completion).await
        } else {
            self.yield_now(iflags).await;
            sys_result(unsafe { libc::openat(dirfd, path.as_ptr(), flags, mode) })
        }
    }

    /// Close a file descriptor (`IORING_OP_CLOSE`).
    ///
    /// On kernels without the opcode this degrades to the synchronous
    /// `close(2)` after one NOP round-trip through the ring.
    pub async fn close(&self, fd: RawFd, iflags: u8) -> i32 {
        if self.inner.supports(opcode::Close::CODE) {
            let entry = opcode::Close::new(Fd(fd)).build();
            self.op(entry, iflags).await
        } else {
            self.yield_now(iflags).await;
            sys_result(unsafe { libc::close(fd) })
        }
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register files for fixed-file I/O
    /// (`IORING_REGISTER_FILES`). Registered descriptors are addressed
    /// by index through the `IOSQE_FIXED_FILE` per-op flag.
    pub fn register_files(&self, fds: &[RawFd]) -> Result<(), Error> {
        self.inner.ring.borrow().register_files(fds)
    }

    /// Update the registered file table at the given offset
    /// (`IORING_REGISTER_FILES_UPDATE`).
    pub fn register_files_update(&self, offset: u32, fds: &[RawFd]) -> Result<(), Error> {
        self.inner.ring.borrow().register_files_update(offset, fds)
    }

    /// Unregister all files (`IORING_UNREGISTER_FILES`).
    pub fn unregister_files(&self) -> Result<(), Error> {
        self.inner.ring.borrow().unregister_files()
    }

    /// Register buffers for fixed-buffer I/O
    /// (`IORING_REGISTER_BUFFERS`), used by
    /// [`read_fixed`](Self::read_fixed) and
    /// [`write_fixed`](Self::write_fixed).
    ///
    /// # Safety
    ///
    /// The iovecs must point to valid memory that outlives the
    /// registration.
    pub unsafe fn register_buffers(&self, iovecs: &[libc::iovec]) -> Result<(), Error> {
        unsafe { self.inner.ring.borrow().register_buffers(iovecs) }
    }

    /// Unregister all buffers (`IORING_UNREGISTER_BUFFERS`).
    pub fn unregister_buffers(&self) -> Result<(), Error> {
        self.inner.ring.borrow().unregister_buffers()
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Number of SQ-full events this service recovered from by
    /// flushing mid-iteration.
    pub fn sq_full_recoveries(&self) -> u64 {
        self.inner.ring.borrow().sq_full_recoveries()
    }

    /// Borrow the underlying ring handle for advanced use. The borrow
    /// must be released before any operation or `run()` call.
    pub fn handle(&self) -> Ref<'_, IoUring> {
        Ref::map(self.inner.ring.borrow(), Ring::handle)
    }

    // ── Executor ────────────────────────────────────────────────────

    /// Spawn a task onto this service's executor. The task is polled
    /// by [`run`](Self::run) alongside the top-level future; its
    /// output is observed through the returned [`JoinHandle`].
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
    {
        let (task, handle) = executor::wrap_task(future);
        let id = self.inner.tasks.borrow_mut().spawn(task);
        executor::push_ready(id);
        handle
    }

    /// Drive `future` to completion on the calling thread and return
    /// its output.
    ///
    /// The loop alternates between polling every ready task and
    /// blocking on the ring for at least one completion; each
    /// completion resolves the slot named by its user_data, in CQE
    /// order, waking the task that awaits it. Spawned tasks that are
    /// still pending when the top-level future finishes stay parked
    /// and resume on the next `run` call.
    pub fn run<F: Future>(&self, future: F) -> Result<F::Output, Error> {
        if self.inner.running.replace(true) {
            return Err(Error::AlreadyRunning);
        }
        let result = self.run_inner(future);
        self.inner.running.set(false);
        result
    }

    fn run_inner<F: Future>(&self, future: F) -> Result<F::Output, Error> {
        let mut main = std::pin::pin!(future);
        let mut output = None;
        let mut ready = VecDeque::new();
        executor::push_ready(executor::MAIN_TASK);

        loop {
            // Poll phase: run every ready task until the queue is
            // quiet. Polling may queue more SQEs (taking the SQ-full
            // path under pressure) and more wakeups.
            loop {
                executor::drain_ready_queue(&mut ready);
                if ready.is_empty() {
                    break;
                }
                while let Some(id) = ready.pop_front() {
                    if id == executor::MAIN_TASK {
                        if output.is_some() {
                            continue;
                        }
                        let waker = executor::task_waker(executor::MAIN_TASK);
                        let mut cx = Context::from_waker(&waker);
                        if let Poll::Ready(value) = main.as_mut().poll(&mut cx) {
                            output = Some(value);
                        }
                    } else {
                        let task = self.inner.tasks.borrow_mut().take_runnable(id);
                        if let Some(mut task) = task {
                            let waker = executor::task_waker(id);
                            let mut cx = Context::from_waker(&waker);
                            match task.as_mut().poll(&mut cx) {
                                Poll::Ready(()) => self.inner.tasks.borrow_mut().remove(id),
                                Poll::Pending => self.inner.tasks.borrow_mut().park(id, task),
                            }
                        }
                    }
                }
            }

            if let Some(value) = output.take() {
                return Ok(value);
            }

            // Flush queued SQEs and block for at least one completion,
            // then resolve everything that arrived.
            self.inner.ring.borrow().submit_and_wait(1)?;
            self.inner.ring.borrow_mut().drain_cqes();
        }
    }
}

/// Normalize a libc return value to the convention used on the ring:
/// non-negative result, or the negated errno.
fn sys_result(ret: libc::c_int) -> i32 {
    if ret >= 0 {
        ret
    } else {
        -std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO)
    }
}
