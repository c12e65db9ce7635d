use std::io;
use std::os::fd::RawFd;

use io_uring::{IoUring, Probe, opcode, squeue};

use crate::completion;
use crate::config::Config;
use crate::error::Error;
use crate::metrics;

/// Wrapper around [`IoUring`] owning the SQ/CQ pair and the submission
/// discipline.
///
/// Submission is lazy: entries accumulate in the SQ and reach the
/// kernel at run-loop waits, or earlier when the SQ fills up and
/// [`Ring::push`] flushes to recover a slot.
pub(crate) struct Ring {
    ring: IoUring,
    /// CQEs observed in the current drain but not yet returned to the
    /// kernel. Zero between run-loop iterations.
    cqe_seen: u32,
    /// SQ-full events recovered by flushing to the kernel.
    sq_full_recoveries: u64,
    /// Opcode support captured at setup. `None` when the kernel
    /// predates `IORING_REGISTER_PROBE`.
    probe: Option<Probe>,
}

impl Ring {
    /// Create and configure the io_uring instance.
    pub(crate) fn setup(config: &Config) -> Result<Ring, Error> {
        config.validate()?;

        let mut builder = IoUring::builder();
        if let Some(cq_entries) = config.cq_entries {
            builder.setup_cqsize(cq_entries);
        }
        if config.sqpoll {
            builder.setup_sqpoll(config.sqpoll_idle_ms);
        }
        let ring = builder
            .build(config.entries)
            .map_err(|e| Error::RingSetup(format!("io_uring_setup: {e}")))?;

        let mut probe = Probe::new();
        let probe = match ring.submitter().register_probe(&mut probe) {
            Ok(()) => Some(probe),
            Err(_) => None,
        };

        Ok(Ring {
            ring,
            cqe_seen: 0,
            sq_full_recoveries: 0,
            probe,
        })
    }

    /// Whether the running kernel supports the given opcode. Without
    /// probe support, assume the Linux 5.1 baseline set.
    pub(crate) fn supports(&self, code: u8) -> bool {
        match &self.probe {
            Some(probe) => probe.is_supported(code),
            None => [
                opcode::Nop::CODE,
                opcode::Readv::CODE,
                opcode::Writev::CODE,
                opcode::Fsync::CODE,
                opcode::ReadFixed::CODE,
                opcode::WriteFixed::CODE,
                opcode::PollAdd::CODE,
            ]
            .contains(&code),
        }
    }

    /// Push an SQE, never leaving the caller without a slot.
    ///
    /// If the SQ is full: return any observed-but-unadvanced CQEs to
    /// the kernel, flush the queued SQEs (which frees SQ slots), and
    /// retry. The retry only fails if the flush itself failed.
    pub(crate) fn push(&mut self, entry: &squeue::Entry) -> io::Result<()> {
        // Safety: the operation's referenced memory is either stashed
        // in its completion slot or covered by the caller contract of
        // the unsafe service methods.
        unsafe {
            if self.ring.submission().push(entry).is_ok() {
                metrics::SQE_PUSHED.increment();
                return Ok(());
            }
        }

        self.sq_full_recoveries += 1;
        metrics::SQ_FULL_RECOVERIES.increment();
        self.advance_cq();
        self.ring.submit()?;
        unsafe {
            self.ring
                .submission()
                .push(entry)
                .map_err(|_| io::Error::other("SQ still full after flush"))?;
        }
        metrics::SQE_PUSHED.increment();
        Ok(())
    }

    /// Return every observed-but-unadvanced CQE to the kernel.
    fn advance_cq(&mut self) {
        self.ring.completion().sync();
        self.cqe_seen = 0;
    }

    /// Flush queued SQEs and block until at least `min_complete`
    /// completions are available.
    pub(crate) fn submit_and_wait(&self, min_complete: usize) -> io::Result<()> {
        self.ring.submitter().submit_and_wait(min_complete)?;
        Ok(())
    }

    /// Drain every available CQE in completion order, resolving each
    /// entry's completion slot, then return the batch to the kernel.
    pub(crate) fn drain_cqes(&mut self) {
        debug_assert_eq!(self.cqe_seen, 0);
        {
            let cq = self.ring.completion();
            for cqe in cq {
                self.cqe_seen += 1;
                metrics::CQE_PROCESSED.increment();
                // Safety: every non-zero user_data on this ring was
                // minted for exactly one SQE.
                unsafe { completion::resolve_user_data(cqe.user_data(), cqe.result()) };
            }
        }
        // The CQ head was returned to the kernel when the queue handle
        // dropped at the end of the scope above.
        self.cqe_seen = 0;
    }

    pub(crate) fn register_files(&self, fds: &[RawFd]) -> Result<(), Error> {
        self.ring
            .submitter()
            .register_files(fds)
            .map_err(|e| Error::Registration(format!("register_files: {e}")))
    }

    pub(crate) fn register_files_update(&self, offset: u32, fds: &[RawFd]) -> Result<(), Error> {
        self.ring
            .submitter()
            .register_files_update(offset, fds)
            .map(|_| ())
            .map_err(|e| Error::Registration(format!("register_files_update: {e}")))
    }

    pub(crate) fn unregister_files(&self) -> Result<(), Error> {
        self.ring
            .submitter()
            .unregister_files()
            .map_err(|e| Error::Registration(format!("unregister_files: {e}")))
    }

    /// Register fixed buffers.
    ///
    /// # Safety
    ///
    /// The iovecs must point to valid memory that outlives the
    /// registration.
    pub(crate) unsafe fn register_buffers(&self, iovecs: &[libc::iovec]) -> Result<(), Error> {
        unsafe {
            self.ring
                .submitter()
                .register_buffers(iovecs)
                .map_err(|e| Error::Registration(format!("register_buffers: {e}")))
        }
    }

    pub(crate) fn unregister_buffers(&self) -> Result<(), Error> {
        self.ring
            .submitter()
            .unregister_buffers()
            .map_err(|e| Error::Registration(format!("unregister_buffers: {e}")))
    }

    pub(crate) fn sq_full_recoveries(&self) -> u64 {
        self.sq_full_recoveries
    }

    pub(crate) fn handle(&self) -> &IoUring {
        &self.ring
    }
}
