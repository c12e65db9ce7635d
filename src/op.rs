use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::completion::Completion;
use crate::metrics;
use crate::service::ServiceInner;

/// An in-flight io_uring operation.
///
/// Resolves to the kernel's signed result: non-negative on success
/// (bytes transferred, accepted fd, ...), negative `-errno` on
/// failure. The future itself never fails — callers interpret the
/// value, or convert it with [`io_result`](crate::io_result).
///
/// The SQE for the operation is queued when the constructing service
/// method returns; the kernel sees it at the next run-loop wait, or
/// earlier under SQ pressure.
pub struct Op {
    svc: Weak<ServiceInner>,
    completion: Rc<Completion>,
}

impl Op {
    pub(crate) fn new(svc: &Rc<ServiceInner>, completion: Rc<Completion>) -> Op {
        Op {
            svc: Rc::downgrade(svc),
            completion,
        }
    }

    /// Ask the kernel to abort this operation.
    ///
    /// A still-pending op resolves with `-ECANCELED` immediately and an
    /// `ASYNC_CANCEL` SQE keyed by this op's identity is queued; the
    /// kernel's eventual completion for the original entry is then
    /// dropped. If the operation already completed, its real result
    /// stands and this call is a no-op.
    pub fn cancel(&self) {
        if !self.completion.resolve(-libc::ECANCELED) {
            return;
        }
        metrics::OPS_CANCELLED.increment();
        if let Some(svc) = self.svc.upgrade() {
            svc.submit_cancel(Rc::as_ptr(&self.completion) as usize as u64);
        }
    }

    /// Whether the completion event for this op has arrived.
    pub fn is_resolved(&self) -> bool {
        self.completion.result().is_some()
    }
}

impl Future for Op {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i32> {
        match self.completion.result() {
            Some(res) => Poll::Ready(res),
            None => {
                self.completion.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl Drop for Op {
    fn drop(&mut self) {
        // A dropped pending op is cancelled so the kernel stops
        // touching its memory as soon as possible. The slot (and any
        // stashed temporaries) stay alive through the SQE's own
        // reference until the kernel's completion is reclaimed.
        if self.completion.result().is_none() {
            self.cancel();
        }
    }
}
