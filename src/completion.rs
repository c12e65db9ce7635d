use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::rc::Rc;
use std::task::Waker;

use io_uring::types;

/// Kernel-referenced temporaries owned by a completion slot.
///
/// io_uring reads these from user memory after the submitting call has
/// returned, so they must stay at a stable address until the CQE for
/// the operation has been reclaimed. Boxed storage inside the slot
/// gives that guarantee even if the awaiting future is dropped early.
/// Held for ownership only, never read back.
#[allow(dead_code)]
pub(crate) enum Stash {
    None,
    /// Relative timespec for a duration timeout.
    Timespec(Box<types::Timespec>),
    /// Single-element iovec for the vectored read/write fallback.
    Iovec(Box<libc::iovec>),
    /// iovec + msghdr pair for the recv/send msghdr fallback.
    Msg(Box<MsgStash>),
    /// Owned path bytes for openat.
    Path(CString),
}

/// An iovec and the msghdr that points at it. `msg.msg_iov` references
/// `iov` within the same allocation, so the pair must stay boxed
/// together.
pub(crate) struct MsgStash {
    pub(crate) iov: libc::iovec,
    pub(crate) msg: libc::msghdr,
}

/// One-shot completion slot shared between an in-flight SQE and the
/// future awaiting it.
///
/// The SQE's user_data is the address of this slot — a dedicated
/// strong reference minted by [`into_user_data`] — and the run loop
/// turns it back into a reference with [`resolve_user_data`] when the
/// CQE arrives. Resolution is single-shot: the first result wins and
/// later ones are dropped, which is what makes cancellation races
/// harmless.
pub(crate) struct Completion {
    result: Cell<Option<i32>>,
    waker: RefCell<Option<Waker>>,
    stash: RefCell<Stash>,
}

impl Completion {
    pub(crate) fn new() -> Rc<Completion> {
        Rc::new(Completion {
            result: Cell::new(None),
            waker: RefCell::new(None),
            stash: RefCell::new(Stash::None),
        })
    }

    /// Keep a kernel-referenced temporary alive until this slot is
    /// reclaimed.
    pub(crate) fn hold(&self, stash: Stash) {
        *self.stash.borrow_mut() = stash;
    }

    /// Resolve with the kernel's signed result and wake the awaiting
    /// task. Returns false if the slot was already resolved (the late
    /// resolution is dropped).
    pub(crate) fn resolve(&self, res: i32) -> bool {
        if self.result.get().is_some() {
            return false;
        }
        self.result.set(Some(res));
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
        true
    }

    pub(crate) fn result(&self) -> Option<i32> {
        self.result.get()
    }

    /// Register the waker of the awaiting task.
    pub(crate) fn register(&self, waker: &Waker) {
        let mut slot = self.waker.borrow_mut();
        match &*slot {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }
}

/// Mint the user_data for an SQE: a dedicated strong reference to the
/// slot, encoded as its address. The kernel hands the value back
/// untouched in the CQE.
pub(crate) fn into_user_data(completion: &Rc<Completion>) -> u64 {
    Rc::into_raw(Rc::clone(completion)) as usize as u64
}

/// Reclaim the SQE's reference for a delivered CQE and resolve the
/// slot. A zero user_data (internal entries such as cancels) is
/// skipped; a slot that was already resolved drops the late result.
///
/// # Safety
///
/// `user_data` must be zero or a value previously produced by
/// [`into_user_data`] that has not been reclaimed yet.
pub(crate) unsafe fn resolve_user_data(user_data: u64, res: i32) {
    if user_data == 0 {
        return;
    }
    let completion = unsafe { Rc::from_raw(user_data as usize as *const Completion) };
    completion.resolve(res);
}

/// Reclaim the SQE's reference without resolving — used when a push
/// failed and the kernel never saw the entry.
///
/// # Safety
///
/// Same contract as [`resolve_user_data`].
pub(crate) unsafe fn reclaim_user_data(user_data: u64) {
    drop(unsafe { Rc::from_raw(user_data as usize as *const Completion) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{self, task_waker};
    use std::collections::VecDeque;

    fn drained() -> VecDeque<u32> {
        let mut buf = VecDeque::new();
        executor::drain_ready_queue(&mut buf);
        buf
    }

    #[test]
    fn resolve_is_single_shot() {
        let completion = Completion::new();
        assert_eq!(completion.result(), None);
        assert!(completion.resolve(42));
        assert!(!completion.resolve(-libc::ECANCELED));
        assert_eq!(completion.result(), Some(42));
    }

    #[test]
    fn resolve_wakes_registered_task() {
        let _ = drained();
        let completion = Completion::new();
        completion.register(&task_waker(7));
        completion.resolve(0);
        let woken = drained();
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0], 7);
    }

    #[test]
    fn late_resolution_does_not_wake() {
        let _ = drained();
        let completion = Completion::new();
        completion.resolve(1);
        completion.register(&task_waker(3));
        completion.resolve(2);
        assert!(drained().is_empty());
        assert_eq!(completion.result(), Some(1));
    }

    #[test]
    fn user_data_round_trip() {
        let completion = Completion::new();
        let user_data = into_user_data(&completion);
        assert_eq!(Rc::strong_count(&completion), 2);
        unsafe { resolve_user_data(user_data, 9) };
        assert_eq!(Rc::strong_count(&completion), 1);
        assert_eq!(completion.result(), Some(9));
    }

    #[test]
    fn zero_user_data_skipped() {
        unsafe { resolve_user_data(0, -1) };
    }

    #[test]
    fn failed_push_reclaim_leaves_slot_pending() {
        let completion = Completion::new();
        let user_data = into_user_data(&completion);
        unsafe { reclaim_user_data(user_data) };
        assert_eq!(Rc::strong_count(&completion), 1);
        assert_eq!(completion.result(), None);
    }
}
