//! Task slab, wakers, and join handles for the single-threaded
//! executor behind [`IoService::run`](crate::IoService::run).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Task id reserved for the top-level future driven by `run()`.
pub(crate) const MAIN_TASK: u32 = u32::MAX;

thread_local! {
    /// Queue of task ids ready to poll. Wakers push here; the run loop
    /// drains it between CQE batches.
    static READY_QUEUE: RefCell<VecDeque<u32>> = const { RefCell::new(VecDeque::new()) };
}

/// Create a [`Waker`] for the given task id.
///
/// Waking pushes the id onto the thread-local ready queue. Zero
/// allocation — the id is encoded directly in the data pointer.
///
/// # Safety
///
/// Must only be used on the thread running the service's loop
/// (single-threaded model).
pub(crate) fn task_waker(id: u32) -> Waker {
    let data = id as usize as *const ();
    // SAFETY: the vtable functions below follow the RawWaker contract.
    // The "data" is just the id cast to a pointer — no heap
    // allocation, no lifetime concerns.
    unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
}

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

unsafe fn clone_fn(data: *const ()) -> RawWaker {
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake_fn(data: *const ()) {
    unsafe { wake_by_ref_fn(data) };
}

unsafe fn wake_by_ref_fn(data: *const ()) {
    let id = data as usize as u32;
    READY_QUEUE.with(|q| {
        q.borrow_mut().push_back(id);
    });
}

unsafe fn drop_fn(_data: *const ()) {
    // No resources to free — data is just an integer.
}

/// Drain the thread-local ready queue into the provided buffer.
pub(crate) fn drain_ready_queue(buf: &mut VecDeque<u32>) {
    READY_QUEUE.with(|q| {
        buf.append(&mut q.borrow_mut());
    });
}

/// Mark a task id as ready to poll.
pub(crate) fn push_ready(id: u32) {
    READY_QUEUE.with(|q| {
        q.borrow_mut().push_back(id);
    });
}

/// State of a single task slot.
enum TaskSlot {
    /// Slot is empty (no task).
    Empty,
    /// Task is parked (waiting for a wakeup).
    Parked(BoxFuture),
    /// Task is ready to be polled.
    Ready(BoxFuture),
}

/// Slab of spawned tasks with a free list for O(1) reuse. Grows on
/// demand; there is no fixed task table to size it from up front.
pub(crate) struct TaskSlab {
    tasks: Vec<TaskSlot>,
    free_list: Vec<u32>,
}

impl TaskSlab {
    pub(crate) fn new() -> TaskSlab {
        TaskSlab {
            tasks: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Insert a task, immediately Ready for its first poll. Returns
    /// the slot id.
    pub(crate) fn spawn(&mut self, future: BoxFuture) -> u32 {
        match self.free_list.pop() {
            Some(id) => {
                self.tasks[id as usize] = TaskSlot::Ready(future);
                id
            }
            None => {
                let id = self.tasks.len() as u32;
                debug_assert!(id < MAIN_TASK, "task slab exhausted the id space");
                self.tasks.push(TaskSlot::Ready(future));
                id
            }
        }
    }

    /// Take a runnable task out for polling. Returns None if the slot
    /// is empty — a duplicate wake, or a stale id whose task already
    /// completed.
    pub(crate) fn take_runnable(&mut self, id: u32) -> Option<BoxFuture> {
        let idx = id as usize;
        if idx >= self.tasks.len() {
            return None;
        }
        match std::mem::replace(&mut self.tasks[idx], TaskSlot::Empty) {
            TaskSlot::Ready(fut) | TaskSlot::Parked(fut) => Some(fut),
            TaskSlot::Empty => None,
        }
    }

    /// Park a task back after it returned `Poll::Pending`.
    pub(crate) fn park(&mut self, id: u32, future: BoxFuture) {
        let idx = id as usize;
        debug_assert!(idx < self.tasks.len());
        self.tasks[idx] = TaskSlot::Parked(future);
    }

    /// Remove a completed task, returning its slot to the free list.
    pub(crate) fn remove(&mut self, id: u32) {
        let idx = id as usize;
        if idx < self.tasks.len() {
            self.tasks[idx] = TaskSlot::Empty;
            self.free_list.push(id);
        }
    }
}

/// Completion state shared between a spawned task and its
/// [`JoinHandle`].
struct JoinState<T> {
    result: Option<T>,
    waker: Option<Waker>,
    finished: bool,
}

/// Handle to a task spawned with
/// [`IoService::spawn`](crate::IoService::spawn).
///
/// Implements [`Future`]: awaiting the handle suspends the caller
/// until the task's output is produced. Completion can also be
/// observed without blocking through [`is_finished`](Self::is_finished)
/// and [`try_join`](Self::try_join). Dropping the handle detaches the
/// task; it keeps running and its output is discarded.
pub struct JoinHandle<T> {
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> JoinHandle<T> {
    /// Whether the task has run to completion.
    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }

    /// Test task completion. If complete, return the task output,
    /// consuming the handle. If not, give the handle back.
    pub fn try_join(self) -> Result<T, Self> {
        let taken = self.state.borrow_mut().result.take();
        match taken {
            Some(value) => Ok(value),
            None => Err(self),
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.borrow_mut();
        if let Some(value) = state.result.take() {
            return Poll::Ready(value);
        }
        assert!(!state.finished, "task output already taken");
        match &state.waker {
            Some(current) if current.will_wake(cx.waker()) => {}
            _ => state.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

/// Wrap a future for the task slab: the wrapper stores the output in
/// the shared join state and wakes the joiner.
pub(crate) fn wrap_task<F>(future: F) -> (BoxFuture, JoinHandle<F::Output>)
where
    F: Future + 'static,
{
    let state = Rc::new(RefCell::new(JoinState {
        result: None,
        waker: None,
        finished: false,
    }));
    let handle_state = Rc::clone(&state);
    let wrapped = Box::pin(async move {
        let output = future.await;
        let mut s = state.borrow_mut();
        s.result = Some(output);
        s.finished = true;
        if let Some(waker) = s.waker.take() {
            waker.wake();
        }
    });
    (wrapped, JoinHandle {
        state: handle_state,
    })
}
