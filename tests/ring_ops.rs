//! Integration tests: scheduling, sockets, timers, and cancellation
//! through a real ring.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use ringway::{Config, Error, IoService, Op};

// ── Helpers ─────────────────────────────────────────────────────────

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "socketpair failed");
    (fds[0], fds[1])
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe failed");
    (fds[0], fds[1])
}

/// TCP socket listening on an ephemeral loopback port.
fn listener() -> RawFd {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0, "socket failed");
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
            },
            sin_zero: [0; 8],
        };
        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        assert_eq!(rc, 0, "bind failed");
        assert_eq!(libc::listen(fd, 1), 0, "listen failed");
        fd
    }
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ── Scheduling ──────────────────────────────────────────────────────

#[test]
fn run_returns_a_ready_future_without_blocking() {
    let svc = IoService::new(8).unwrap();
    assert_eq!(svc.run(async { 7 }).unwrap(), 7);
}

#[test]
fn handle_exposes_the_ring() {
    let svc = IoService::new(8).unwrap();
    assert!(svc.handle().params().sq_entries() >= 8);
}

#[test]
fn yield_round_trips_through_the_ring() {
    let svc = IoService::new(8).unwrap();
    svc.run(async {
        for _ in 0..5 {
            assert_eq!(svc.yield_now(0).await, 0);
        }
    })
    .unwrap();
}

#[test]
fn oversubscribed_sq_recovers() {
    let config = Config {
        entries: 4,
        cq_entries: Some(64),
        ..Config::default()
    };
    let svc = IoService::with_config(&config).unwrap();

    // Sixteen entries against a four-slot SQ: queuing alone must force
    // the full-SQ recovery path at least once.
    let ops: Vec<Op> = (0..16).map(|_| svc.yield_now(0)).collect();
    svc.run(async {
        for op in ops {
            assert_eq!(op.await, 0);
        }
    })
    .unwrap();
    assert!(svc.sq_full_recoveries() >= 1);
}

#[test]
fn run_inside_run_is_rejected() {
    let svc = IoService::new(8).unwrap();
    svc.run(async {
        let err = svc.run(async {}).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning));
    })
    .unwrap();
}

#[test]
fn spawned_task_joins_with_result() {
    let svc = IoService::new(8).unwrap();
    let worker = svc.clone();
    let handle = svc.spawn(async move {
        let mut total = 0;
        for _ in 0..3 {
            assert_eq!(worker.yield_now(0).await, 0);
            total += 1;
        }
        total
    });

    let handle = match handle.try_join() {
        Err(handle) => handle,
        Ok(_) => panic!("task cannot have run before the loop"),
    };
    assert!(!handle.is_finished());

    let total = svc.run(async { handle.await }).unwrap();
    assert_eq!(total, 3);
}

#[test]
fn detached_task_still_runs() {
    let svc = IoService::new(8).unwrap();
    let done = Rc::new(Cell::new(false));

    let worker = svc.clone();
    let flag = done.clone();
    drop(svc.spawn(async move {
        worker.yield_now(0).await;
        flag.set(true);
    }));

    svc.run(async { svc.timeout(Duration::from_millis(5), 0).await })
        .unwrap();
    assert!(done.get());
}

// ── Sockets ─────────────────────────────────────────────────────────

#[test]
fn socketpair_send_recv() {
    let svc = IoService::new(8).unwrap();
    let (a, b) = socketpair();

    svc.run(async {
        let mut buf = [0u8; 4];
        let recv = unsafe { svc.recv(a, buf.as_mut_ptr(), 4, 0, 0) };
        let send = unsafe { svc.send(b, b"ping".as_ptr(), 4, 0, 0) };
        assert_eq!(send.await, 4);
        assert_eq!(recv.await, 4);
        assert_eq!(&buf, b"ping");
    })
    .unwrap();

    close_fd(a);
    close_fd(b);
}

#[test]
fn sendmsg_recvmsg_round_trip() {
    let svc = IoService::new(8).unwrap();
    let (a, b) = socketpair();

    svc.run(async {
        let payload = *b"datagram";
        let mut out_iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut out_msg: libc::msghdr = unsafe { std::mem::zeroed() };
        out_msg.msg_iov = &mut out_iov;
        out_msg.msg_iovlen = 1;

        let mut buf = [0u8; 16];
        let mut in_iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut in_msg: libc::msghdr = unsafe { std::mem::zeroed() };
        in_msg.msg_iov = &mut in_iov;
        in_msg.msg_iovlen = 1;

        let recv = unsafe { svc.recvmsg(a, &mut in_msg, 0, 0) };
        let sent = unsafe { svc.sendmsg(b, &out_msg, 0, 0) }.await;
        assert_eq!(sent, payload.len() as i32);
        assert_eq!(recv.await, payload.len() as i32);
        assert_eq!(&buf[..payload.len()], &payload);
    })
    .unwrap();

    close_fd(a);
    close_fd(b);
}

#[test]
fn poll_resolves_when_pipe_becomes_readable() {
    let svc = IoService::new(8).unwrap();
    let (rd, wr) = pipe();

    let mask = svc
        .run(async {
            let readable = svc.poll(rd, libc::POLLIN as u32, 0);
            let byte = 0x5au8;
            let wrote = unsafe { svc.write(wr, &byte, 1, 0, 0) }.await;
            assert_eq!(wrote, 1);
            readable.await
        })
        .unwrap();

    assert!(mask > 0, "poll failed: {mask}");
    assert_ne!(mask as u32 & libc::POLLIN as u32, 0);

    close_fd(rd);
    close_fd(wr);
}

// ── Timers ──────────────────────────────────────────────────────────

#[test]
fn timeout_resolves_etime_no_earlier_than_asked() {
    let svc = IoService::new(8).unwrap();
    let start = Instant::now();
    let res = svc
        .run(async { svc.timeout(Duration::from_millis(10), 0).await })
        .unwrap();
    assert_eq!(res, -libc::ETIME);
    assert!(start.elapsed() >= Duration::from_millis(10));
}

#[test]
fn concurrent_timeouts_resolve_in_deadline_order() {
    let svc = IoService::new(8).unwrap();
    let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    let worker = svc.clone();
    let seen = order.clone();
    let slow = svc.spawn(async move {
        let res = worker.timeout(Duration::from_millis(50), 0).await;
        seen.borrow_mut().push(50);
        res
    });

    let worker = svc.clone();
    let seen = order.clone();
    let fast = svc.spawn(async move {
        let res = worker.timeout(Duration::from_millis(10), 0).await;
        seen.borrow_mut().push(10);
        res
    });

    let (fast_res, slow_res) = svc.run(async { (fast.await, slow.await) }).unwrap();
    assert_eq!(fast_res, -libc::ETIME);
    assert_eq!(slow_res, -libc::ETIME);
    assert_eq!(&*order.borrow(), &[10, 50]);
}

// ── Cancellation ────────────────────────────────────────────────────

#[test]
fn cancelled_accept_resolves_ecanceled() {
    let svc = IoService::new(8).unwrap();
    let fd = listener();

    let mut accept =
        unsafe { svc.accept(fd, std::ptr::null_mut(), std::ptr::null_mut(), 0, 0) };

    svc.run(async {
        // Let the accept reach the kernel before cancelling it.
        svc.yield_now(0).await;
        accept.cancel();
        assert_eq!((&mut accept).await, -libc::ECANCELED);
        // One more wait so the kernel's completion for the retired
        // accept flows back and is dropped against the consumed slot.
        svc.timeout(Duration::from_millis(5), 0).await;
    })
    .unwrap();

    drop(accept);
    close_fd(fd);
}

#[test]
fn cancel_after_completion_is_a_no_op() {
    let svc = IoService::new(8).unwrap();
    let mut op = svc.yield_now(0);
    let res = svc.run(async { (&mut op).await }).unwrap();
    assert_eq!(res, 0);

    assert!(op.is_resolved());
    op.cancel();
    assert!(op.is_resolved());
}

#[test]
fn dropping_a_pending_op_cancels_it() {
    let svc = IoService::new(8).unwrap();

    svc.run(async {
        // A long timer that would outlive the test by far.
        let long = svc.timeout(Duration::from_secs(3600), 0);
        svc.yield_now(0).await;
        drop(long);
        // The loop keeps turning; the retired timer's completion is
        // dropped against its consumed slot during this wait.
        assert_eq!(svc.timeout(Duration::from_millis(5), 0).await, -libc::ETIME);
    })
    .unwrap();
}
