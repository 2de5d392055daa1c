//! Readiness events end to end: loopback arming, close-driven cancel

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use libc::{c_int, c_void, sockaddr, sockaddr_in, socklen_t};
use weft::{hook, IoEvent, IoManager};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(timeout: Duration, what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn sockaddr_of(listener: &TcpListener) -> sockaddr_in {
    let addr = listener.local_addr().unwrap();
    let mut sin: sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();
    sin
}

/// A loopback connect with READ and WRITE both armed: the WRITE waiter
/// fires on connect completion and closes the fd; the READ waiter must be
/// woken anyway, through the close path's cancel-all.
#[test]
fn test_loopback_write_then_close_wakes_read() {
    init_logs();
    let iom = IoManager::new(2, false, "t-loopback");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let sin = sockaddr_of(&listener);

    // Register the socket with the hook layer so close() can cancel; the
    // registration also forces kernel nonblock.
    hook::set_hook_enabled(true);
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    hook::set_hook_enabled(false);
    assert!(fd >= 0);

    let rc = unsafe {
        libc::connect(
            fd,
            &sin as *const sockaddr_in as *const sockaddr,
            std::mem::size_of::<sockaddr_in>() as socklen_t,
        )
    };
    // Forced-nonblock socket: immediate success or connect-in-progress.
    assert!(
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EINPROGRESS),
        "connect: {}",
        std::io::Error::last_os_error()
    );

    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let ev = events.clone();
    iom.add_event_cb(fd, IoEvent::READ, move || {
        ev.lock().unwrap().push("read");
    })
    .unwrap();

    let ev = events.clone();
    iom.add_event_cb(fd, IoEvent::WRITE, move || {
        ev.lock().unwrap().push("write");
        // Runs on a hook-enabled worker: close cancels the READ waiter.
        hook::close(fd);
    })
    .unwrap();

    wait_until(Duration::from_secs(5), "both waiters", || {
        events.lock().unwrap().len() == 2
    });
    assert_eq!(*events.lock().unwrap(), vec!["write", "read"]);
    assert_eq!(iom.pending_event_count(), 0);
    iom.stop();
}

/// An fd that existed before any io manager acquires its metadata on the
/// first hooked call and works.
#[test]
fn test_preexisting_fd_acquires_meta_lazily() {
    init_logs();
    let mut fds = [0 as c_int; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let n = unsafe { libc::write(fds[1], b"hello".as_ptr() as *const c_void, 5) };
    assert_eq!(n, 5);

    let iom = IoManager::new(1, false, "t-lazyfd");
    let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let g = got.clone();
    iom.schedule(weft::Task::call(move || {
        let mut buf = [0u8; 16];
        let n = unsafe { hook::recv(fds[0], buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        assert_eq!(n, 5);
        *g.lock().unwrap() = Some(buf[..5].to_vec());
    }))
    .unwrap();

    wait_until(Duration::from_secs(5), "recv", || got.lock().unwrap().is_some());
    assert_eq!(got.lock().unwrap().as_deref(), Some(&b"hello"[..]));
    iom.stop();
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}

/// Blocked hooked recv is woken by data arriving from a plain std peer.
#[test]
fn test_hooked_recv_blocks_until_data() {
    init_logs();
    let iom = IoManager::new(2, false, "t-recvwake");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let sin = sockaddr_of(&listener);

    let state: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let s = state.clone();
    iom.schedule(weft::Task::call(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let rc = unsafe {
            hook::connect(
                fd,
                &sin as *const sockaddr_in as *const sockaddr,
                std::mem::size_of::<sockaddr_in>() as socklen_t,
            )
        };
        assert_eq!(rc, 0, "loopback connect");
        s.lock().unwrap().push("connected".into());

        let mut buf = [0u8; 32];
        let n = unsafe { hook::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        assert_eq!(n, 4);
        s.lock()
            .unwrap()
            .push(String::from_utf8_lossy(&buf[..4]).into_owned());
        hook::close(fd);
    }))
    .unwrap();

    let (peer, _) = listener.accept().unwrap();
    wait_until(Duration::from_secs(5), "fiber connected", || {
        !state.lock().unwrap().is_empty()
    });
    // Let the fiber reach the recv and park.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(state.lock().unwrap().len(), 1, "recv must be parked");

    use std::io::Write;
    let mut peer = peer;
    peer.write_all(b"ping").unwrap();

    wait_until(Duration::from_secs(5), "recv woke", || {
        state.lock().unwrap().len() == 2
    });
    assert_eq!(state.lock().unwrap()[1], "ping");
    drop(peer);
    drop(listener);
    iom.stop();
}

/// Writes larger than the kernel buffer park the sender until the peer
/// drains; total bytes arrive intact.
#[test]
fn test_hooked_send_handles_backpressure() {
    init_logs();
    let iom = IoManager::new(2, false, "t-sendwake");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let sin = sockaddr_of(&listener);

    const TOTAL: usize = 4 * 1024 * 1024;
    let sent = Arc::new(Mutex::new(0usize));
    let s = sent.clone();
    iom.schedule(weft::Task::call(move || {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        let rc = unsafe {
            hook::connect(
                fd,
                &sin as *const sockaddr_in as *const sockaddr,
                std::mem::size_of::<sockaddr_in>() as socklen_t,
            )
        };
        assert_eq!(rc, 0);

        let chunk = vec![0x5Au8; 64 * 1024];
        let mut total = 0usize;
        while total < TOTAL {
            let want = chunk.len().min(TOTAL - total);
            let n = unsafe { hook::send(fd, chunk.as_ptr() as *const c_void, want, 0) };
            assert!(n > 0, "send failed: {}", std::io::Error::last_os_error());
            total += n as usize;
        }
        hook::close(fd);
        *s.lock().unwrap() = total;
    }))
    .unwrap();

    use std::io::Read;
    let (mut peer, _) = listener.accept().unwrap();
    let mut received = 0usize;
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = peer.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        received += n;
    }
    assert_eq!(received, TOTAL);
    wait_until(Duration::from_secs(5), "sender done", || {
        *sent.lock().unwrap() == TOTAL
    });
    iom.stop();
}
