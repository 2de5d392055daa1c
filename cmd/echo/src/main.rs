//! Echo server on the weft runtime
//!
//! Accepts TCP connections and echoes bytes back, written in plain
//! blocking style: every connection gets a fiber, and the hooked syscalls
//! turn would-block reads into cooperative yields.
//!
//! ```text
//! cargo run -p weft-echo
//! # then: nc 127.0.0.1 8099
//! ```

use std::mem;

use libc::{c_int, c_void, sockaddr, sockaddr_in, socklen_t};
use weft::{hook, IoManager, Task};

const PORT: u16 = 8099;

fn listen_socket(port: u16) -> c_int {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    assert!(fd >= 0, "socket failed");

    let one: c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const c_int as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        );
    }

    let mut addr: sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::LOCALHOST).to_be();

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const sockaddr_in as *const sockaddr,
            mem::size_of::<sockaddr_in>() as socklen_t,
        )
    };
    assert_eq!(rc, 0, "bind failed");
    assert_eq!(unsafe { libc::listen(fd, 128) }, 0, "listen failed");
    fd
}

fn serve_connection(fd: c_int) {
    log::info!("client fd={} connected", fd);
    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { hook::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if n <= 0 {
            break;
        }
        let mut off = 0usize;
        while off < n as usize {
            let m = unsafe {
                hook::send(
                    fd,
                    buf[off..].as_ptr() as *const c_void,
                    n as usize - off,
                    0,
                )
            };
            if m <= 0 {
                log::warn!("client fd={} send failed", fd);
                hook::close(fd);
                return;
            }
            off += m as usize;
        }
    }
    log::info!("client fd={} disconnected", fd);
    hook::close(fd);
}

fn accept_loop() {
    let listener = listen_socket(PORT);
    log::info!("echo server listening on 127.0.0.1:{}", PORT);

    let iom = IoManager::current().expect("accept loop must run on an io manager worker");
    loop {
        let fd = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            log::error!("accept failed: {}", std::io::Error::last_os_error());
            continue;
        }
        if let Err(e) = iom.schedule(Task::call(move || serve_connection(fd))) {
            log::error!("dropping client fd={}: {}", fd, e);
            hook::close(fd);
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let iom = IoManager::new(4, true, "echo");
    iom.schedule(Task::call(accept_loop)).unwrap();
    iom.stop();
}
