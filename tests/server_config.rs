mod common;

use common::{free_port, init_test_logging};
use evnet::{Error, EventLoop, TcpServer};

use std::thread;

#[test]
fn zero_port_is_rejected() {
    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let result = TcpServer::new(base_loop, "127.0.0.1", 0, 1, "bad-port");
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[test]
fn invalid_ip_is_rejected() {
    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let result = TcpServer::new(base_loop, "not-an-ip", 8080, 1, "bad-ip");
    assert!(matches!(result, Err(Error::Configuration(_))));

    let base_loop = EventLoop::new().expect("base loop");
    let result = TcpServer::new(base_loop, "::1", 8080, 1, "v6-ip");
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[test]
fn double_start_is_a_noop() {
    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let port = free_port();
    let server =
        TcpServer::new(base_loop.clone(), "127.0.0.1", port, 1, "double").expect("server");
    server.start().expect("first start");
    server.start().expect("second start is a warning, not an error");

    server.stop();
    base_loop.stop();
    loop_thread.join().expect("join base loop");
}

#[test]
fn restart_after_stop_accepts_again() {
    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let port = free_port();
    let server =
        TcpServer::new(base_loop.clone(), "127.0.0.1", port, 1, "restart").expect("server");
    server.start().expect("first start");
    std::net::TcpStream::connect(("127.0.0.1", port)).expect("connect while up");
    server.stop();

    server.start().expect("restart");
    std::net::TcpStream::connect(("127.0.0.1", port)).expect("connect after restart");

    server.stop();
    base_loop.stop();
    loop_thread.join().expect("join base loop");
}
