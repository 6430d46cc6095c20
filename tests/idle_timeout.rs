mod common;

use common::{free_port, init_test_logging};
use evnet::{EventLoop, TcpServer};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn start_idle_server(port: u16, base_loop: &Arc<EventLoop>) -> Arc<TcpServer> {
    let server =
        TcpServer::new(base_loop.clone(), "127.0.0.1", port, 1, "idle").expect("server");
    server.set_message_callback(|_conn, buf| {
        let len = buf.length();
        buf.pop(len).expect("pop");
    });
    server.enable_idle_timeout(true);
    server.set_idle_timeout(2000);
    server.start().expect("start");
    server
}

/// Reads until EOF and reports how long the connection survived.
fn time_to_eof(client: &mut TcpStream) -> Duration {
    let started = Instant::now();
    let mut buf = [0u8; 64];
    loop {
        match client.read(&mut buf) {
            Ok(0) => return started.elapsed(),
            Ok(_) => continue,
            Err(err) => panic!("unexpected read error: {err}"),
        }
    }
}

#[test]
fn idle_connection_is_evicted_within_the_window() {
    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };
    let port = free_port();
    let server = start_idle_server(port, &base_loop);

    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    client.write_all(b"x").expect("write");
    let survived = time_to_eof(&mut client);

    // 2000 ms timeout, 1000 ms tick: the eviction lands after the
    // deadline but within a couple of ticks of it.
    assert!(
        survived >= Duration::from_millis(1900),
        "evicted too early: {survived:?}"
    );
    assert!(
        survived <= Duration::from_millis(4500),
        "evicted too late: {survived:?}"
    );

    drop(client);
    server.stop();
    base_loop.stop();
    loop_thread.join().expect("join base loop");
}

#[test]
fn activity_postpones_eviction() {
    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };
    let port = free_port();
    let server = start_idle_server(port, &base_loop);

    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    client.write_all(b"x").expect("write");

    // Touch the connection at 1500 ms; the idle clock restarts, so the
    // eviction may not land before 3500 ms from the start.
    thread::sleep(Duration::from_millis(1500));
    let touched_at = Instant::now();
    client.write_all(b"y").expect("write");

    let survived_after_touch = {
        let mut buf = [0u8; 64];
        loop {
            match client.read(&mut buf) {
                Ok(0) => break touched_at.elapsed(),
                Ok(_) => continue,
                Err(err) => panic!("unexpected read error: {err}"),
            }
        }
    };

    assert!(
        survived_after_touch >= Duration::from_millis(1900),
        "activity did not restart the idle clock: {survived_after_touch:?}"
    );

    drop(client);
    server.stop();
    base_loop.stop();
    loop_thread.join().expect("join base loop");
}
