mod common;

use common::{free_port, init_test_logging, wait_until};
use evnet::{EventLoop, TcpServer};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn echo_round_trip_and_clean_close() {
    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let port = free_port();
    let server =
        TcpServer::new(base_loop.clone(), "127.0.0.1", port, 2, "echo").expect("server");
    server.set_message_callback(|conn, buf| {
        let bytes = buf.get_from_buf().to_vec();
        buf.pop(bytes.len()).expect("pop");
        conn.send(&bytes);
    });
    server.start().expect("start");

    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    client.write_all(b"hello\n").expect("write");

    let mut echoed = [0u8; 6];
    client.read_exact(&mut echoed).expect("read");
    assert_eq!(&echoed, b"hello\n");

    assert_eq!(server.connection_count(), 1);
    drop(client);

    assert!(
        wait_until(Duration::from_secs(2), || server.connection_count() == 0),
        "connection count should return to 0 after the client closes"
    );

    server.stop();
    base_loop.stop();
    loop_thread.join().expect("join base loop");
}

#[test]
fn connection_callback_fires_on_establish_and_close() {
    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let port = free_port();
    let server =
        TcpServer::new(base_loop.clone(), "127.0.0.1", port, 1, "lifecycle").expect("server");

    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let log = events.clone();
    server.set_connection_callback(move |conn| {
        log.lock().unwrap().push(conn.is_connected());
    });
    server.start().expect("start");

    let client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    assert!(wait_until(Duration::from_secs(2), || {
        events.lock().unwrap().first() == Some(&true)
    }));
    drop(client);

    assert!(
        wait_until(Duration::from_secs(2), || events.lock().unwrap().len() == 2),
        "connection callback should fire a second time on close"
    );
    assert_eq!(*events.lock().unwrap(), vec![true, false]);

    server.stop();
    base_loop.stop();
    loop_thread.join().expect("join base loop");
}

#[test]
fn data_callback_sees_the_received_bytes() {
    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let port = free_port();
    let server =
        TcpServer::new(base_loop.clone(), "127.0.0.1", port, 1, "data-cb").expect("server");

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    server.set_data_callback(move |_conn, data| {
        sink.lock().unwrap().extend_from_slice(data);
    });
    // The data callback is sugar over message; the message callback
    // still owns consumption.
    server.set_message_callback(|_conn, buf| {
        let len = buf.length();
        buf.pop(len).expect("pop");
    });
    server.start().expect("start");

    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    client.write_all(b"payload bytes").expect("write");

    assert!(wait_until(Duration::from_secs(2), || {
        seen.lock().unwrap().len() == 13
    }));
    assert_eq!(&*seen.lock().unwrap(), b"payload bytes");

    drop(client);
    server.stop();
    base_loop.stop();
    loop_thread.join().expect("join base loop");
}

#[test]
fn panicking_user_callback_does_not_kill_the_loop() {
    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let port = free_port();
    let server =
        TcpServer::new(base_loop.clone(), "127.0.0.1", port, 1, "barrier").expect("server");
    server.set_message_callback(|conn, buf| {
        let bytes = buf.get_from_buf().to_vec();
        buf.pop(bytes.len()).expect("pop");
        if bytes.starts_with(b"boom") {
            panic!("user callback exploded");
        }
        conn.send(&bytes);
    });
    server.start().expect("start");

    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    client.write_all(b"boom").expect("write");
    // Give the panic time to unwind through the barrier.
    thread::sleep(Duration::from_millis(200));

    client.write_all(b"still alive").expect("write");
    let mut echoed = [0u8; 11];
    client.read_exact(&mut echoed).expect("read after panic");
    assert_eq!(&echoed, b"still alive");

    drop(client);
    server.stop();
    base_loop.stop();
    loop_thread.join().expect("join base loop");
}
