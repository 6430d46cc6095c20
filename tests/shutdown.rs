mod common;

use common::{free_port, init_test_logging, wait_until};
use evnet::{EventLoop, MemoryPool, TcpServer};

use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

/// Stop with connections in flight and writes still queued: stop()
/// returns only once every IO thread is joined, the registry is empty,
/// and the pool is back to quiescence.
#[test]
fn stop_with_pending_writes_releases_everything() {
    const CLIENTS: usize = 20;

    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let port = free_port();
    let server =
        TcpServer::new(base_loop.clone(), "127.0.0.1", port, 3, "teardown").expect("server");
    server.set_message_callback(|conn, buf| {
        let len = buf.length();
        buf.pop(len).expect("pop");
        // Queue far more than the socket buffer takes so output sits
        // pending when the server stops.
        let payload = vec![0x5Au8; 64 * 1024];
        for _ in 0..4 {
            conn.send(&payload);
        }
    });
    server.start().expect("start");

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        client.write_all(b"fill").expect("write");
        // Deliberately never read.
        clients.push(client);
    }

    assert!(
        wait_until(Duration::from_secs(3), || {
            server.connection_count() == CLIENTS
        }),
        "all clients should be registered, got {}",
        server.connection_count()
    );

    server.stop();

    assert_eq!(server.connection_count(), 0);
    assert!(
        wait_until(Duration::from_secs(2), || {
            MemoryPool::instance().get_current_usage() == 0
        }),
        "pool usage should be 0 after stop, got {}",
        MemoryPool::instance().get_current_usage()
    );

    // A second stop is a no-op.
    server.stop();

    drop(clients);
    base_loop.stop();
    loop_thread.join().expect("join base loop");
}
