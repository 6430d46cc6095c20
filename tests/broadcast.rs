mod common;

use common::{free_port, init_test_logging, wait_until};
use evnet::{EventLoop, MemoryPool, TcpServer};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

/// Two clients ping concurrently; each byte in earns "ping" back, and
/// the pool returns to quiescence once everyone disconnects.
#[test]
fn two_clients_get_pinged_and_pool_drains() {
    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let port = free_port();
    let server =
        TcpServer::new(base_loop.clone(), "127.0.0.1", port, 2, "broadcast").expect("server");
    server.set_message_callback(|conn, buf| {
        let len = buf.length();
        buf.pop(len).expect("pop");
        // One reply per message event regardless of its size.
        conn.send(b"ping");
    });
    server.start().expect("start");

    const ROUNDS: usize = 8;
    let mut clients = Vec::new();
    for _ in 0..2 {
        clients.push(thread::spawn(move || {
            let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
            let mut received = 0usize;
            for _ in 0..ROUNDS {
                client.write_all(b"poke").expect("write");
                let mut reply = [0u8; 4];
                client.read_exact(&mut reply).expect("read");
                assert_eq!(&reply, b"ping");
                received += reply.len();
            }
            received
        }));
    }

    for client in clients {
        let received = client.join().expect("client thread");
        assert_eq!(received, 4 * ROUNDS);
    }

    assert!(
        wait_until(Duration::from_secs(2), || server.connection_count() == 0),
        "both connections should be gone"
    );
    assert!(
        wait_until(Duration::from_secs(2), || {
            MemoryPool::instance().get_current_usage() == 0
        }),
        "pool usage should return to 0 after disconnect, got {}",
        MemoryPool::instance().get_current_usage()
    );

    server.stop();
    base_loop.stop();
    loop_thread.join().expect("join base loop");
}
