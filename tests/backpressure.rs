mod common;

use common::{free_port, init_test_logging};
use evnet::{EventLoop, TcpServer};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

/// A slow reader forces the server to park writes in the output buffer;
/// `send` keeps succeeding, write interest drains the backlog, and
/// every byte arrives.
#[test]
fn slow_reader_is_absorbed_by_the_output_buffer() {
    const CHUNK: usize = 64 * 1024;
    const CHUNKS: usize = 8;

    init_test_logging();
    let base_loop = EventLoop::new().expect("base loop");
    let loop_thread = {
        let base_loop = base_loop.clone();
        thread::spawn(move || base_loop.run())
    };

    let port = free_port();
    let server =
        TcpServer::new(base_loop.clone(), "127.0.0.1", port, 1, "backpressure").expect("server");
    server.set_message_callback(|conn, buf| {
        let len = buf.length();
        buf.pop(len).expect("pop");
        // Blast well past the socket buffer; the remainder must queue.
        let payload = vec![0xABu8; CHUNK];
        for _ in 0..CHUNKS {
            assert!(conn.send(&payload), "send must not fail while connected");
        }
    });
    server.start().expect("start");

    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    client.write_all(b"go").expect("write");

    let mut received = 0usize;
    let mut buf = vec![0u8; 4096];
    while received < CHUNK * CHUNKS {
        let n = client.read(&mut buf).expect("read");
        assert!(n > 0, "connection closed before the backlog drained");
        assert!(buf[..n].iter().all(|&b| b == 0xAB));
        received += n;
        // Read slowly enough that the server outpaces us.
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(received, CHUNK * CHUNKS);

    drop(client);
    server.stop();
    base_loop.stop();
    loop_thread.join().expect("join base loop");
}
