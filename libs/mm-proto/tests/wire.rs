//! End-to-end protocol exchanges against an in-process server over real TCP
//! sockets.

use mm_runtime::{Config as RtConfig, Handle, Runtime};
use mm_store::{Config as StoreConfig, Strategy, Table};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

struct Server {
    addr: SocketAddr,
    handle: Handle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Server {
    fn start(strategy: Strategy) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_thread_names(true)
            .try_init();

        let (tx, rx) = std::sync::mpsc::channel();

        let thread = std::thread::spawn(move || {
            let runtime = Runtime::new(RtConfig {
                cores: 2,
                max_workers: 16,
                ring_capacity: 256,
            })
            .unwrap();
            let handle = runtime.handle();

            let table = Table::new(
                StoreConfig {
                    partitions: 4,
                    volume: 16 << 20,
                    strategy,
                    ..StoreConfig::default()
                },
                handle.clone(),
            );

            let init_handle = handle.clone();
            runtime.run(async move {
                let listener = mm_runtime::net::TcpListener::bind("127.0.0.1:0").unwrap();
                let addr = listener.local_addr().unwrap();
                tx.send((addr, init_handle.clone())).unwrap();
                mm_proto::serve(table, listener, init_handle).await;
            });
        });

        let (addr, handle) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        Self {
            addr,
            handle,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }

    /// Sends `input` and asserts the connection yields exactly `expected`.
    fn exchange(&self, input: &[u8], expected: &[u8]) {
        let mut stream = self.connect();
        stream.write_all(input).unwrap();

        let mut got = vec![0u8; expected.len()];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(
            got,
            expected,
            "\n got: {:?}\nwant: {:?}",
            String::from_utf8_lossy(&got),
            String::from_utf8_lossy(expected)
        );
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn read_line(stream: &mut TcpStream) -> Vec<u8> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).unwrap();
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return line;
        }
    }
}

#[test]
fn simple_set_get() {
    let server = Server::start(Strategy::Lock);
    server.exchange(
        b"set foo 7 0 3\r\nbar\r\nget foo\r\n",
        b"STORED\r\nVALUE foo 7 3\r\nbar\r\nEND\r\n",
    );
}

#[test]
fn simple_set_get_delegated() {
    let server = Server::start(Strategy::Delegate);
    server.exchange(
        b"set foo 7 0 3\r\nbar\r\nget foo\r\n",
        b"STORED\r\nVALUE foo 7 3\r\nbar\r\nEND\r\n",
    );
}

#[test]
fn simple_set_get_combined() {
    let server = Server::start(Strategy::Combine);
    server.exchange(
        b"set foo 7 0 3\r\nbar\r\nget foo\r\n",
        b"STORED\r\nVALUE foo 7 3\r\nbar\r\nEND\r\n",
    );
}

#[test]
fn noreply_storage_suppresses_the_reply() {
    let server = Server::start(Strategy::Lock);
    server.exchange(
        b"set x 0 0 1 noreply\r\n1\r\nget x\r\n",
        b"VALUE x 0 1\r\n1\r\nEND\r\n",
    );
}

#[test]
fn cas_mismatch_then_match() {
    let server = Server::start(Strategy::Lock);
    let mut stream = server.connect();

    stream.write_all(b"set k 0 0 1\r\na\r\ngets k\r\n").unwrap();
    assert_eq!(read_line(&mut stream), b"STORED\r\n");

    // VALUE k 0 1 <stamp>\r\n
    let value_line = read_line(&mut stream);
    let text = String::from_utf8(value_line).unwrap();
    let stamp: u64 = text
        .trim_end()
        .rsplit(' ')
        .next()
        .unwrap()
        .parse()
        .unwrap();
    let mut rest = [0u8; 8]; // "a\r\nEND\r\n"
    stream.read_exact(&mut rest).unwrap();
    assert_eq!(&rest, b"a\r\nEND\r\n");

    // stale stamp: EXISTS, value untouched
    stream
        .write_all(format!("cas k 0 0 1 {}\r\nb\r\n", stamp + 1).as_bytes())
        .unwrap();
    assert_eq!(read_line(&mut stream), b"EXISTS\r\n");

    stream.write_all(b"get k\r\n").unwrap();
    assert_eq!(read_line(&mut stream), b"VALUE k 0 1\r\n");
    let mut rest = [0u8; 8];
    stream.read_exact(&mut rest).unwrap();
    assert_eq!(&rest, b"a\r\nEND\r\n");

    // matching stamp: stored, and the fresh stamp is strictly greater
    stream
        .write_all(format!("cas k 0 0 1 {stamp}\r\nb\r\n").as_bytes())
        .unwrap();
    assert_eq!(read_line(&mut stream), b"STORED\r\n");

    stream.write_all(b"gets k\r\n").unwrap();
    let text = String::from_utf8(read_line(&mut stream)).unwrap();
    let new_stamp: u64 = text
        .trim_end()
        .rsplit(' ')
        .next()
        .unwrap()
        .parse()
        .unwrap();
    assert!(new_stamp > stamp);
}

#[test]
fn pipelined_commands_reply_in_parse_order() {
    let server = Server::start(Strategy::Delegate);
    server.exchange(
        b"set a 0 0 1\r\n1\r\nset b 0 0 1\r\n2\r\nget a\r\nget b\r\n",
        b"STORED\r\nSTORED\r\nVALUE a 0 1\r\n1\r\nEND\r\nVALUE b 0 1\r\n2\r\nEND\r\n",
    );
}

#[test]
fn multi_key_get_emits_values_then_end() {
    let server = Server::start(Strategy::Lock);
    server.exchange(
        b"set a 0 0 1\r\n1\r\nset b 0 0 1\r\n2\r\nget a b\r\n",
        b"STORED\r\nSTORED\r\nVALUE a 0 1\r\n1\r\nVALUE b 0 1\r\n2\r\nEND\r\n",
    );
}

#[test]
fn malformed_command_recovers() {
    let server = Server::start(Strategy::Lock);
    server.exchange(
        b"gimme cookies\r\nset k 0 0 1\r\nq\r\n",
        b"ERROR\r\nSTORED\r\n",
    );
}

#[test]
fn delete_is_idempotent() {
    let server = Server::start(Strategy::Lock);
    server.exchange(
        b"set k 0 0 1\r\nv\r\ndelete k\r\ndelete k\r\n",
        b"STORED\r\nDELETED\r\nNOT_FOUND\r\n",
    );
}

#[test]
fn incr_decr_and_non_numeric() {
    let server = Server::start(Strategy::Lock);
    server.exchange(
        b"set k 0 0 1\r\n0\r\nincr k 1\r\n",
        b"STORED\r\n1\r\n",
    );
    server.exchange(
        b"set k 0 0 3\r\nabc\r\nincr k 1\r\n",
        b"STORED\r\nCLIENT_ERROR cannot increment or decrement non-numeric value\r\n",
    );
    server.exchange(
        b"set n 0 0 2\r\n10\r\ndecr n 100\r\n",
        b"STORED\r\n0\r\n",
    );
}

#[test]
fn append_and_prepend() {
    let server = Server::start(Strategy::Lock);
    server.exchange(
        b"set k 0 0 3\r\nmid\r\nappend k 0 0 4\r\n-end\r\nprepend k 0 0 6\r\nstart-\r\nget k\r\n",
        b"STORED\r\nSTORED\r\nSTORED\r\nVALUE k 0 13\r\nstart-mid-end\r\nEND\r\n",
    );
}

#[test]
fn bad_data_chunk_is_a_client_error() {
    let server = Server::start(Strategy::Lock);
    // payload is longer than <bytes> promises
    server.exchange(
        b"set k 0 0 1\r\ntoolong\r\nget k\r\n",
        b"CLIENT_ERROR bad data chunk\r\nEND\r\n",
    );
}

#[test]
fn version_and_unimplemented_stubs() {
    let server = Server::start(Strategy::Lock);

    let mut stream = server.connect();
    stream.write_all(b"version\r\n").unwrap();
    let line = read_line(&mut stream);
    assert!(line.starts_with(b"VERSION "));

    server.exchange(
        b"touch k 0\r\nslabs automove\r\n",
        b"SERVER_ERROR not implemented\r\nSERVER_ERROR not implemented\r\n",
    );
    server.exchange(b"verbosity 1\r\n", b"OK\r\n");
}

#[test]
fn stats_reports_table_and_core_counters() {
    let server = Server::start(Strategy::Lock);
    let mut stream = server.connect();

    stream
        .write_all(b"set k 0 0 1\r\nv\r\nget k\r\nstats\r\n")
        .unwrap();

    let mut fixed = vec![0u8; b"STORED\r\nVALUE k 0 1\r\nv\r\nEND\r\n".len()];
    stream.read_exact(&mut fixed).unwrap();
    assert_eq!(fixed, b"STORED\r\nVALUE k 0 1\r\nv\r\nEND\r\n");

    let mut stats = Vec::new();
    loop {
        let line = read_line(&mut stream);
        let done = line == b"END\r\n";
        stats.push(String::from_utf8(line).unwrap());
        if done {
            break;
        }
    }

    assert!(stats.contains(&"STAT cmd_get 1\r\n".to_string()), "{stats:?}");
    assert!(stats.contains(&"STAT cmd_set 1\r\n".to_string()), "{stats:?}");
    assert!(stats.contains(&"STAT get_hits 1\r\n".to_string()), "{stats:?}");
    assert!(stats.contains(&"STAT curr_items 1\r\n".to_string()), "{stats:?}");
    assert!(
        stats.iter().any(|line| line.starts_with("STAT core0_polls ")),
        "{stats:?}"
    );
    assert!(
        stats.iter().any(|line| line.starts_with("STAT core1_parks ")),
        "{stats:?}"
    );
}

#[test]
fn flush_all_drops_everything() {
    let server = Server::start(Strategy::Delegate);
    server.exchange(
        b"set k 0 0 1\r\nv\r\nflush_all\r\nget k\r\n",
        b"STORED\r\nOK\r\nEND\r\n",
    );
}

#[test]
fn flush_all_drops_everything_under_lock() {
    // Two cores with the Lock strategy: the flush runs on the primary core
    // but half the partitions are homed on core 1, so this exercises the
    // cross-core free deferral end to end.
    let server = Server::start(Strategy::Lock);
    let mut input = Vec::new();
    let mut expected = Vec::new();
    for i in 0..32 {
        input.extend_from_slice(format!("set key-{i} 0 0 1\r\nv\r\n").as_bytes());
        expected.extend_from_slice(b"STORED\r\n");
    }
    input.extend_from_slice(b"flush_all\r\n");
    expected.extend_from_slice(b"OK\r\n");
    for i in 0..32 {
        input.extend_from_slice(format!("get key-{i}\r\n").as_bytes());
        expected.extend_from_slice(b"END\r\n");
    }
    server.exchange(&input, &expected);
}

#[test]
fn quit_flushes_pending_replies_then_closes() {
    let server = Server::start(Strategy::Lock);
    let mut stream = server.connect();
    stream
        .write_all(b"set k 0 0 1\r\nv\r\nquit\r\n")
        .unwrap();

    let mut got = Vec::new();
    stream.read_to_end(&mut got).unwrap();
    assert_eq!(got, b"STORED\r\n");
}

#[test]
fn values_larger_than_a_segment_roundtrip() {
    let server = Server::start(Strategy::Delegate);

    // 40 KiB value: spans multiple receive segments
    let value: Vec<u8> = (0..40 * 1024).map(|i| b'a' + u8::try_from(i % 26).unwrap()).collect();
    let mut input = Vec::new();
    input.extend_from_slice(format!("set big 0 0 {}\r\n", value.len()).as_bytes());
    input.extend_from_slice(&value);
    input.extend_from_slice(b"\r\nget big\r\n");

    let mut expected = Vec::new();
    expected.extend_from_slice(b"STORED\r\n");
    expected.extend_from_slice(format!("VALUE big 0 {}\r\n", value.len()).as_bytes());
    expected.extend_from_slice(&value);
    expected.extend_from_slice(b"\r\nEND\r\n");

    server.exchange(&input, &expected);
}

#[test]
fn junk_flood_disconnects() {
    let server = Server::start(Strategy::Lock);
    let mut stream = server.connect();

    // 2 KiB without a single LF; the server may slam the door while we are
    // still writing, so a write error is fine too
    let junk = vec![b'x'; 2048];
    let _ = stream.write_all(&junk);

    let mut buf = [0u8; 16];
    // server closes without replying
    let got = stream.read(&mut buf).unwrap();
    assert_eq!(got, 0);
}
