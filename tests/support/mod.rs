#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use redlite::config::Config;
use redlite::io::net::Binding;
use redlite::master::{self, MasterServer};
use redlite::redis::RedisServer;
use redlite::replica;

pub fn test_config() -> Config {
    Config {
        port: 0,
        replicaof: None,
        dir: ".".to_string(),
        dbfilename: "no-such-snapshot.rdb".to_string(),
    }
}

/// Boots a master on an ephemeral port and returns its address.
pub fn start_master() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let redis = RedisServer::new(
        &test_config(),
        Binding("127.0.0.1".to_string(), addr.port()),
        true,
    )
    .unwrap();
    let server = MasterServer::new(redis);
    thread::spawn(move || master::serve(listener, server));
    addr
}

/// Boots a replica of `master_addr` on an ephemeral port.
pub fn start_replica(master_addr: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let redis = RedisServer::new(
        &test_config(),
        Binding("127.0.0.1".to_string(), addr.port()),
        false,
    )
    .unwrap();
    replica::start_replication(
        redis.clone(),
        Binding("127.0.0.1".to_string(), master_addr.port()),
    )
    .unwrap();
    thread::spawn(move || replica::serve(listener, redis));
    addr
}

/// Raw RESP test client: sends byte-exact command frames and reads replies
/// back as raw wire text.
pub struct TestClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    pub fn send(&mut self, parts: &[&str]) {
        let mut frame = format!("*{}\r\n", parts.len());
        for part in parts {
            frame.push_str(&format!("${}\r\n{}\r\n", part.len(), part));
        }
        self.writer.write_all(frame.as_bytes()).unwrap();
    }

    /// Asserts that the next bytes on the wire are exactly `expected`.
    pub fn expect(&mut self, expected: &str) {
        let mut buf = vec![0u8; expected.len()];
        self.reader.read_exact(&mut buf).unwrap();
        assert_eq!(String::from_utf8_lossy(&buf), expected);
    }

    pub fn roundtrip(&mut self, parts: &[&str], expected: &str) {
        self.send(parts);
        self.expect(expected);
    }

    /// Reads one complete reply and returns it as raw wire text.
    pub fn read_reply(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        let body = line.trim_end().to_string();
        match body.as_bytes().first().copied() {
            Some(b'+') | Some(b'-') | Some(b':') => line,
            Some(b'$') => {
                let len: i64 = body[1..].parse().unwrap();
                if len < 0 {
                    return line;
                }
                let mut buf = vec![0u8; len as usize + 2];
                self.reader.read_exact(&mut buf).unwrap();
                line + &String::from_utf8_lossy(&buf)
            }
            Some(b'*') => {
                let count: usize = body[1..].parse().unwrap();
                let mut reply = line;
                for _ in 0..count {
                    reply += &self.read_reply();
                }
                reply
            }
            _ => panic!("unexpected reply line: {:?}", line),
        }
    }

    /// Polls a command until its raw reply matches, panicking on deadline.
    pub fn poll_until(&mut self, parts: &[&str], expected: &str, deadline: Duration) {
        let started = Instant::now();
        loop {
            self.send(parts);
            let reply = self.read_reply();
            if reply == expected {
                return;
            }
            if started.elapsed() > deadline {
                panic!(
                    "gave up waiting for {:?} to reply {:?}, last reply {:?}",
                    parts, expected, reply
                );
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}
