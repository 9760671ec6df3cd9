//! wire-echo — echo server / pingpong client over ringwire.
//!
//! Single-threaded echo server driven by the ringwire dispatch loop,
//! plus a blocking pingpong client for round-trip checks.
//!
//! Usage:
//!     wire-echo server [port]
//!     wire-echo client [host:port] [rounds]
//!
//! Test with:
//!     # Terminal 1:
//!     wire-echo server 9999
//!     # Terminal 2:
//!     wire-echo client 127.0.0.1:9999 10000
//!     # Or just:
//!     echo "hello" | nc localhost 9999

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Instant;

use ringwire::{ConnCtx, DataAction, Framer, ServerConfig, ServerHandler, WireBuf, WireServer};

struct EchoStats {
    connects: u64,
    disconnects: u64,
    messages: u64,
    bytes: u64,
}

struct Echo {
    stats: EchoStats,
}

impl ServerHandler for Echo {
    fn on_connect(&mut self, conn: &mut ConnCtx<'_>) {
        self.stats.connects += 1;
        eprintln!("wire-echo: conn {} up", conn.id());
    }

    fn on_data(&mut self, _conn: &mut ConnCtx<'_>, _buf: &mut WireBuf, len: usize) -> DataAction {
        self.stats.messages += 1;
        self.stats.bytes += len as u64;
        DataAction::Reply(len)
    }

    fn on_disconnect(&mut self, conn_id: u32) {
        self.stats.disconnects += 1;
        eprintln!(
            "wire-echo: conn {} down ({} msgs, {} bytes so far)",
            conn_id, self.stats.messages, self.stats.bytes
        );
    }
}

fn run_server(port: u16) {
    let config = ServerConfig::from_env().host("0.0.0.0").port(port);
    let handler = Echo {
        stats: EchoStats {
            connects: 0,
            disconnects: 0,
            messages: 0,
            bytes: 0,
        },
    };
    let mut server = match WireServer::new(config, handler) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("wire-echo: server setup failed: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = server.run() {
        eprintln!("wire-echo: server error: {}", e);
        std::process::exit(1);
    }
}

fn run_client(target: &str, rounds: u64) {
    let mut stream = match TcpStream::connect(target) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("wire-echo: connect to {} failed: {}", target, e);
            std::process::exit(1);
        }
    };
    stream.set_nodelay(true).ok();

    // Framed payload so the round trip also exercises the framing
    // helper on the client side.
    let framer = Framer::default();
    let payload = 12_345_678u32.to_be_bytes();
    let mut frame = [0u8; 64];
    let frame_len = framer.frame(&payload, &mut frame).expect("frame");

    let start = Instant::now();
    let mut echo = [0u8; 64];
    for i in 0..rounds {
        if let Err(e) = stream.write_all(&frame[..frame_len]) {
            eprintln!("wire-echo: write failed at round {}: {}", i, e);
            std::process::exit(1);
        }
        if let Err(e) = stream.read_exact(&mut echo[..frame_len]) {
            eprintln!("wire-echo: read failed at round {}: {}", i, e);
            std::process::exit(1);
        }
    }
    let elapsed = start.elapsed();

    // Sanity: the last echo must deframe back to the payload.
    let mut out = [0u8; 64];
    match framer.deframe(&echo[..frame_len], &mut out) {
        Ok(ringwire::Deframed::Payload(n)) => {
            assert_eq!(&out[..n], &payload);
        }
        other => {
            eprintln!("wire-echo: bad echo: {:?}", other);
            std::process::exit(1);
        }
    }

    let per_round_us = elapsed.as_micros() as f64 / rounds as f64;
    println!(
        "wire-echo: {} round trips in {:?} ({:.2} µs/rt)",
        rounds, elapsed, per_round_us
    );
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("server") => {
            let port = args
                .get(2)
                .and_then(|p| p.parse().ok())
                .unwrap_or(9999u16);
            run_server(port);
        }
        Some("client") => {
            let target = args.get(2).map(String::as_str).unwrap_or("127.0.0.1:9999");
            let rounds = args.get(3).and_then(|r| r.parse().ok()).unwrap_or(1000u64);
            run_client(target, rounds);
        }
        _ => {
            eprintln!("usage: wire-echo server [port] | wire-echo client [host:port] [rounds]");
            std::process::exit(2);
        }
    }
}
