//! End to end scenarios against a running daemon.
//!
//! Every test binds ephemeral ports (base port 0), connects its clients
//! before starting the pipeline, and drives the daemon from a file or a
//! scripted TCP server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use tracemux::daemon::{Config, Daemon, SourceKind};

const SYNC: [u8; 4] = [0xff, 0xff, 0xff, 0x7f];

/// Give the accept threads a moment to register freshly connected
/// clients before data starts flowing.
fn settle() {
    thread::sleep(Duration::from_millis(300));
}

fn file_config(path: &Path, channels: Vec<u8>) -> Config {
    Config {
        source: SourceKind::File {
            path: path.display().to_string(),
            terminate: true,
        },
        listen_port: 0,
        channels,
        orbflow_port: None,
        interval_ms: 0,
        data_speed: None,
    }
}

#[test]
fn file_passthrough_delivers_every_byte() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("trace.bin");
    let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
    std::fs::write(&path, &data)?;

    let daemon = Daemon::new(file_config(&path, vec![]))?;
    let mut client = TcpStream::connect(("127.0.0.1", daemon.listen_ports()[0]))?;
    settle();
    let h = thread::spawn(move || daemon.run());

    let mut got = Vec::new();
    client.read_to_end(&mut got)?;
    assert_eq!(got, data);
    h.join().unwrap()?;
    Ok(())
}

#[test]
fn tpiu_demux_to_channel_ports() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tpiu.bin");
    // Stream 1 carries "AB", stream 2 carries "CD", repeated 16 times.
    let frame: [u8; 16] = [
        0x03, b'A', 0x03, b'B', 0x05, b'C', 0x05, b'D', 0xff, 0, 0, 0, 0, 0,
        0, 0,
    ];
    let mut data = Vec::new();
    for _ in 0..16 {
        data.extend(SYNC);
        data.extend(frame);
    }
    std::fs::write(&path, &data)?;

    let daemon = Daemon::new(file_config(&path, vec![1, 2]))?;
    let ports = daemon.listen_ports().to_vec();
    let mut c1 = TcpStream::connect(("127.0.0.1", ports[0]))?;
    let mut c2 = TcpStream::connect(("127.0.0.1", ports[1]))?;
    settle();
    let h = thread::spawn(move || daemon.run());

    let mut got = Vec::new();
    c1.read_to_end(&mut got)?;
    assert_eq!(got, b"AB".repeat(16));
    got.clear();
    c2.read_to_end(&mut got)?;
    assert_eq!(got, b"CD".repeat(16));
    h.join().unwrap()?;
    Ok(())
}

#[test]
fn tpiu_resyncs_after_garbage() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("garbage.bin");
    let garbage: [u8; 8] = rand::random();
    let mut data = garbage.to_vec();
    data.extend(SYNC);
    // One data byte 0x42 on stream 1, idle padding.
    data.extend([
        0x03, 0x42, 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ]);
    std::fs::write(&path, &data)?;

    let daemon = Daemon::new(file_config(&path, vec![1]))?;
    let mut c1 = TcpStream::connect(("127.0.0.1", daemon.listen_ports()[0]))?;
    settle();
    let h = thread::spawn(move || daemon.run());

    let mut got = Vec::new();
    c1.read_to_end(&mut got)?;
    assert_eq!(got, vec![0x42]);
    h.join().unwrap()?;
    Ok(())
}

#[test]
fn unconfigured_channel_is_filtered_out() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("filtered.bin");
    let mut data = SYNC.to_vec();
    // Stream 5 chatter; nobody asked for it.
    data.extend([
        0x0b, 0x41, 0x0b, 0x42, 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ]);
    std::fs::write(&path, &data)?;

    let daemon = Daemon::new(file_config(&path, vec![1]))?;
    let mut c1 = TcpStream::connect(("127.0.0.1", daemon.listen_ports()[0]))?;
    settle();
    let h = thread::spawn(move || daemon.run());

    let mut got = Vec::new();
    c1.read_to_end(&mut got)?;
    assert!(got.is_empty());
    h.join().unwrap()?;
    Ok(())
}

#[test]
fn orbflow_mux_end_to_end() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("orbflow.bin");
    let mut data = SYNC.to_vec();
    // Stream 3 carries "hi".
    data.extend([
        0x07, b'h', 0x07, b'i', 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ]);
    std::fs::write(&path, &data)?;

    let mut cfg = file_config(&path, vec![3]);
    cfg.orbflow_port = Some(0);
    let daemon = Daemon::new(cfg)?;
    let mut raw = TcpStream::connect(("127.0.0.1", daemon.listen_ports()[0]))?;
    let mut flow =
        TcpStream::connect(("127.0.0.1", daemon.orbflow_port().unwrap()))?;
    settle();
    let h = thread::spawn(move || daemon.run());

    let mut got = Vec::new();
    raw.read_to_end(&mut got)?;
    assert_eq!(got, b"hi");

    got.clear();
    flow.read_to_end(&mut got)?;
    let mut dec = tracemux::orbflow::OrbflowDecoder::new();
    let mut frames = Vec::new();
    dec.pump(&got, &mut |f| frames.push((f.tag, f.payload.to_vec(), f.good)));
    assert_eq!(frames, vec![(3, b"hi".to_vec(), true)]);
    h.join().unwrap()?;
    Ok(())
}

/// Read until end of file, tolerating read timeouts on the way.
fn read_remainder(client: &mut TcpStream, deadline: Instant) -> Vec<u8> {
    let mut buf = [0u8; 4096];
    let mut got = Vec::new();
    loop {
        assert!(Instant::now() < deadline, "no EOF from the daemon");
        match client.read(&mut buf) {
            Ok(0) => return got,
            Ok(n) => got.extend(&buf[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("client read: {e}"),
        }
    }
}

#[test]
fn segger_source_reconnects_without_inventing_bytes() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let server_port = listener.local_addr()?.port();
    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let (mut s, _) = listener.accept().unwrap();
        s.write_all(b"before").unwrap();
        drop(s); // Connection lost mid-stream.
        let (mut s, _) = listener.accept().unwrap();
        s.write_all(b"after").unwrap();
        // Stay up until the test is done collecting.
        let _ = hold_rx.recv();
    });

    let cfg = Config {
        source: SourceKind::Segger {
            host: "127.0.0.1".into(),
            port: server_port,
        },
        listen_port: 0,
        channels: vec![],
        orbflow_port: None,
        interval_ms: 0,
        data_speed: None,
    };
    let daemon = Daemon::new(cfg)?;
    let mut client = TcpStream::connect(("127.0.0.1", daemon.listen_ports()[0]))?;
    client.set_read_timeout(Some(Duration::from_millis(100)))?;
    settle();
    let cancel = daemon.cancel_token();
    let h = thread::spawn(move || daemon.run());

    // "before" and "after" arrive with a reconnect in between; nothing
    // may be injected around the gap.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut got: Vec<u8> = Vec::new();
    let mut buf = [0u8; 64];
    while got.len() < b"beforeafter".len() {
        assert!(Instant::now() < deadline, "so far: {got:?}");
        match client.read(&mut buf) {
            Ok(0) => panic!("daemon hung up early"),
            Ok(n) => got.extend(&buf[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("client read: {e}"),
        }
    }
    assert_eq!(got, b"beforeafter");

    let _ = hold_tx.send(());
    cancel.cancel();
    h.join().unwrap()?;
    let extra = read_remainder(&mut client, Instant::now() + Duration::from_secs(5));
    assert!(extra.is_empty(), "bytes after shutdown: {extra:?}");
    server.join().unwrap();
    Ok(())
}

#[test]
fn file_tail_keeps_following_until_cancelled() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tail.bin");
    std::fs::write(&path, b"first")?;

    let mut cfg = file_config(&path, vec![]);
    cfg.source = SourceKind::File {
        path: path.display().to_string(),
        terminate: false,
    };
    let daemon = Daemon::new(cfg)?;
    let mut client = TcpStream::connect(("127.0.0.1", daemon.listen_ports()[0]))?;
    client.set_read_timeout(Some(Duration::from_millis(100)))?;
    settle();
    let cancel = daemon.cancel_token();
    let h = thread::spawn(move || daemon.run());

    // Append while the daemon is tailing.
    thread::sleep(Duration::from_millis(400));
    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)?
        .write_all(b" second")?;

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut got: Vec<u8> = Vec::new();
    let mut buf = [0u8; 64];
    while got.len() < b"first second".len() {
        assert!(Instant::now() < deadline, "so far: {got:?}");
        match client.read(&mut buf) {
            Ok(0) => panic!("daemon hung up early"),
            Ok(n) => got.extend(&buf[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("client read: {e}"),
        }
    }
    assert_eq!(got, b"first second");
    cancel.cancel();
    h.join().unwrap()?;
    Ok(())
}
