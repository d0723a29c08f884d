/*! Network fan-out sink.

One `FanoutServer` per served channel: a listening TCP socket, an accept
thread, and one writer thread per connected client. `send` hands a block
to every client through a bounded queue and never blocks the caller; a
client that cannot keep up is disconnected. Client I/O trouble stays in
here and is never surfaced to the distribution loop.
*/
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::Result;

/// Blocks queued per client before it counts as too slow.
const CLIENT_QUEUE_BLOCKS: usize = 256;

/// Poll interval of the nonblocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Give a wedged client this long per write before giving up on it.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct Client {
    tx: SyncSender<Arc<[u8]>>,
    peer: SocketAddr,
}

struct Shared {
    clients: Mutex<Vec<Client>>,
    ending: AtomicBool,
    accepted: AtomicU64,
    dropped_slow: AtomicU64,
    send_errors: AtomicU64,
}

/// A listening port broadcasting pushed blocks to all its clients.
pub struct FanoutServer {
    shared: Arc<Shared>,
    local_port: u16,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl FanoutServer {
    /// Bind `port` (0 picks an ephemeral port) and start accepting.
    pub fn start(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let local_port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;
        let shared = Arc::new(Shared {
            clients: Mutex::new(Vec::new()),
            ending: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            dropped_slow: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        });
        let accept_thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("accept-{local_port}"))
                .spawn(move || accept_loop(&listener, &shared))?
        };
        info!("Listening on port {local_port}");
        Ok(Self {
            shared,
            local_port,
            accept_thread: Some(accept_thread),
        })
    }

    /// The port actually bound.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Currently connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().expect("client list poisoned").len()
    }

    /// Clients accepted over the server's lifetime.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.shared.accepted.load(Ordering::Relaxed)
    }

    /// Clients disconnected for being too slow.
    #[must_use]
    pub fn dropped_slow(&self) -> u64 {
        self.shared.dropped_slow.load(Ordering::Relaxed)
    }

    /// Client writes that failed (each one costs that client its
    /// connection).
    #[must_use]
    pub fn send_errors(&self) -> u64 {
        self.shared.send_errors.load(Ordering::Relaxed)
    }

    /// Broadcast a block to every connected client. The block is copied
    /// once; per-client delivery is a bounded try-send, so the caller is
    /// never held up by a stuck socket.
    pub fn send(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut clients = self.shared.clients.lock().expect("client list poisoned");
        if clients.is_empty() {
            return;
        }
        let block: Arc<[u8]> = bytes.into();
        clients.retain(|c| match c.tx.try_send(block.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Client {} can't keep up, dropping it", c.peer);
                self.shared.dropped_slow.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Stop accepting and release every client. Queued blocks are still
    /// written out by the client threads before their sockets close.
    pub fn shutdown(&mut self) {
        self.shared.ending.store(true, Ordering::Relaxed);
        if let Some(h) = self.accept_thread.take() {
            let _ = h.join();
        }
        // Dropping the senders lets the writer threads drain and exit.
        self.shared
            .clients
            .lock()
            .expect("client list poisoned")
            .clear();
    }
}

impl Drop for FanoutServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: &TcpListener, shared: &Arc<Shared>) {
    while !shared.ending.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));
                let (tx, rx) = sync_channel(CLIENT_QUEUE_BLOCKS);
                let writer_shared = shared.clone();
                let spawned = thread::Builder::new()
                    .name(format!("client-{peer}"))
                    .spawn(move || writer_loop(stream, &rx, &writer_shared));
                match spawned {
                    Ok(_) => {
                        info!("Accepted client {peer}");
                        shared.accepted.fetch_add(1, Ordering::Relaxed);
                        shared
                            .clients
                            .lock()
                            .expect("client list poisoned")
                            .push(Client { tx, peer });
                    }
                    Err(e) => warn!("Failed to spawn client thread: {e}"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!("accept failed: {e}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn writer_loop(mut stream: TcpStream, rx: &Receiver<Arc<[u8]>>, shared: &Shared) {
    for block in rx.iter() {
        if let Err(e) = stream.write_all(&block) {
            debug!("Client write failed: {e}");
            shared.send_errors.fetch_add(1, Ordering::Relaxed);
            break;
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}
