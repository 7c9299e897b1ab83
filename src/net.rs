/*!
 * Network Layer and Event Loop
 *
 * This module owns the sockets: a set of reactor threads, each with its
 * own SO_REUSEPORT listener and mio poll loop. Bytes read from a client
 * are split into requests, dispatched against the shared Store, and the
 * replies written back in order.
 */

use crate::command::dispatch;
use crate::protocol::{parse_many, write_error};
use crate::storage::Store;
use anyhow::*;
use bytes::{Bytes, BytesMut};
use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::result::Result::{Err, Ok};
use std::sync::Arc;

/// Size of read buffer for incoming data
const READ_BUF: usize = 4096;

const LISTENER: Token = Token(0);

/// Per-client state owned by a reactor
struct Client {
    sock: TcpStream,
    rbuf: BytesMut,
    wbuf: BytesMut,
    reqs: Vec<Vec<Bytes>>,
    /// Set after a protocol error; the client is dropped once `wbuf` drains
    closing: bool,
}

impl Client {
    fn new(sock: TcpStream) -> Self {
        Self {
            sock,
            rbuf: BytesMut::with_capacity(READ_BUF),
            wbuf: BytesMut::new(),
            reqs: Vec::with_capacity(32),
            closing: false,
        }
    }

    /// Run every complete request in `rbuf`, appending replies to `wbuf`
    fn process(&mut self, store: &Store) {
        self.reqs.clear();
        let parsed = parse_many(&mut self.rbuf, &mut self.reqs);

        for items in self.reqs.drain(..) {
            dispatch(store, &items, &mut self.wbuf);
        }

        if let Err(e) = parsed {
            log::debug!("protocol error, closing client: {}", e);
            write_error(&format!("Protocol error: {}", e), &mut self.wbuf);
            self.rbuf.clear();
            self.closing = true;
        }
    }

    /// Write as much of `wbuf` as the socket takes. `false` means the client is gone.
    fn flush(&mut self) -> bool {
        while !self.wbuf.is_empty() {
            match self.sock.write(&self.wbuf) {
                Ok(0) => return false,
                Ok(n) => {
                    let _ = self.wbuf.split_to(n);
                }
                Err(ref e) if would_block(e) => return true,
                Err(_) => return false,
            }
        }
        true
    }
}

/// Bind a TCP listener with SO_REUSEPORT support
///
/// Uses socket2 to set SO_REUSEPORT, allowing multiple threads to bind
/// to the same port and share the incoming connection load.
pub fn bind_reuseport(addr: SocketAddr) -> Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(unix)]
    {
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Run the server with `workers` reactor threads sharing `store`
///
/// Blocks until every worker has exited, which only happens on error.
pub fn run(addr: SocketAddr, workers: usize, store: Arc<Store>) -> Result<()> {
    let workers = workers.max(1);
    log::info!("listening on {} with {} workers", addr, workers);

    let mut handles = Vec::with_capacity(workers);
    for id in 0..workers {
        let store = store.clone();
        let handle = std::thread::Builder::new()
            .name(format!("reactor-{}", id))
            .spawn(move || {
                if let Err(e) = run_worker_loop(id, addr, store) {
                    log::error!("worker {} failed: {}", id, e);
                }
            })?;
        handles.push(handle);
    }

    for h in handles {
        if h.join().is_err() {
            log::error!("worker thread panicked");
        }
    }

    Ok(())
}

/// Event loop for a single reactor thread
fn run_worker_loop(id: usize, addr: SocketAddr, store: Arc<Store>) -> Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1024);

    // Each worker binds its own listener to the same port (SO_REUSEPORT)
    let mut listener = bind_reuseport(addr)?;
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;

    let mut clients: HashMap<usize, Client> = HashMap::new();
    let mut next_tok: usize = 1;
    let mut tmp_buf = [0u8; READ_BUF];

    loop {
        poll.poll(&mut events, None)?;

        for ev in events.iter() {
            match ev.token() {
                LISTENER => loop {
                    match listener.accept() {
                        Ok((mut sock, peer)) => {
                            sock.set_nodelay(true).ok();
                            let tok = next_tok;
                            next_tok = next_tok.wrapping_add(1);
                            if next_tok == 0 {
                                next_tok = 1;
                            }

                            poll.registry()
                                .register(&mut sock, Token(tok), Interest::READABLE)?;
                            log::debug!("worker {} accepted {} as {}", id, peer, tok);
                            clients.insert(tok, Client::new(sock));
                        }
                        Err(ref e) if would_block(e) => break,
                        Err(e) => {
                            log::warn!("worker {} accept error: {}", id, e);
                            break;
                        }
                    }
                },
                Token(t) => {
                    let Some(client) = clients.get_mut(&t) else {
                        continue;
                    };
                    let mut alive = true;

                    if ev.is_readable() {
                        loop {
                            match client.sock.read(&mut tmp_buf) {
                                Ok(0) => {
                                    alive = false;
                                    break;
                                }
                                Ok(n) => client.rbuf.extend_from_slice(&tmp_buf[..n]),
                                Err(ref e) if would_block(e) => break,
                                Err(_) => {
                                    alive = false;
                                    break;
                                }
                            }
                        }
                        if alive && !client.closing {
                            client.process(&store);
                        }
                    }

                    if alive {
                        alive = client.flush();
                    }
                    if alive && client.closing && client.wbuf.is_empty() {
                        alive = false;
                    }

                    if alive {
                        let interest = if client.wbuf.is_empty() {
                            Interest::READABLE
                        } else {
                            Interest::READABLE | Interest::WRITABLE
                        };
                        if poll
                            .registry()
                            .reregister(&mut client.sock, Token(t), interest)
                            .is_err()
                        {
                            alive = false;
                        }
                    }

                    if !alive {
                        log::debug!("worker {} dropped client {}", id, t);
                        clients.remove(&t);
                    }
                }
            }
        }
    }
}

/// Check if an I/O error indicates the operation would block
#[inline]
fn would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::time::Duration;

    fn free_addr() -> SocketAddr {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    }

    #[test]
    fn serves_pipelined_requests_over_tcp() {
        let addr = free_addr();
        let store = Arc::new(Store::new());
        std::thread::spawn(move || run(addr, 1, store));

        let mut conn = None;
        for _ in 0..50 {
            match std::net::TcpStream::connect(addr) {
                Ok(s) => {
                    conn = Some(s);
                    break;
                }
                Err(_) => std::thread::sleep(Duration::from_millis(20)),
            }
        }
        let mut conn = conn.expect("server did not start");
        conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        conn.write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\nGET foo\r\n")
            .unwrap();

        let mut reader = BufReader::new(conn.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "+OK\r\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "$3\r\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "bar\r\n");

        conn.write_all(b"*1\r\n:1\r\n").unwrap();
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert!(line.starts_with("-Error: Protocol error"));
    }
}
