use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{anyhow, bail};
use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, trace, warn};

use crate::config::NetConfig;
use crate::handshake;
use crate::message::{Message, MessageHeader, MessageId, OwnedMessage};
use crate::server::Server;
use crate::tsqueue::TsQueue;

/// Which end of the wire this connection is. The role decides who issues the handshake
///  challenge and whether received messages carry a sender identity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Server,
    Client,
}

/// Protocol phase of a connection. `AwaitingChallenge` / `AwaitingResponse` are the two
///  handshake sub-phases (the server sends the challenge and awaits the response, the
///  client awaits the challenge and returns the response); `Connected` is steady state.
///  `Closed` is terminal - failed connections are never retried.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Idle,
    AwaitingChallenge,
    AwaitingResponse,
    Connected,
    Closed,
}

/// One transport endpoint, driving its own read pipeline (header, body, enqueue into the
///  owner's shared inbound queue, re-arm) and write chain (drain the outbound queue in
///  FIFO order, one message at a time).
///
/// All I/O runs as tasks on the owner's reactor. [Connection::send] is the only entry
///  point for the application thread: it enqueues and wakes the write chain, nothing more.
///  Any transport error closes the connection; the owner notices lazily through
///  [Connection::is_connected].
pub struct Connection<T> {
    role: Role,
    config: NetConfig,
    id: AtomicU32,
    state: AtomicU8,
    open: AtomicBool,
    peer_addr: Mutex<Option<SocketAddr>>,
    outbound: TsQueue<Message<T>>,
    send_notify: Notify,
    close_tx: watch::Sender<()>,
    incoming: Arc<TsQueue<OwnedMessage<T>>>,
    weak_self: Weak<Connection<T>>,
}

impl<T: MessageId> Connection<T> {
    /// A server-role connection for a freshly accepted socket. The socket itself is handed
    ///  to [Connection::run_server] once the owner has decided to admit the peer.
    pub(crate) fn new_server(
        peer_addr: SocketAddr,
        incoming: Arc<TsQueue<OwnedMessage<T>>>,
        config: NetConfig,
    ) -> Arc<Connection<T>> {
        Arc::new_cyclic(|weak_self| Connection {
            role: Role::Server,
            config,
            id: AtomicU32::new(0),
            state: AtomicU8::new(ConnectionState::Idle.into()),
            open: AtomicBool::new(true),
            peer_addr: Mutex::new(Some(peer_addr)),
            outbound: TsQueue::new(),
            send_notify: Notify::new(),
            close_tx: watch::channel(()).0,
            incoming,
            weak_self: weak_self.clone(),
        })
    }

    /// A client-role connection. It has no socket yet; [Connection::run_client] opens one.
    pub(crate) fn new_client(
        incoming: Arc<TsQueue<OwnedMessage<T>>>,
        config: NetConfig,
    ) -> Arc<Connection<T>> {
        Arc::new_cyclic(|weak_self| Connection {
            role: Role::Client,
            config,
            id: AtomicU32::new(0),
            state: AtomicU8::new(ConnectionState::Idle.into()),
            open: AtomicBool::new(false),
            peer_addr: Mutex::new(None),
            outbound: TsQueue::new(),
            send_notify: Notify::new(),
            close_tx: watch::channel(()).0,
            incoming,
            weak_self: weak_self.clone(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Server-assigned identifier, handed out on admission. Meaningless in client role.
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::try_from_primitive(self.state.load(Ordering::SeqCst))
            .expect("this is a bug: the state discriminant is only ever written from ConnectionState")
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.into(), Ordering::SeqCst);
    }

    /// Whether the underlying socket is believed open. True from accept (server role) or
    ///  successful transport connect (client role) until the connection fails or is
    ///  disconnected - including during the handshake.
    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock().expect("peer addr mutex poisoned")
    }

    /// Enqueues a message for transmission and wakes the write chain. Purely asynchronous:
    ///  the message leaves the wire later, in FIFO order relative to other `send` calls on
    ///  this connection. Callable from any thread.
    pub fn send(&self, message: Message<T>) {
        trace!("[{}] queueing {:?} for send", self.id(), message.id);
        self.outbound.push_back(message);
        self.send_notify.notify_one();
    }

    /// Closes the connection: in-flight operations are abandoned at their next suspension
    ///  point and no further ones are issued. Idempotent; the terminal state is `Closed`.
    pub fn disconnect(&self) {
        self.mark_closed();
        let _ = self.close_tx.send(());
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Closed);
    }

    /// Drives a server-role connection: challenge/response handshake first, then the
    ///  steady-state read and write loops. Failure anywhere just closes the socket - the
    ///  peer gets no explanation, and the registry entry lingers until the owner's next
    ///  sweep.
    pub(crate) async fn run_server(self: Arc<Self>, stream: TcpStream, server: Server<T>) {
        let mut closed = self.close_tx.subscribe();
        if !self.is_connected() {
            // disconnected before the driver ever ran
            return;
        }

        let mut stream = stream;
        let handshake_result = tokio::select! {
            _ = closed.changed() => Err(anyhow!("connection closed during handshake")),
            res = self.server_handshake(&mut stream) => res,
        };
        if let Err(e) = handshake_result {
            info!("[{}] handshake failed: {:#}", self.id(), e);
            self.disconnect();
            return;
        }

        server.notify_validated(&self);
        self.run_io(stream, closed).await;
    }

    /// Drives a client-role connection: transport connect, handshake response, then the
    ///  steady-state loops. The client does not wait for any acknowledgment beyond having
    ///  sent its response - a rejecting server silently closes, and that surfaces here as
    ///  the first read failing.
    pub(crate) async fn run_client(self: Arc<Self>, addr: SocketAddr) {
        let mut closed = self.close_tx.subscribe();

        let stream = tokio::select! {
            _ = closed.changed() => {
                self.mark_closed();
                return;
            }
            res = TcpStream::connect(addr) => match res {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("could not connect to {}: {}", addr, e);
                    self.mark_closed();
                    return;
                }
            },
        };
        *self.peer_addr.lock().expect("peer addr mutex poisoned") = Some(addr);
        self.open.store(true, Ordering::SeqCst);
        debug!("connected to {}", addr);

        let mut stream = stream;
        let handshake_result = tokio::select! {
            _ = closed.changed() => Err(anyhow!("connection closed during handshake")),
            res = self.client_handshake(&mut stream) => res,
        };
        if let Err(e) = handshake_result {
            info!("handshake with {} failed: {:#}", addr, e);
            self.disconnect();
            return;
        }

        self.run_io(stream, closed).await;
    }

    async fn server_handshake(&self, stream: &mut TcpStream) -> anyhow::Result<()> {
        self.set_state(ConnectionState::AwaitingChallenge);
        let challenge = handshake::new_challenge();
        let expected = handshake::scramble(challenge);
        stream.write_all(&challenge.to_be_bytes()).await?;

        self.set_state(ConnectionState::AwaitingResponse);
        let mut response_buf = [0u8; 8];
        tokio::time::timeout(self.config.handshake_timeout, stream.read_exact(&mut response_buf))
            .await
            .map_err(|_| anyhow!("no response within {:?}", self.config.handshake_timeout))??;

        let response = u64::from_be_bytes(response_buf);
        if response != expected {
            bail!("response mismatch: expected {:016x}, got {:016x}", expected, response);
        }
        self.set_state(ConnectionState::Connected);
        info!("[{}] client validated", self.id());
        Ok(())
    }

    async fn client_handshake(&self, stream: &mut TcpStream) -> anyhow::Result<()> {
        self.set_state(ConnectionState::AwaitingChallenge);
        let mut challenge_buf = [0u8; 8];
        stream.read_exact(&mut challenge_buf).await?;
        let challenge = u64::from_be_bytes(challenge_buf);

        self.set_state(ConnectionState::AwaitingResponse);
        stream.write_all(&handshake::scramble(challenge).to_be_bytes()).await?;

        self.set_state(ConnectionState::Connected);
        debug!("handshake response sent, entering steady state");
        Ok(())
    }

    async fn run_io(self: Arc<Self>, stream: TcpStream, closed: watch::Receiver<()>) {
        let (read_half, write_half) = stream.into_split();

        let writer = self.clone();
        let writer_closed = self.close_tx.subscribe();
        tokio::spawn(async move { writer.write_loop(write_half, writer_closed).await });

        self.read_loop(read_half, closed).await;
    }

    /// One read in flight at a time: header, body if the header declares one, enqueue into
    ///  the shared inbound queue, re-arm. Per-connection delivery order is therefore the
    ///  exact order the bytes arrived.
    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf, mut closed: watch::Receiver<()>) {
        loop {
            let mut header_buf = [0u8; MessageHeader::WIRE_LEN];
            let read_result = tokio::select! {
                _ = closed.changed() => break,
                res = read_half.read_exact(&mut header_buf) => res,
            };
            if let Err(e) = read_result {
                debug!("[{}] read header failed: {}", self.id(), e);
                break;
            }

            let header = match MessageHeader::try_deser(&mut &header_buf[..]) {
                Ok(header) => header,
                Err(_) => break, // cannot happen for a fully read buffer
            };
            if header.body_len > self.config.max_message_size {
                warn!(
                    "[{}] peer announced a {} byte body, limit is {} - closing",
                    self.id(),
                    header.body_len,
                    self.config.max_message_size
                );
                break;
            }
            let id = match T::try_from_raw(header.raw_id) {
                Ok(id) => id,
                Err(e) => {
                    warn!("[{}] {:#} - closing", self.id(), e);
                    break;
                }
            };

            let mut body = BytesMut::zeroed(header.body_len as usize);
            if header.body_len > 0 {
                let read_result = tokio::select! {
                    _ = closed.changed() => break,
                    res = read_half.read_exact(&mut body[..]) => res,
                };
                if let Err(e) = read_result {
                    debug!("[{}] read body failed: {}", self.id(), e);
                    break;
                }
            }

            let message = Message { id, body };
            trace!("[{}] received {:?} ({} bytes)", self.id(), message.id, message.wire_len());
            let sender = match self.role {
                Role::Server => Some(self.weak_self.clone()),
                Role::Client => None,
            };
            self.incoming.push_back(OwnedMessage { sender, message });
        }
        self.disconnect();
    }

    /// The single write chain of this connection: drain the outbound queue in FIFO order,
    ///  then park until [Connection::send] wakes it again.
    async fn write_loop(self: Arc<Self>, mut write_half: OwnedWriteHalf, mut closed: watch::Receiver<()>) {
        loop {
            while let Some(message) = self.outbound.pop_front() {
                if let Err(e) = Self::write_message(&mut write_half, &message).await {
                    debug!("[{}] write failed: {}", self.id(), e);
                    self.disconnect();
                    return;
                }
                trace!("[{}] sent {:?} ({} bytes)", self.id(), message.id, message.wire_len());
            }
            tokio::select! {
                _ = closed.changed() => return,
                _ = self.send_notify.notified() => {}
            }
        }
    }

    async fn write_message(write_half: &mut OwnedWriteHalf, message: &Message<T>) -> anyhow::Result<()> {
        let mut header_buf = BytesMut::with_capacity(MessageHeader::WIRE_LEN);
        MessageHeader::for_message(message).ser(&mut header_buf);
        write_half.write_all(&header_buf).await?;
        if !message.body.is_empty() {
            write_half.write_all(&message.body).await?;
        }
        Ok(())
    }
}

impl<T: MessageId> Debug for Connection<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection[{}, {:?}, {:?}]", self.id(), self.role, self.state())
    }
}
