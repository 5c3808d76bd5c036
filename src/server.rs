use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::config::NetConfig;
use crate::connection::Connection;
use crate::message::{Message, MessageId, OwnedMessage};
use crate::reactor::Reactor;
use crate::tsqueue::TsQueue;

/// The customization surface a server application plugs in at construction time. All hooks
///  except [ServerHooks::on_message] are invoked on the reactor thread and should return
///  quickly; `on_message` runs on whatever thread calls [Server::update] and may freely
///  call back into [Server::send_to] / [Server::broadcast].
pub trait ServerHooks<T: MessageId>: Send + Sync + 'static {
    /// Admission decision for a freshly accepted peer, taken before the handshake even
    ///  starts. Returning false drops the socket on the floor.
    fn on_client_connect(&self, server: &Server<T>, client: &Arc<Connection<T>>) -> bool;

    /// The peer solved the handshake challenge and is now admitted to regular traffic.
    fn on_client_validated(&self, server: &Server<T>, client: &Arc<Connection<T>>) {
        let _ = (server, client);
    }

    /// A connection was found dead and is being removed from the registry.
    fn on_client_disconnect(&self, server: &Server<T>, client: &Arc<Connection<T>>) {
        let _ = (server, client);
    }

    /// One inbound message, dispatched from [Server::update].
    fn on_message(&self, server: &Server<T>, client: &Arc<Connection<T>>, message: Message<T>);
}

struct ServerInner<T: MessageId> {
    port: u16,
    config: NetConfig,
    hooks: Arc<dyn ServerHooks<T>>,
    incoming: Arc<TsQueue<OwnedMessage<T>>>,
    /// insertion order is acceptance order; this is the strong ownership set for
    ///  connections - everything else holds weak references
    connections: Mutex<Vec<Arc<Connection<T>>>>,
    next_connection_id: AtomicU32,
    local_addr: Mutex<Option<SocketAddr>>,
    reactor: Mutex<Option<Reactor>>,
}

/// Owns the listening endpoint, the reactor driving all server-side I/O, the registry of
///  live connections and the shared inbound queue. Cheap to clone - clones share the same
///  underlying server.
///
/// The registry is written by the reactor thread (insert on accept) and swept by the
///  thread calling [Server::update] / [Server::broadcast] / [Server::send_to]; its mutex
///  makes that overlap safe, but message dispatch itself is designed for a single
///  consumer thread.
pub struct Server<T: MessageId> {
    inner: Arc<ServerInner<T>>,
}

impl<T: MessageId> Clone for Server<T> {
    fn clone(&self) -> Self {
        Server {
            inner: self.inner.clone(),
        }
    }
}

impl<T: MessageId> Server<T> {
    pub fn new(port: u16, hooks: Arc<dyn ServerHooks<T>>, config: NetConfig) -> anyhow::Result<Server<T>> {
        config.validate()?;
        Ok(Server {
            inner: Arc::new(ServerInner {
                port,
                config,
                hooks,
                incoming: Arc::new(TsQueue::new()),
                connections: Mutex::new(Vec::new()),
                next_connection_id: AtomicU32::new(config.first_connection_id),
                local_addr: Mutex::new(None),
                reactor: Mutex::new(None),
            }),
        })
    }

    /// Binds the listener, arms the accept loop and launches the reactor thread. If the
    ///  bind fails, the reactor is torn down again and nothing keeps running. Must be
    ///  called from outside any async context. A started server must be shut down with
    ///  [Server::stop].
    pub fn start(&self) -> anyhow::Result<()> {
        let mut reactor_slot = self.inner.reactor.lock().expect("reactor mutex poisoned");
        if reactor_slot.is_some() {
            bail!("server is already started");
        }

        let reactor = Reactor::spawn("framelink-server")?;
        let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.inner.port));
        let listener = match reactor.handle().block_on(TcpListener::bind(listen_addr)) {
            Ok(listener) => listener,
            Err(e) => {
                error!("could not listen on port {}: {}", self.inner.port, e);
                return Err(e.into()); // dropping the reactor joins its thread
            }
        };
        let local_addr = listener.local_addr()?;
        *self.inner.local_addr.lock().expect("local addr mutex poisoned") = Some(local_addr);

        reactor.handle().spawn(self.clone().accept_loop(listener));
        *reactor_slot = Some(reactor);

        info!("server started, listening on {}", local_addr);
        Ok(())
    }

    /// Stops the reactor and joins its thread; outstanding I/O is abandoned. Idempotent.
    pub fn stop(&self) {
        let reactor = self.inner.reactor.lock().expect("reactor mutex poisoned").take();
        if let Some(reactor) = reactor {
            reactor.shutdown();
            for connection in self.inner.connections.lock().expect("registry mutex poisoned").iter() {
                connection.mark_closed();
            }
            info!("server stopped");
        }
    }

    /// The address the listener is actually bound to - relevant when the server was
    ///  started on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().expect("local addr mutex poisoned")
    }

    /// Number of registry entries, dead ones included until the next sweep.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().expect("registry mutex poisoned").len()
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("new connection from {}", peer_addr);
                    let connection = Connection::new_server(
                        peer_addr,
                        self.inner.incoming.clone(),
                        self.inner.config,
                    );

                    if self.inner.hooks.on_client_connect(&self, &connection) {
                        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
                        connection.set_id(id);
                        self.inner
                            .connections
                            .lock()
                            .expect("registry mutex poisoned")
                            .push(connection.clone());
                        info!("[{}] connection approved", id);
                        tokio::spawn(connection.run_server(stream, self.clone()));
                    } else {
                        info!("connection from {} denied", peer_addr);
                        // stream is dropped here, closing the socket
                    }
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                }
            }
        }
    }

    pub(crate) fn notify_validated(&self, connection: &Arc<Connection<T>>) {
        self.inner.hooks.on_client_validated(self, connection);
    }

    /// Enqueues a message to one client. A target found dead is treated as a disconnect
    ///  event: the hook fires and the registry entry is removed.
    pub fn send_to(&self, client: &Arc<Connection<T>>, message: Message<T>) {
        if client.is_connected() {
            client.send(message);
        } else {
            self.remove_connections(&[client.clone()]);
        }
    }

    /// Enqueues a message to every connected client except `exclude`. Entries found dead
    ///  during the sweep are collected and removed in a second pass - the registry is
    ///  never mutated while it is being iterated.
    pub fn broadcast(&self, message: &Message<T>, exclude: Option<&Arc<Connection<T>>>) {
        let mut dead = Vec::new();
        {
            let connections = self.inner.connections.lock().expect("registry mutex poisoned");
            for connection in connections.iter() {
                if !connection.is_connected() {
                    dead.push(connection.clone());
                    continue;
                }
                if let Some(excluded) = exclude {
                    if Arc::ptr_eq(connection, excluded) {
                        continue;
                    }
                }
                connection.send(message.clone());
            }
        }
        if !dead.is_empty() {
            self.remove_connections(&dead);
        }
    }

    /// Pops up to `max_messages` inbound messages (all of them if `None`) and dispatches
    ///  them to the message hook, optionally blocking until at least one is available.
    ///  Messages whose sender has already been dropped from the registry are discarded -
    ///  the hook only ever sees live connections. Returns the number of messages drained.
    pub fn update(&self, max_messages: Option<usize>, blocking: bool) -> usize {
        if blocking {
            self.inner.incoming.wait();
        }

        let limit = max_messages.unwrap_or(usize::MAX);
        let mut drained = 0;
        while drained < limit {
            let Some(owned) = self.inner.incoming.pop_front() else {
                break;
            };
            drained += 1;
            match owned.connection() {
                Some(connection) => self.inner.hooks.on_message(self, &connection, owned.message),
                None => debug!("dropping a message whose sender connection is already gone"),
            }
        }
        drained
    }

    fn remove_connections(&self, dead: &[Arc<Connection<T>>]) {
        {
            let mut connections = self.inner.connections.lock().expect("registry mutex poisoned");
            connections.retain(|c| !dead.iter().any(|d| Arc::ptr_eq(c, d)));
        }
        for connection in dead {
            debug!("[{}] removing dead connection", connection.id());
            self.inner.hooks.on_client_disconnect(self, connection);
        }
    }
}

impl<T: MessageId> Drop for ServerInner<T> {
    fn drop(&mut self) {
        // only reached if the server was never started or already stopped; a running
        // accept loop holds a Server clone and keeps this alive
        if let Some(reactor) = self.reactor.lock().expect("reactor mutex poisoned").take() {
            reactor.shutdown();
        }
    }
}
