use std::net::ToSocketAddrs;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use tracing::{debug, warn};

use crate::config::NetConfig;
use crate::connection::Connection;
use crate::message::{Message, MessageId, OwnedMessage};
use crate::reactor::Reactor;
use crate::tsqueue::TsQueue;

/// The application's access point to a single server: owns one connection, the reactor
///  thread driving it, and the inbound queue the application drains.
pub struct Client<T: MessageId> {
    config: NetConfig,
    incoming: Arc<TsQueue<OwnedMessage<T>>>,
    connection: Option<Arc<Connection<T>>>,
    reactor: Option<Reactor>,
}

impl<T: MessageId> Client<T> {
    pub fn new(config: NetConfig) -> anyhow::Result<Client<T>> {
        config.validate()?;
        Ok(Client {
            config,
            incoming: Arc::new(TsQueue::new()),
            connection: None,
            reactor: None,
        })
    }

    /// Resolves the address, launches the reactor thread and starts the connection attempt
    ///  on it. Returns once the attempt is underway: resolution failures surface here,
    ///  while connect and handshake failures surface asynchronously as
    ///  [Client::is_connected] never becoming (or no longer being) true. Must be called
    ///  from outside any async context.
    pub fn connect(&mut self, host: &str, port: u16) -> anyhow::Result<()> {
        if self.connection.is_some() {
            bail!("client is already connected - disconnect first");
        }

        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow!("no address found for {}:{}", host, port))?;
        debug!("connecting to {} ({})", host, addr);

        let reactor = Reactor::spawn("framelink-client")?;
        let connection = Connection::new_client(self.incoming.clone(), self.config);
        reactor.handle().spawn(connection.clone().run_client(addr));

        self.connection = Some(connection);
        self.reactor = Some(reactor);
        Ok(())
    }

    /// Closes the connection, stops the reactor and joins its thread. Idempotent; also
    ///  runs on drop.
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.disconnect();
        }
        if let Some(reactor) = self.reactor.take() {
            reactor.shutdown();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// The queue of messages received from the server. Sender identity is always `None`
    ///  here - the single peer is implicit.
    pub fn incoming(&self) -> &TsQueue<OwnedMessage<T>> {
        &self.incoming
    }

    /// Enqueues a message for the server; physically sent later by the reactor, in FIFO
    ///  order relative to other `send` calls.
    pub fn send(&self, message: Message<T>) {
        match &self.connection {
            Some(connection) => connection.send(message),
            None => warn!("send on a client that is not connected - dropping the message"),
        }
    }
}

impl<T: MessageId> Drop for Client<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
