//! A bidirectional, message-oriented networking substrate for building custom client/server
//!  applications on top of TCP.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (typed, defined-length chunks of data)
//!   rather than a stream of bytes
//! * Fully asynchronous I/O: each [server::Server] and [client::Client] owns a *reactor*, a
//!   dedicated thread running a single-threaded event loop that drives all socket operations.
//!   The application thread never blocks on the network; the only blocking primitive offered
//!   to it is [tsqueue::TsQueue::wait]
//! * Strict per-connection ordering: one read in flight at a time, one write chain per
//!   connection draining a FIFO queue. No ordering guarantees across connections
//! * A lightweight challenge / response handshake before a connection is admitted to regular
//!   traffic. This is anti-automation obfuscation, *not* cryptography - there is no
//!   confidentiality or integrity protection on the wire
//! * Best-effort delivery: a failed connection is closed and forgotten, messages in flight
//!   are lost. There is no reconnect, no persistence and no cross-reconnect delivery guarantee
//!
//! ## Wire format
//!
//! The handshake is exchanged once per connection, before any framed traffic, as raw
//!  fixed-size values - all numbers in network byte order (BE):
//!
//! ```ascii
//! server -> client:  challenge (u64)
//! client -> server:  scrambled response (u64)
//! ```
//!
//! Every subsequent frame is a header followed by an opaque body:
//!
//! ```ascii
//! 0: message type tag (u32) - the application enum's discriminant
//! 4: body length (u32)
//! 8: body (`body length` raw bytes, layout defined by the application)
//! ```
//!
//! The body is built and consumed with [message::Message::push] / [message::Message::pop],
//!  which operate on the *tail* of the body in LIFO order: the receiver must extract values
//!  in the exact reverse of the order the sender appended them. Both ends must run this
//!  implementation (or one that is bit-for-bit compatible, including the scramble constants
//!  in [handshake]) for the handshake and the framing to line up.

pub mod client;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod message;
mod reactor;
pub mod server;
pub mod tsqueue;

#[cfg(test)]
pub mod test_util;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
