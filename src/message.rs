use std::fmt::Debug;
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::connection::Connection;

/// The application-defined message type tag. The protocol is payload-agnostic; this tag is
///  the only part of a message the substrate interprets (it is carried in every frame
///  header as a `u32` in network byte order).
///
/// There is a blanket implementation for `#[repr(u32)]` enums deriving
///  `num_enum::{IntoPrimitive, TryFromPrimitive}`, which is the intended way to define a
///  message vocabulary.
pub trait MessageId: Copy + Eq + Debug + Send + Sync + 'static {
    fn to_raw(self) -> u32;

    fn try_from_raw(raw: u32) -> anyhow::Result<Self>;
}

impl<T> MessageId for T
where
    T: Copy + Eq + Debug + Send + Sync + 'static + Into<u32> + TryFromPrimitive<Primitive = u32>,
{
    fn to_raw(self) -> u32 {
        self.into()
    }

    fn try_from_raw(raw: u32) -> anyhow::Result<Self> {
        Self::try_from_primitive(raw).map_err(|_| anyhow!("unknown message type tag {}", raw))
    }
}

/// A fixed-layout value that can be appended to / extracted from a message body. All
///  implementations encode in network byte order with no padding, so the encoding is
///  identical on both ends regardless of platform.
///
/// Variable-length or pointer-containing structures have no implementation on purpose: the
///  application must flatten those into fixed fields (or length-prefixed raw byte runs)
///  before framing.
pub trait WireValue: Sized {
    const WIRE_LEN: usize;

    fn ser(&self, buf: &mut BytesMut);

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self>;
}

macro_rules! impl_wire_value_for_primitive {
    ($t:ty, $put:ident, $get:ident) => {
        impl WireValue for $t {
            const WIRE_LEN: usize = size_of::<$t>();

            fn ser(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }

            fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
                if buf.remaining() < Self::WIRE_LEN {
                    bail!(
                        "buffer underflow: {} bytes needed, {} available",
                        Self::WIRE_LEN,
                        buf.remaining()
                    );
                }
                Ok(buf.$get())
            }
        }
    };
}

impl_wire_value_for_primitive!(u8, put_u8, get_u8);
impl_wire_value_for_primitive!(u16, put_u16, get_u16);
impl_wire_value_for_primitive!(u32, put_u32, get_u32);
impl_wire_value_for_primitive!(u64, put_u64, get_u64);
impl_wire_value_for_primitive!(u128, put_u128, get_u128);
impl_wire_value_for_primitive!(i8, put_i8, get_i8);
impl_wire_value_for_primitive!(i16, put_i16, get_i16);
impl_wire_value_for_primitive!(i32, put_i32, get_i32);
impl_wire_value_for_primitive!(i64, put_i64, get_i64);
impl_wire_value_for_primitive!(i128, put_i128, get_i128);
impl_wire_value_for_primitive!(f32, put_f32, get_f32);
impl_wire_value_for_primitive!(f64, put_f64, get_f64);

impl WireValue for bool {
    const WIRE_LEN: usize = 1;

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(*self as u8);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(u8::try_deser(buf)? != 0)
    }
}

impl<const N: usize> WireValue for [u8; N] {
    const WIRE_LEN: usize = N;

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        if buf.remaining() < N {
            bail!("buffer underflow: {} bytes needed, {} available", N, buf.remaining());
        }
        let mut value = [0u8; N];
        buf.copy_to_slice(&mut value);
        Ok(value)
    }
}

/// The fixed-layout frame header as it appears on the wire. In memory the message keeps a
///  typed id and lets the body track its own length; the header is materialized when a
///  frame is written and parsed when one is read, which keeps the declared body length
///  equal to the actual body length by construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub raw_id: u32,
    pub body_len: u32,
}

impl MessageHeader {
    pub const WIRE_LEN: usize = 2 * size_of::<u32>();

    pub fn for_message<T: MessageId>(message: &Message<T>) -> MessageHeader {
        MessageHeader {
            raw_id: message.id.to_raw(),
            body_len: u32::try_from(message.body.len())
                .expect("this is a bug: a message body must never outgrow the u32 length field"),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.raw_id);
        buf.put_u32(self.body_len);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        if buf.remaining() < Self::WIRE_LEN {
            bail!("incomplete message header: {} bytes", buf.remaining());
        }
        Ok(MessageHeader {
            raw_id: buf.get_u32(),
            body_len: buf.get_u32(),
        })
    }
}

/// One protocol message: a typed tag plus an opaque body blob.
///
/// The body is assembled with [Message::push] and consumed with [Message::pop], which work
///  on the *tail* in LIFO order - the receiver extracts values in the exact reverse of the
///  order the sender appended them. This asymmetry is part of the protocol, not a detail:
///  application code on both ends must agree on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message<T> {
    pub id: T,
    pub body: BytesMut,
}

impl<T: MessageId> Message<T> {
    pub fn new(id: T) -> Message<T> {
        Message {
            id,
            body: BytesMut::new(),
        }
    }

    /// Appends the value's fixed-size encoding at the tail of the body.
    pub fn push<V: WireValue>(&mut self, value: V) {
        value.ser(&mut self.body);
    }

    /// Reads and removes the trailing `V::WIRE_LEN` bytes of the body. Extracting more than
    ///  the body holds is a protocol or programming error and fails loudly; the body is
    ///  left untouched in that case.
    pub fn pop<V: WireValue>(&mut self) -> anyhow::Result<V> {
        if self.body.len() < V::WIRE_LEN {
            bail!(
                "message body underflow: extracting {} bytes but only {} are left",
                V::WIRE_LEN,
                self.body.len()
            );
        }
        let mut tail = self.body.split_off(self.body.len() - V::WIRE_LEN).freeze();
        V::try_deser(&mut tail)
    }

    /// Size of the full frame on the wire. A message with an empty body is sent and
    ///  received as a bare header.
    pub fn wire_len(&self) -> usize {
        MessageHeader::WIRE_LEN + self.body.len()
    }
}

/// A received message tagged with the connection that produced it.
///
/// The sender reference is weak: the server's registry holds the strong references, and a
///  connection that was removed there may be gone by the time the message is consumed.
///  [OwnedMessage::connection] revalidates liveness; `None` means the sender has been
///  dropped (or, on the client side, that there is no sender identity to begin with -
///  the single peer is implicit).
pub struct OwnedMessage<T> {
    pub sender: Option<Weak<Connection<T>>>,
    pub message: Message<T>,
}

impl<T> OwnedMessage<T> {
    pub fn connection(&self) -> Option<Arc<Connection<T>>> {
        self.sender.as_ref().and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::test_util::TestMsg;

    use super::*;

    #[test]
    fn test_push_pop_lifo_round_trip() {
        let mut message = Message::new(TestMsg::Payload);
        message.push(5u32);
        message.push(0x1122_3344_5566_7788u64);
        message.push(-17i16);
        message.push(2.5f64);
        message.push(true);
        message.push([1u8, 2, 3]);

        assert_eq!(message.pop::<[u8; 3]>().unwrap(), [1, 2, 3]);
        assert_eq!(message.pop::<bool>().unwrap(), true);
        assert_eq!(message.pop::<f64>().unwrap(), 2.5);
        assert_eq!(message.pop::<i16>().unwrap(), -17);
        assert_eq!(message.pop::<u64>().unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(message.pop::<u32>().unwrap(), 5);
        assert!(message.body.is_empty());
    }

    #[test]
    fn test_pop_underflow_fails_and_leaves_body_untouched() {
        let mut message = Message::new(TestMsg::Payload);
        message.push(7u16);

        assert!(message.pop::<u64>().is_err());
        assert_eq!(message.body.len(), 2);
        assert_eq!(message.pop::<u16>().unwrap(), 7);
    }

    #[test]
    fn test_pop_from_empty_body_fails() {
        let mut message = Message::new(TestMsg::Ping);
        assert!(message.pop::<u8>().is_err());
    }

    #[test]
    fn test_wire_len() {
        let mut message = Message::new(TestMsg::Ping);
        assert_eq!(message.wire_len(), MessageHeader::WIRE_LEN);
        message.push(1u64);
        assert_eq!(message.wire_len(), MessageHeader::WIRE_LEN + 8);
    }

    #[test]
    fn test_push_encodes_network_byte_order() {
        let mut message = Message::new(TestMsg::Payload);
        message.push(0x0102u16);
        message.push(0x0304_0506u32);
        assert_eq!(&message.body[..], &[1, 2, 3, 4, 5, 6]);
    }

    #[rstest]
    #[case::ping(MessageHeader { raw_id: 0, body_len: 0 }, &[0, 0, 0, 0, 0, 0, 0, 0])]
    #[case::with_body(MessageHeader { raw_id: 2, body_len: 0x0108 }, &[0, 0, 0, 2, 0, 0, 1, 8])]
    fn test_header_ser(#[case] header: MessageHeader, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(&buf[..], expected);

        let mut parse_buf: &[u8] = &buf;
        assert_eq!(MessageHeader::try_deser(&mut parse_buf).unwrap(), header);
        assert!(parse_buf.is_empty());
    }

    #[test]
    fn test_header_deser_rejects_truncated_input() {
        let mut buf: &[u8] = &[0, 0, 0, 1, 0, 0];
        assert!(MessageHeader::try_deser(&mut buf).is_err());
    }

    #[test]
    fn test_header_for_message_tracks_body() {
        let mut message = Message::new(TestMsg::Relay);
        message.push(9u32);
        let header = MessageHeader::for_message(&message);
        assert_eq!(header.raw_id, TestMsg::Relay.to_raw());
        assert_eq!(header.body_len, 4);
    }

    #[test]
    fn test_message_id_round_trip_and_unknown_tag() {
        assert_eq!(TestMsg::try_from_raw(TestMsg::Shout.to_raw()).unwrap(), TestMsg::Shout);
        assert!(TestMsg::try_from_raw(0xFFFF_FFFF).is_err());
    }
}
