//! Shared shape of every id-prefixed protocol message.

use crate::message_id::MessageId;
use bytes::Bytes;
use garnet_binary::{BinaryError, BitReader, BitWriter, Result};

/// A message whose wire form is its [`MessageId`] byte followed by the
/// body produced by the type's inherent `encode`.
pub trait WireMessage: Sized {
    const ID: MessageId;

    fn encode_body(&self, writer: &mut BitWriter) -> Result<()>;
    fn decode_body(reader: &mut BitReader) -> Result<Self>;

    fn serialize(&self) -> Bytes {
        let mut writer = BitWriter::new();
        writer.write_u8(Self::ID.into());
        self.encode_body(&mut writer)
            .expect("message encoding is infallible for valid fields");
        writer.into_bytes()
    }

    /// Parses a full message including the leading id byte.
    fn deserialize(data: Bytes) -> Result<Self> {
        let mut reader = BitReader::new(data);
        let id = reader.read_u8()?;
        if id != u8::from(Self::ID) {
            return Err(BinaryError::InvalidData(format!(
                "expected message id {:#04x}, got {:#04x}",
                u8::from(Self::ID),
                id
            )));
        }
        Self::decode_body(&mut reader)
    }
}

macro_rules! wire_message {
    ($ty:ident, $id:expr) => {
        impl crate::protocol::wire_message::WireMessage for $ty {
            const ID: crate::message_id::MessageId = $id;

            #[inline]
            fn encode_body(
                &self,
                writer: &mut garnet_binary::BitWriter,
            ) -> garnet_binary::Result<()> {
                self.encode(writer)
            }

            #[inline]
            fn decode_body(
                reader: &mut garnet_binary::BitReader,
            ) -> garnet_binary::Result<Self> {
                Self::decode(reader)
            }
        }
    };
}

pub(crate) use wire_message;
