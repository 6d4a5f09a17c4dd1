//! Binary record codecs used to store records in chunk files.

use std::error::Error;
use std::io::{Read, Write};
use std::marker::PhantomData;

/// Record codec interface. Encodes a single record to a chunk file and decodes it back.
///
/// Encoded records must be self-delimiting: the chunk reader decodes them one after another from the same
/// stream without any framing besides the record count stored at the beginning of the chunk.
pub trait RecordCodec<T> {
    /// Record serialization error.
    type SerializationError: Error + Send + Sync + 'static;
    /// Record deserialization error.
    type DeserializationError: Error + Send + Sync + 'static;

    /// Writes a record to the chunk stream.
    fn encode<W: Write>(writer: &mut W, item: &T) -> Result<(), Self::SerializationError>;

    /// Reads the next record from the chunk stream.
    fn decode<R: Read>(reader: &mut R) -> Result<T, Self::DeserializationError>;
}

/// RMP (Rust MessagePack) record codec.
/// It uses MessagePack as a data serialization format.
/// For more information see https://msgpack.org/.
pub struct RmpCodec<T> {
    item_type: PhantomData<T>,
}

impl<T> RecordCodec<T> for RmpCodec<T>
where
    T: serde::ser::Serialize + serde::de::DeserializeOwned,
{
    type SerializationError = rmp_serde::encode::Error;
    type DeserializationError = rmp_serde::decode::Error;

    fn encode<W: Write>(writer: &mut W, item: &T) -> Result<(), Self::SerializationError> {
        rmp_serde::encode::write(writer, item)
    }

    fn decode<R: Read>(reader: &mut R) -> Result<T, Self::DeserializationError> {
        rmp_serde::decode::from_read(reader)
    }
}
