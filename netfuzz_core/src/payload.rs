use bincode::{Decode, Encode};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// The protocol-specific data a corpus entry carries.
///
/// The corpus never looks inside a payload. It only needs to persist it, so the
/// trait bundles the serialization bounds required by the available
/// [`EntryFactory`](crate::corpus::EntryFactory) implementations.
pub trait Payload:
    Serialize + DeserializeOwned + Encode + Decode<()> + Clone + Send + Sync + std::fmt::Debug + 'static
{
}

impl<T> Payload for T where
    T: Serialize
        + DeserializeOwned
        + Encode
        + Decode<()>
        + Clone
        + Send
        + Sync
        + std::fmt::Debug
        + 'static
{
}
