//! Message payload encoding boundary.
//!
//! The engine never looks inside a payload. Request and response types only
//! need to convert themselves to and from the bytes of a single frame.
//! Every `prost` message (including the well-known wrappers `prost`
//! implements for `String`, `u32`, `Vec<u8>`, ...) gets this for free.

use crate::error::Error;
use bytes::{Bytes, BytesMut};
use std::any::Any;

/// A typed message carried by one frame.
pub trait Message: Sized + Send + 'static {
    /// Serialize into the payload of exactly one frame.
    fn serialize(&self) -> Result<Bytes, Error>;

    /// Deserialize the full payload of exactly one frame.
    fn deserialize(payload: Bytes) -> Result<Self, Error>;
}

impl<T> Message for T
where
    T: prost::Message + Default + Send + 'static,
{
    fn serialize(&self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    fn deserialize(payload: Bytes) -> Result<Self, Error> {
        Ok(T::decode(payload)?)
    }
}

/// A decoded message travelling between pipeline stages.
///
/// Stages are stored type-erased, so the codec hands typed requests to the
/// call handler (and receives typed responses from it) through this box.
pub struct AnyMessage {
    inner: Box<dyn Any + Send>,
    type_name: &'static str,
}

impl AnyMessage {
    /// Box a typed message.
    pub fn new<T: Send + 'static>(message: T) -> Self {
        Self {
            inner: Box::new(message),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Recover the typed message.
    pub fn downcast<T: 'static>(self) -> Result<T, Error> {
        match self.inner.downcast::<T>() {
            Ok(message) => Ok(*message),
            Err(_) => Err(Error::UnexpectedMessageType(std::any::type_name::<T>())),
        }
    }

    /// Name of the boxed type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl std::fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyMessage")
            .field("type", &self.type_name)
            .finish()
    }
}
