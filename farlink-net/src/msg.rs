//! Message definitions: wire discriminants, call headers and the
//! exception payload.

use std::convert::TryFrom;
use std::io::{Read, Write};

use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use farlink_core::{Error, Result};

use crate::codec::{FrameReader, FrameWriter};

/// Enumeration of all frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum Function {
    MethodCall,
    MethodReply,
    CreateInstance,
    CreateInstanceWithDefaultCtor,
    RequestServiceReference,
    ExceptionReturn,
    OpenReverseChannel,
    ClientDisconnecting,
    GcCleanup,
    LoadClientAssemblyIntoServer,
    ServerShuttingDown,
    ShutdownServer,
}

/// Tag opening every argument on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum RemotingTag {
    NullPointer,
    SerializedItem,
    RemoteReference,
    InstanceOfSystemType,
    ArrayOfSystemType,
    ContainerType,
    IpAddress,
    MethodPointer,
}

#[derive(Debug, Clone, Copy)]
pub struct CallHeader {
    pub function: Function,
    pub sequence: u32,
}

impl CallHeader {
    pub fn new(function: Function, sequence: u32) -> Self {
        Self { function, sequence }
    }

    pub fn write<W: Write>(&self, w: &mut FrameWriter<W>) -> Result<()> {
        w.write_i32(self.function as i32)?;
        w.write_i32(self.sequence as i32)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut FrameReader<R>) -> Result<Self> {
        let raw = r.read_i32()?;
        let function = Function::try_from(raw)
            .map_err(|_| Error::Protocol(format!("unknown function code: {}", raw)))?;
        let sequence = r.read_i32()? as u32;
        Ok(Self { function, sequence })
    }
}

pub const AUTH_TOKEN_LEN: usize = 100;
pub const AUTH_SUCCEEDED: i32 = 0x6c72_6166;

pub const ROLE_PRIMARY: u8 = 0;
pub const ROLE_REVERSE: u8 = 1;

/// Hash of the initiator's instance identifier, pairing the reverse
/// socket with its primary channel.
pub fn connection_identifier(instance_id: &str) -> u32 {
    use std::hash::Hasher;
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(instance_id.as_bytes());
    hasher.finish() as u32
}

/// The opaque pre-handshake token: role byte, connection identifier,
/// zero padding.
pub fn auth_token(role: u8, connection_id: u32) -> [u8; AUTH_TOKEN_LEN] {
    let mut token = [0u8; AUTH_TOKEN_LEN];
    token[0] = role;
    token[1..5].copy_from_slice(&connection_id.to_le_bytes());
    token
}

pub fn parse_auth_token(token: &[u8; AUTH_TOKEN_LEN]) -> (u8, u32) {
    let mut id = [0u8; 4];
    id.copy_from_slice(&token[1..5]);
    (token[0], u32::from_le_bytes(id))
}

/// Error kind recorded in a shipped exception, so the calling side can
/// resurface the matching error variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ExceptionKind {
    Unsupported,
    ProxyManagement,
    Protocol,
    Serialization,
    ConnectionLost,
    Other,
}

/// Payload of an `ExceptionReturn` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteException {
    pub kind: ExceptionKind,
    pub type_name: String,
    pub message: String,
}

impl RemoteException {
    pub fn from_error(err: &Error) -> Self {
        let (kind, type_name) = match err {
            Error::UnsupportedOperation(_) => (ExceptionKind::Unsupported, "UnsupportedOperation"),
            Error::ProxyManagement(_) => (ExceptionKind::ProxyManagement, "ProxyManagementError"),
            Error::Protocol(_) => (ExceptionKind::Protocol, "ProtocolError"),
            Error::SerializationFailure(_) => {
                (ExceptionKind::Serialization, "SerializationFailure")
            }
            Error::ConnectionLost => (ExceptionKind::ConnectionLost, "ConnectionLost"),
            _ => (ExceptionKind::Other, "RemoteInvocationError"),
        };
        let type_name = match err {
            Error::Remote { type_name, .. } => type_name.clone(),
            _ => type_name.to_string(),
        };
        Self {
            kind,
            type_name,
            message: err.to_string(),
        }
    }

    /// Rebuilds the error in the caller's context.
    pub fn into_error(self) -> Error {
        match self.kind {
            ExceptionKind::Unsupported => Error::UnsupportedOperation(self.message),
            ExceptionKind::ProxyManagement => Error::ProxyManagement(self.message),
            ExceptionKind::Protocol => Error::Protocol(self.message),
            ExceptionKind::Serialization => Error::SerializationFailure(self.message),
            ExceptionKind::ConnectionLost => Error::ConnectionLost,
            ExceptionKind::Other => Error::Remote {
                type_name: self.type_name,
                message: self.message,
            },
        }
    }
}
