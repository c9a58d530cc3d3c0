//! This library provides the wire protocol and connection layer of the
//! farlink remoting runtime.
//!
//! A connection is a pair of TCP streams between two runtimes. The
//! primary stream carries requests from the initiator and their replies;
//! the reverse stream, opened during setup under the same connection
//! identifier, carries callbacks and events flowing the other way. Both
//! ends of each stream speak the same framed protocol: a function code
//! and sequence number, followed by typed, tagged argument values.
//!
//! The crate builds on the object model from `farlink-core`. [`Server`]
//! accepts connections and dispatches decoded invocations onto worker
//! threads; [`Connection`] establishes the dual-stream setup from the
//! initiating side and hands out a [`Client`] whose sequenced calls block
//! until their reply arrives. The [`Marshaller`] in between classifies
//! every argument as pass-by-value or pass-by-reference against the
//! instance registry, so object identity survives the trip.

#![allow(unused)]

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub mod codec;
pub mod marshal;
pub mod msg;

mod client;
mod server;

pub use client::{Client, ClientConfig, Connection};
pub use marshal::Marshaller;
pub use server::{Server, ServerConfig};

pub use farlink_core::{Error, Result};
