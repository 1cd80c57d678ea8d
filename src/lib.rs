//! Transport core of an I2P-compatible anonymous-routing node.
//!
//! This crate implements the two wire-level session protocols (the NTCP
//! stream transport and the SSU datagram transport), the router-info and
//! identity data model they require, the Kademlia-style network database
//! they feed, and the peer-lifecycle manager that multiplexes I2NP messages
//! over them. The tunnel, garlic and client layers live above this crate and
//! connect through the dispatcher and netdb hooks.

pub mod config;
pub mod crypto;
pub mod data;
pub mod error;
pub mod i2np;
pub mod netdb;
pub mod router;
pub mod transport;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::router::{Router, RouterContext, RouterStatus};
