use nom;

use std::io;
use thiserror::Error as ThisError;

/// Kinds of errors surfaced by the router core.
///
/// Wire input that fails to decode is dropped by the transports; file input
/// that fails leaves prior state unchanged. Only programmer errors panic.
#[derive(Clone, Eq, PartialEq, Debug, ThisError)]
pub enum Error {
	/// Wraps io errors
	#[error("IO error occurred: {0}")]
	Io(String),
	/// Wraps nom parser errors
	#[error("Failed to parse an I2P structure")]
	MessageParsing,
	#[error("Truncated buffer while decoding {0}")]
	Truncated(&'static str),
	#[error("Protocol violation: {0}")]
	Protocol(String),
	#[error("Cryptographic failure: {0}")]
	Crypto(String),
	#[error("Signature verification failed")]
	BadSignature,
	#[error("Signing key type {0} is not supported")]
	UnsupportedSigningKey(u16),
	#[error("Message of {0} bytes exceeds the maximum")]
	OversizedMessage(usize),
	#[error("Timed out: {0}")]
	Timeout(&'static str),
	#[error("Peer {0} is banned")]
	Banned(String),
	#[error("No compatible address for transport {0}")]
	NoCompatibleAddress(&'static str),
	#[error("Session is closed")]
	SessionClosed,
	#[error("Router info for {0} not found")]
	RouterNotFound(String),
	#[error("Invalid configuration: {0}")]
	Config(String),
}

impl From<io::Error> for Error {
	fn from(err: io::Error) -> Error {
		Self::Io(err.to_string())
	}
}

impl<E> From<nom::Err<E>> for Error {
	fn from(_err: nom::Err<E>) -> Error {
		Self::MessageParsing
	}
}
