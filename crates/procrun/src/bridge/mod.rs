//! IPC bridge between callers and the execution engine.
//!
//! This module provides the wire protocol and codec shared by both ends of
//! the dispatch channel.
//!
//! # Architecture
//!
//! - **protocol**: Message types (EngineRequest/EngineReply) and the correlating Frame envelope
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
