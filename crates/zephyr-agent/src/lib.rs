//! Host/guest execution protocol.
//!
//! The host drives step execution inside the microVM through a small
//! request/response protocol: length-framed UTF-8 JSON messages over any
//! byte stream (the Firecracker hybrid-vsock Unix socket in production,
//! plain TCP to the guest's host-visible interface during bring-up and in
//! tests). The guest side of the protocol is implemented by the
//! `zephyr-guest-agent` binary.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::AgentClient;
pub use protocol::{
    AgentRequest, AgentResponse, Encoding, ExecuteOutcome, OutputStream, AGENT_PORT,
};
