//! Tunnel connections between the local client and the exit node.
//!
//! A tunnel connection starts with one length-prefixed CONNECT request, gets one
//! response of the same shape, and is then relayed byte for byte to the target.

pub mod client;
pub mod pipe;
pub mod protocol;
pub mod server;
pub mod transport;
