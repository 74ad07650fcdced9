//! External collaborator interfaces.
//!
//! The transport layer (raw sockets, TLS, WebSocket framing) and the router
//! (URI-to-next-hop resolution) are out of scope for this crate; a host
//! binary implements [`Transport`] and [`Router`] and hands parsed messages
//! in and out. Dialogs never own a connection — only an address/port/name
//! triple resolved per send through these traits.

use crate::Result;
use async_trait::async_trait;
use rsip::SipMessage;
use std::fmt;

/// A resolved transport endpoint. Dialogs hold transport references this
/// way -- by address, port and transport name -- never by owning the
/// connection itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipAddr {
    pub host: String,
    pub port: u16,
    pub transport: rsip::transport::Transport,
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.transport)
    }
}

/// A local listening point, returned by [`Transport::listening_point`].
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    pub addr: SipAddr,
}

/// The transport collaborator: accepts outbound messages and reports its
/// local listening points. Implemented by the host, never by this crate.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, destination: &SipAddr, msg: SipMessage) -> Result<()>;
    fn listening_point(&self, transport: rsip::transport::Transport) -> Option<LocalEndpoint>;
}

/// The next-hop resolved by the router for an outbound request.
#[derive(Debug, Clone)]
pub struct Hop {
    pub addr: SipAddr,
}

/// The router collaborator: resolves a request's Request-URI/Route to a
/// concrete next hop (DNS/NAPTR/SRV resolution lives entirely on the host
/// side of this trait).
pub trait Router: Send + Sync {
    fn next_hop(&self, request: &rsip::Request) -> Result<Hop>;
}
