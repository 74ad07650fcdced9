//! Endpoint-level request/response construction helpers.
//!
//! `EndpointInner` is the dialog and transaction layers' view of "this SIP
//! stack instance": its User-Agent string, its Call-ID suffix, and the
//! local Via it advertises. It owns no sockets; actual delivery goes
//! through the [`crate::transport::Transport`] collaborator supplied by the
//! host.

use crate::config::StackConfig;
use crate::transport::SipAddr;
use crate::{Error, Result};
use std::sync::Arc;

pub type EndpointInnerRef = Arc<EndpointInner>;

#[derive(Debug, Clone, Default)]
pub struct EndpointOption {
    pub callid_suffix: Option<String>,
}

pub struct EndpointInner {
    pub option: EndpointOption,
    pub user_agent: String,
    pub config: StackConfig,
    local_addr: SipAddr,
}

impl EndpointInner {
    pub fn new(user_agent: String, local_addr: SipAddr, option: EndpointOption, config: StackConfig) -> EndpointInnerRef {
        Arc::new(EndpointInner {
            option,
            user_agent,
            config,
            local_addr,
        })
    }

    /// Builds a fresh Via header for a new client transaction. `addr`
    /// overrides the endpoint's default local address (e.g. when sending
    /// over a connection opened for this dialog); `branch` overrides the
    /// randomly generated one (used when an ACK must reuse a branch).
    pub fn get_via(&self, addr: Option<SipAddr>, branch: Option<String>) -> Result<rsip::typed::Via> {
        let addr = addr.unwrap_or_else(|| self.local_addr.clone());
        let branch = branch.unwrap_or_else(super::make_branch);
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport: addr.transport,
            uri: rsip::Uri {
                host_with_port: (addr.host.as_str(), addr.port).try_into().map_err(|_| {
                    Error::InvalidArgument(format!("invalid local address {}", addr.host))
                })?,
                ..Default::default()
            },
            params: vec![rsip::Param::Branch(branch.into())],
        })
    }
}
