//! Transaction identity.
//!
//! A [`TransactionKey`] is the branch id (RFC 3261) or, for pre-RFC3261
//! peers, the RFC 2543 fallback hash from [`crate::identifiers`], paired
//! with the method and the role that created the transaction (a client and
//! a server transaction can legitimately share a branch+method pair).

use crate::identifiers;
use crate::{Error, Result};
use rsip::prelude::HeadersExt;
use rsip::{Method, Request};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
    pub role: TransactionRole,
}

impl std::hash::Hash for TransactionKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.branch.hash(state);
        self.method.to_string().hash(state);
        self.role.hash(state);
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}-{}-{}",
            self.role,
            self.method,
            self.branch
        )
    }
}

impl TransactionKey {
    pub fn from_request(request: &Request, role: TransactionRole) -> Result<Self> {
        let msg = rsip::SipMessage::Request(request.clone());
        let branch = identifiers::transaction_id(&msg).ok_or_else(|| {
            Error::InvalidArgument("request has no Via header to derive a branch from".into())
        })?;
        // CANCEL shares its branch with the request it cancels, but ACK to a
        // non-2xx also shares the branch of the INVITE it acknowledges; both
        // are matched on the ORIGINAL method for transaction lookup purposes
        // per RFC 3261 SS17.1.3/17.2.3, except ACK to 2xx which is its own
        // transaction (new branch is used by the caller in that case).
        let method = request.method.clone();
        Ok(TransactionKey {
            branch,
            method,
            role,
        })
    }

    /// Matches as if this key described the given method, ignoring CANCEL's
    /// distinct-but-same-branch relationship to the original request.
    pub fn matches_method(&self, method: Method) -> bool {
        self.method == method
    }
}

pub trait TopViaBranchExt {
    fn top_via_branch(&self) -> Option<String>;
}

impl TopViaBranchExt for Request {
    fn top_via_branch(&self) -> Option<String> {
        identifiers::branch_id(&rsip::SipMessage::Request(self.clone()))
    }
}
