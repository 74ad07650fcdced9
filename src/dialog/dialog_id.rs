//! Dialog identity: the full dialog id once both tags are known, and the
//! early dialog id used before the remote tag is finalized.

use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Request, Response};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

impl DialogId {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>, remote_tag: impl Into<String>) -> Self {
        DialogId {
            call_id: call_id.into().to_lowercase(),
            local_tag: local_tag.into().to_lowercase(),
            remote_tag: remote_tag.into().to_lowercase(),
        }
    }

    pub fn early(&self) -> EarlyDialogId {
        EarlyDialogId {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
        }
    }
}

/// `call-id:local-tag`, identifying a dialog before the remote tag has been
/// finalized (NULL/EARLY states).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EarlyDialogId {
    pub call_id: String,
    pub local_tag: String,
}

impl fmt::Display for EarlyDialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.call_id, self.local_tag)
    }
}

impl EarlyDialogId {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>) -> Self {
        EarlyDialogId {
            call_id: call_id.into().to_lowercase(),
            local_tag: local_tag.into().to_lowercase(),
        }
    }
}

/// Derives the early dialog id a freshly sent request establishes, for the
/// UAC (`local_tag` is the From tag).
pub fn early_id_from_request(req: &Request) -> crate::Result<EarlyDialogId> {
    let call_id = req.call_id_header()?.value().to_string();
    let local_tag = req
        .from_header()?
        .tag()?
        .ok_or_else(|| crate::Error::InvalidArgument("request has no From tag".into()))?
        .to_string();
    Ok(EarlyDialogId::new(call_id, local_tag))
}

/// Derives the full dialog id from a UAC's perspective once a response
/// carries a to-tag: local tag is From, remote tag is To.
pub fn id_from_response_as_uac(resp: &Response) -> crate::Result<Option<DialogId>> {
    let call_id = resp.call_id_header()?.value().to_string();
    let local_tag = resp
        .from_header()?
        .tag()?
        .map(|t| t.to_string())
        .ok_or_else(|| crate::Error::InvalidArgument("response has no From tag".into()))?;
    let remote_tag = match resp.to_header()?.tag()? {
        Some(t) => t.to_string(),
        None => return Ok(None),
    };
    Ok(Some(DialogId::new(call_id, local_tag, remote_tag)))
}

/// Derives the full dialog id from a UAS's perspective: local tag is To,
/// remote tag is From.
pub fn id_from_request_as_uas(req: &Request) -> crate::Result<DialogId> {
    let call_id = req.call_id_header()?.value().to_string();
    let remote_tag = req
        .from_header()?
        .tag()?
        .ok_or_else(|| crate::Error::InvalidArgument("request has no From tag".into()))?
        .to_string();
    let local_tag = req
        .to_header()?
        .tag()?
        .ok_or_else(|| crate::Error::InvalidArgument("request has no To tag".into()))?
        .to_string();
    Ok(DialogId::new(call_id, local_tag, remote_tag))
}
