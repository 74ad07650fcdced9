//! Identifier algebra: pure functions over parsed messages that compute the
//! keys the rest of the crate indexes by (branch id, transaction id, dialog
//! id, merge id). None of these functions touch any registry or dialog
//! state; they only read header fields.

use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Method, SipMessage};

/// RFC 3261 magic cookie prefixing branch parameters of transaction-aware
/// (RFC 3261-compliant) clients.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// The `branch` parameter of the topmost Via header, if any.
pub fn branch_id(msg: &SipMessage) -> Option<String> {
    let via = match msg {
        SipMessage::Request(r) => r.via_header().ok()?,
        SipMessage::Response(r) => r.via_header().ok()?,
    };
    let typed = via.typed().ok()?;
    typed.branch().map(|b| b.to_string())
}

/// The transaction id: the branch if it carries the magic cookie, otherwise
/// a stable hash over call-id/tags/CSeq/top-Via for RFC 2543 compatibility.
pub fn transaction_id(msg: &SipMessage) -> Option<String> {
    if let Some(branch) = branch_id(msg) {
        if branch.starts_with(MAGIC_COOKIE) {
            return Some(branch);
        }
        return Some(rfc2543_fallback_id(msg));
    }
    Some(rfc2543_fallback_id(msg))
}

fn rfc2543_fallback_id(msg: &SipMessage) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    let (call_id, from_tag, to_tag, cseq, via) = match msg {
        SipMessage::Request(r) => (
            r.call_id_header().ok().map(|h| h.value().to_string()),
            r.from_header().ok().and_then(|h| h.tag().ok().flatten().map(|t| t.to_string())),
            None,
            r.cseq_header().ok().map(|h| h.to_string()),
            r.via_header().ok().map(|h| h.to_string()),
        ),
        SipMessage::Response(r) => (
            r.call_id_header().ok().map(|h| h.value().to_string()),
            r.from_header().ok().and_then(|h| h.tag().ok().flatten().map(|t| t.to_string())),
            r.to_header().ok().and_then(|h| h.tag().ok().flatten().map(|t| t.to_string())),
            r.cseq_header().ok().map(|h| h.to_string()),
            r.via_header().ok().map(|h| h.to_string()),
        ),
    };
    call_id.hash(&mut hasher);
    from_tag.hash(&mut hasher);
    to_tag.hash(&mut hasher);
    cseq.hash(&mut hasher);
    via.hash(&mut hasher);
    format!("rfc2543-{:x}", hasher.finish())
}

/// `call-id + ":" + local-tag + ":" + remote-tag`, omitting segments whose
/// tag is absent. `as_server` selects which side (to/from) is "local".
pub fn dialog_id(msg: &SipMessage, as_server: bool) -> Option<String> {
    let call_id = call_id_of(msg)?;
    let (to_tag, from_tag) = to_from_tags(msg);
    let (local_tag, remote_tag) = if as_server {
        (to_tag, from_tag)
    } else {
        (from_tag, to_tag)
    };
    let mut parts = vec![call_id.to_lowercase()];
    if let Some(t) = local_tag {
        parts.push(t.to_lowercase());
    }
    if let Some(t) = remote_tag {
        parts.push(t.to_lowercase());
    }
    Some(parts.join(":"))
}

/// `call-id + ":" + from-tag + ":" + CSeq-number`, used for loop detection.
pub fn merge_id(msg: &SipMessage) -> Option<String> {
    let call_id = call_id_of(msg)?;
    let from_tag = match msg {
        SipMessage::Request(r) => r.from_header().ok()?.tag().ok().flatten()?.to_string(),
        SipMessage::Response(r) => r.from_header().ok()?.tag().ok().flatten()?.to_string(),
    };
    let cseq_num = match msg {
        SipMessage::Request(r) => r.cseq_header().ok()?.typed().ok()?.seq,
        SipMessage::Response(r) => r.cseq_header().ok()?.typed().ok()?.seq,
    };
    Some(format!("{}:{}:{}", call_id.to_lowercase(), from_tag, cseq_num))
}

/// Whether an in-dialog request of this method is allowed to refresh the
/// dialog's `remote_target`.
pub fn is_target_refresh(method: Method) -> bool {
    matches!(method, Method::Invite | Method::Update | Method::Subscribe)
}

fn call_id_of(msg: &SipMessage) -> Option<String> {
    match msg {
        SipMessage::Request(r) => r.call_id_header().ok().map(|h| h.value().to_string()),
        SipMessage::Response(r) => r.call_id_header().ok().map(|h| h.value().to_string()),
    }
}

fn to_from_tags(msg: &SipMessage) -> (Option<String>, Option<String>) {
    match msg {
        SipMessage::Request(r) => (
            r.to_header().ok().and_then(|h| h.tag().ok().flatten().map(|t| t.to_string())),
            r.from_header().ok().and_then(|h| h.tag().ok().flatten().map(|t| t.to_string())),
        ),
        SipMessage::Response(r) => (
            r.to_header().ok().and_then(|h| h.tag().ok().flatten().map(|t| t.to_string())),
            r.from_header().ok().and_then(|h| h.tag().ok().flatten().map(|t| t.to_string())),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::Header;

    fn sample_request() -> SipMessage {
        rsip::Request {
            method: Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            headers: vec![
                Header::Via("SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds".into()),
                Header::CallId("a84b4c76e66710".into()),
                Header::From("Alice <sip:alice@atlanta.com>;tag=1928301774".into()),
                Header::To("Bob <sip:bob@biloxi.com>".into()),
                Header::CSeq("1 INVITE".into()),
            ]
            .into(),
            version: rsip::Version::V2,
            body: vec![],
        }
        .into()
    }

    #[test]
    fn branch_is_magic_cookie_prefixed() {
        let req = sample_request();
        let branch = branch_id(&req).unwrap();
        assert_eq!(branch, "z9hG4bK776asdhds");
        assert_eq!(transaction_id(&req).unwrap(), branch);
    }

    #[test]
    fn dialog_id_omits_missing_remote_tag() {
        let req = sample_request();
        assert_eq!(dialog_id(&req, false).unwrap(), "a84b4c76e66710:1928301774");
    }

    #[test]
    fn merge_id_combines_call_id_from_tag_and_cseq() {
        let req = sample_request();
        assert_eq!(merge_id(&req).unwrap(), "a84b4c76e66710:1928301774:1");
    }

    #[test]
    fn target_refresh_methods() {
        assert!(is_target_refresh(Method::Invite));
        assert!(is_target_refresh(Method::Subscribe));
        assert!(is_target_refresh(Method::Update));
        assert!(!is_target_refresh(Method::Bye));
        assert!(!is_target_refresh(Method::Notify));
    }
}
