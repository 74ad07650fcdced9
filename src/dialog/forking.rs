//! Forked-response bookkeeping: retransmission fingerprinting across
//! branches created by the same client INVITE seen by multiple peers.

use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::Response;

/// `status/cseq/method[/sdp-hash][/rseq]`, used to recognize a response
/// already delivered on another forked branch.
pub fn fingerprint(resp: &Response) -> String {
    let cseq = resp.cseq_header().ok().and_then(|h| h.typed().ok());
    let mut parts = vec![
        resp.status_code.to_string(),
        cseq.as_ref().map(|c| c.seq.to_string()).unwrap_or_default(),
        cseq.as_ref().map(|c| c.method.to_string()).unwrap_or_default(),
    ];
    if !resp.body.is_empty() {
        parts.push(format!("{:x}", simple_hash(&resp.body)));
    }
    if let Some(rseq) = resp
        .headers
        .iter()
        .find_map(|h| match h {
            rsip::Header::Other(name, value) if name.eq_ignore_ascii_case("RSeq") => {
                Some(value.clone())
            }
            _ => None,
        })
    {
        parts.push(rseq);
    }
    parts.join("/")
}

fn simple_hash(bytes: &[u8]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: rsip::StatusCode, cseq: &str) -> Response {
        Response {
            status_code: status,
            version: rsip::Version::V2,
            headers: vec![rsip::Header::CSeq(cseq.into())].into(),
            body: vec![],
        }
    }

    #[test]
    fn fingerprint_distinguishes_status_and_cseq() {
        let a = response(rsip::StatusCode::Ringing, "1 INVITE");
        let b = response(rsip::StatusCode::OK, "1 INVITE");
        assert_ne!(fingerprint(&a), fingerprint(&b));

        let c = response(rsip::StatusCode::Ringing, "1 INVITE");
        assert_eq!(fingerprint(&a), fingerprint(&c));
    }
}
