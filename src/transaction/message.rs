//! Endpoint-level request/response construction: `make_request`/
//! `make_response` accept an already resolved Via rather than deriving one
//! from an active connection (this crate never owns a connection).

use super::endpoint::EndpointInner;
use super::make_call_id;
use rsip::{Header, Request, Response, StatusCode};

impl EndpointInner {
    /// Constructs a request with the mandatory RFC 3261 header set: Via,
    /// Call-ID, From, To, CSeq, Max-Forwards, User-Agent.
    pub fn make_request(
        &self,
        method: rsip::Method,
        req_uri: rsip::Uri,
        via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        seq: u32,
    ) -> Request {
        let headers = vec![
            Header::Via(via.into()),
            Header::CallId(make_call_id(self.option.callid_suffix.as_deref()).into()),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.user_agent.clone().into()),
        ];
        Request {
            method,
            uri: req_uri,
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        }
    }

    /// Constructs a response from a request, copying the headers required
    /// for transaction/dialog matching (Via, Call-ID, From, To, CSeq,
    /// Max-Forwards) and filtering everything else out.
    pub fn make_response(&self, req: &Request, status_code: StatusCode, body: Option<Vec<u8>>) -> Response {
        let mut headers = req.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::MaxForwards(_)
                    | Header::CSeq(_)
            )
        });
        headers.push(Header::UserAgent(self.user_agent.clone().into()));
        let body = body.unwrap_or_default();
        if !body.is_empty() {
            headers.push(Header::ContentLength((body.len() as u32).into()));
        }
        Response {
            status_code,
            version: req.version.clone(),
            headers,
            body,
        }
    }
}
