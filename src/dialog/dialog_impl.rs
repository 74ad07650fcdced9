//! The dialog state machine -- the centerpiece of this crate.

use super::dialog_id::{self, DialogId, EarlyDialogId};
use super::dialog_state::{DialogState, TerminatedReason};
use super::forking;
use super::route_set::{self, Route};
use super::subscription::SubscriptionState;
use crate::config::StackConfig;
use crate::events::{DeliverOnce, DialogErrorReason, Event, EventSender};
use crate::identifiers;
use crate::transaction::{make_branch, make_tag, TopViaBranchExt};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, Request, Response, StatusCode};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, Weak};
use tracing::{debug, info, warn};

/// A pending reliable provisional response awaiting PRACK (RFC 3262).
#[derive(Debug, Clone)]
pub struct PendingReliableResponse {
    pub response: Response,
    pub rseq: u32,
    pub cseq: u32,
    pub method: Method,
    pub timer_id: Option<u64>,
}

/// Enough of the last response to build in-dialog requests and ACKs without
/// retaining the full parsed message.
#[derive(Debug, Clone)]
pub struct LastResponseSummary {
    pub status_code: StatusCode,
    pub method: Method,
    pub cseq: u32,
    pub to_tag: Option<String>,
    pub from_tag: Option<String>,
    pub top_via: Option<Header>,
}

/// Summary of the transaction that created the dialog, retained after the
/// transaction itself is discarded.
#[derive(Debug, Clone)]
pub struct FirstTxInfo {
    pub method: Method,
    pub branch: String,
    pub secure: bool,
    pub merge_id: Option<String>,
}

pub struct Dialog {
    inner: std::sync::Arc<DialogInner>,
}

impl Clone for Dialog {
    fn clone(&self) -> Self {
        Dialog {
            inner: self.inner.clone(),
        }
    }
}

impl std::ops::Deref for Dialog {
    type Target = DialogInner;
    fn deref(&self) -> &DialogInner {
        &self.inner
    }
}

pub struct DialogInner {
    pub is_server: bool,
    pub call_id: String,
    pub local_party: rsip::Uri,
    pub remote_party: rsip::Uri,
    pub local_tag: String,

    state: RwLock<DialogState>,
    remote_tag: RwLock<Option<String>>,
    remote_target: RwLock<Option<rsip::Uri>>,
    route_set: RwLock<Vec<Route>>,

    local_sequence_number: AtomicU32,
    remote_sequence_number: RwLock<Option<u32>>,
    last_invite_ok_received: AtomicU32,
    last_ack_sent: RwLock<Option<Vec<u8>>>,
    highest_ack_cseq: AtomicU32,
    ack_seen: RwLock<Option<u32>>,

    pub terminate_on_bye: bool,
    pub is_back_to_back_user_agent: bool,

    last_response: RwLock<Option<LastResponseSummary>>,
    pub first_tx_info: FirstTxInfo,
    pending_reliable_response: Mutex<Option<PendingReliableResponse>>,

    original_dialog: RwLock<Option<Weak<DialogInner>>>,
    responses_seen_in_forking: Mutex<std::collections::HashSet<String>>,

    pub subscription: RwLock<Option<SubscriptionState>>,
    cached_authorization: RwLock<Option<Header>>,

    re_invite_in_flight: RwLock<bool>,

    terminated_once: DeliverOnce,
    audit_tag: AtomicU64,

    events: Option<EventSender>,
}

impl Dialog {
    /// Creates a NULL-state dialog for an outbound dialog-creating request
    /// about to be sent (UAC side).
    pub fn new_uac(
        request: &Request,
        events: Option<EventSender>,
    ) -> Result<Self> {
        let call_id = request.call_id_header()?.value().to_string();
        let local_tag = request
            .from_header()?
            .tag()?
            .ok_or_else(|| Error::InvalidArgument("request has no From tag".into()))?
            .to_string();
        let local_party = request.from_header()?.typed()?.uri;
        let remote_party = request.to_header()?.typed()?.uri;
        let merge_id = identifiers::merge_id(&rsip::SipMessage::Request(request.clone()));
        let branch = request.top_via_branch().unwrap_or_default();

        Ok(Dialog {
            inner: std::sync::Arc::new(DialogInner {
                is_server: false,
                call_id,
                local_party,
                remote_party,
                local_tag,
                state: RwLock::new(DialogState::Null),
                remote_tag: RwLock::new(None),
                remote_target: RwLock::new(None),
                route_set: RwLock::new(Vec::new()),
                local_sequence_number: AtomicU32::new(request.cseq_header()?.typed()?.seq),
                remote_sequence_number: RwLock::new(None),
                last_invite_ok_received: AtomicU32::new(0),
                last_ack_sent: RwLock::new(None),
                highest_ack_cseq: AtomicU32::new(0),
                ack_seen: RwLock::new(None),
                terminate_on_bye: true,
                is_back_to_back_user_agent: false,
                last_response: RwLock::new(None),
                first_tx_info: FirstTxInfo {
                    method: request.method.clone(),
                    branch,
                    secure: request.uri.scheme == Some(rsip::Scheme::Sips),
                    merge_id,
                },
                pending_reliable_response: Mutex::new(None),
                original_dialog: RwLock::new(None),
                responses_seen_in_forking: Mutex::new(Default::default()),
                subscription: RwLock::new(None),
                cached_authorization: RwLock::new(None),
                re_invite_in_flight: RwLock::new(false),
                terminated_once: DeliverOnce::new(),
                audit_tag: AtomicU64::new(0),
                events,
            }),
        })
    }

    /// Creates a dialog for an inbound dialog-creating request (UAS side).
    /// The dialog starts in NULL; the caller is responsible for assigning a
    /// To-tag on the first response sent, which is what actually moves the
    /// dialog to EARLY/CONFIRMED via [`Dialog::set_last_response`]-equivalent
    /// server-side bookkeeping (`note_sent_response`).
    pub fn new_uas(request: &Request, local_tag: String, events: Option<EventSender>) -> Result<Self> {
        let call_id = request.call_id_header()?.value().to_string();
        let local_party = request.to_header()?.typed()?.uri;
        let remote_party = request.from_header()?.typed()?.uri;
        let remote_tag = request.from_header()?.tag()?.map(|t| t.to_string());
        let merge_id = identifiers::merge_id(&rsip::SipMessage::Request(request.clone()));
        let branch = request.top_via_branch().unwrap_or_default();
        let route_set = route_set::route_set_from_request(request);
        let remote_target = route_set::remote_target_from_contact(&request.headers);

        Ok(Dialog {
            inner: std::sync::Arc::new(DialogInner {
                is_server: true,
                call_id,
                local_party,
                remote_party,
                local_tag,
                state: RwLock::new(DialogState::Null),
                remote_tag: RwLock::new(remote_tag),
                remote_target: RwLock::new(remote_target),
                route_set: RwLock::new(route_set),
                local_sequence_number: AtomicU32::new(0),
                remote_sequence_number: RwLock::new(Some(request.cseq_header()?.typed()?.seq)),
                last_invite_ok_received: AtomicU32::new(0),
                last_ack_sent: RwLock::new(None),
                highest_ack_cseq: AtomicU32::new(0),
                ack_seen: RwLock::new(None),
                terminate_on_bye: true,
                is_back_to_back_user_agent: false,
                last_response: RwLock::new(None),
                first_tx_info: FirstTxInfo {
                    method: request.method.clone(),
                    branch,
                    secure: request.uri.scheme == Some(rsip::Scheme::Sips),
                    merge_id,
                },
                pending_reliable_response: Mutex::new(None),
                original_dialog: RwLock::new(None),
                responses_seen_in_forking: Mutex::new(Default::default()),
                subscription: RwLock::new(None),
                cached_authorization: RwLock::new(None),
                re_invite_in_flight: RwLock::new(false),
                terminated_once: DeliverOnce::new(),
                audit_tag: AtomicU64::new(0),
                events,
            }),
        })
    }

    pub fn is_server(&self) -> bool {
        self.inner.is_server
    }

    pub fn call_id(&self) -> &str {
        &self.inner.call_id
    }

    pub fn state(&self) -> DialogState {
        self.inner.state.read().unwrap().clone()
    }

    pub fn early_dialog_id(&self) -> EarlyDialogId {
        EarlyDialogId::new(self.inner.call_id.clone(), self.inner.local_tag.clone())
    }

    pub fn dialog_id(&self) -> Option<DialogId> {
        self.inner.state.read().unwrap().dialog_id().cloned()
    }

    fn remote_tag(&self) -> Option<String> {
        self.inner.remote_tag.read().unwrap().clone()
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.inner.events {
            let _ = tx.send(event);
        }
    }

    fn route_set(&self) -> Vec<Route> {
        self.inner.route_set.read().unwrap().clone()
    }

    fn remote_target(&self) -> Option<rsip::Uri> {
        self.inner.remote_target.read().unwrap().clone()
    }

    /// createRequest: builds an in-dialog request. Requires
    /// EARLY/CONFIRMED (BYE is additionally allowed per RFC 3261 S15 from
    /// either EARLY or CONFIRMED).
    pub fn create_request(&self, method: Method) -> Result<Request> {
        if matches!(method, Method::Ack | Method::Cancel) {
            return Err(Error::InvalidArgument(format!(
                "{} must be built via its own constructor, not create_request",
                method
            )));
        }
        let state = self.state();
        let ok_state = match method {
            Method::Bye => matches!(state, DialogState::Early(..) | DialogState::Confirmed(..)),
            _ => matches!(state, DialogState::Early(..) | DialogState::Confirmed(..)),
        };
        if !ok_state {
            return Err(Error::SequenceError(format!(
                "cannot create {} request while dialog is {:?}",
                method, state
            )));
        }

        let remote_tag = self.remote_tag();
        let seq = self.inner.local_sequence_number.fetch_add(1, Ordering::SeqCst) + 1;
        if seq == u32::MAX {
            return Err(Error::InvalidArgument(
                "CSeq has reached the maximum representable value".into(),
            ));
        }

        let route_set = self.route_set();
        let remote_target = self.remote_target();
        let (request_uri, route_headers) =
            route_set::build_routing(&route_set, remote_target.as_ref(), &self.inner.remote_party);

        let mut from = rsip::typed::From {
            display_name: None,
            uri: self.inner.local_party.clone(),
            params: vec![],
        }
        .with_tag(self.inner.local_tag.clone().into());
        from.display_name = None;

        let mut to = rsip::typed::To {
            display_name: None,
            uri: self.inner.remote_party.clone(),
            params: vec![],
        };
        if let Some(tag) = &remote_tag {
            to = to.with_tag(tag.clone().into());
        }

        let via = rsip::typed::Via {
            version: rsip::Version::V2,
            transport: rsip::transport::Transport::Udp,
            uri: rsip::Uri {
                host_with_port: request_uri.host_with_port.clone(),
                ..Default::default()
            },
            params: vec![rsip::Param::Branch(make_branch().into())],
        };

        let mut headers: rsip::Headers = vec![
            Header::Via(via.into()),
            Header::CallId(self.inner.call_id.clone().into()),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(rsip::typed::CSeq { seq, method: method.clone() }.into()),
            Header::MaxForwards(70.into()),
        ]
        .into();
        for route in route_headers {
            headers.push(route);
        }
        let notify_target_refresh =
            method == Method::Notify && self.inner.subscription.read().unwrap().is_some();
        if identifiers::is_target_refresh(method.clone()) || notify_target_refresh {
            headers.push(Header::Contact(
                rsip::typed::Contact {
                    display_name: None,
                    uri: self.inner.local_party.clone(),
                    params: vec![],
                }
                .into(),
            ));
        }
        if let Some(auth) = self.inner.cached_authorization.read().unwrap().clone() {
            headers.push(auth);
        }

        Ok(Request {
            method,
            uri: request_uri,
            headers,
            version: rsip::Version::V2,
            body: vec![],
        })
    }

    /// sendRequest: validates the request may be sent and caches
    /// any Proxy-Authorization for replay. Actual transmission/serialization
    /// through the transaction layer is the caller's responsibility; this
    /// crate never opens a socket.
    pub fn send_request(&self, request: &Request) -> Result<()> {
        if matches!(request.method, Method::Ack | Method::Cancel) {
            return Err(Error::InvalidArgument(
                "ACK/CANCEL are sent directly, not via send_request".into(),
            ));
        }
        if request.method == Method::Invite {
            let mut in_flight = self.inner.re_invite_in_flight.write().unwrap();
            if *in_flight && self.state().is_confirmed() {
                return Err(Error::SequenceError(
                    "a re-INVITE is already in flight on this dialog".into(),
                ));
            }
            *in_flight = true;
        }
        if let Some(auth) = request
            .headers
            .iter()
            .find(|h| matches!(h, Header::ProxyAuthorization(_) | Header::Authorization(_)))
        {
            *self.inner.cached_authorization.write().unwrap() = Some(auth.clone());
        }
        Ok(())
    }

    /// createAck: builds the ACK for a 2xx response to INVITE.
    pub fn create_ack(&self, cseq: u32) -> Result<Request> {
        if self.inner.last_invite_ok_received.load(Ordering::SeqCst) < cseq {
            return Err(Error::SequenceError(
                "no 2xx has been seen for this CSeq yet".into(),
            ));
        }
        let remote_tag = self
            .remote_tag()
            .ok_or_else(|| Error::SequenceError("dialog has no remote tag yet".into()))?;

        let route_set = self.route_set();
        let remote_target = self.remote_target();
        let (request_uri, route_headers) =
            route_set::build_routing(&route_set, remote_target.as_ref(), &self.inner.remote_party);

        let from = rsip::typed::From {
            display_name: None,
            uri: self.inner.local_party.clone(),
            params: vec![],
        }
        .with_tag(self.inner.local_tag.clone().into());
        let to = rsip::typed::To {
            display_name: None,
            uri: self.inner.remote_party.clone(),
            params: vec![],
        }
        .with_tag(remote_tag.into());
        let via = rsip::typed::Via {
            version: rsip::Version::V2,
            transport: rsip::transport::Transport::Udp,
            uri: rsip::Uri {
                host_with_port: request_uri.host_with_port.clone(),
                ..Default::default()
            },
            params: vec![rsip::Param::Branch(make_branch().into())],
        };

        let mut headers: rsip::Headers = vec![
            Header::Via(via.into()),
            Header::CallId(self.inner.call_id.clone().into()),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(
                rsip::typed::CSeq {
                    seq: cseq,
                    method: Method::Ack,
                }
                .into(),
            ),
            Header::MaxForwards(70.into()),
        ]
        .into();
        for route in route_headers {
            headers.push(route);
        }
        if let Some(auth) = self.inner.cached_authorization.read().unwrap().clone() {
            headers.push(auth);
        }

        Ok(Request {
            method: Method::Ack,
            uri: request_uri,
            headers,
            version: rsip::Version::V2,
            body: vec![],
        })
    }

    /// sendAck: records the ACK as sent and clears any
    /// dialog-delete task that was waiting on it.
    pub fn send_ack(&self, request: &Request, serialized: Vec<u8>) -> Result<()> {
        if request.method != Method::Ack {
            return Err(Error::InvalidArgument("not an ACK".into()));
        }
        let cseq = request.cseq_header()?.typed()?.seq;
        *self.inner.last_ack_sent.write().unwrap() = Some(serialized);
        self.inner.highest_ack_cseq.fetch_max(cseq, Ordering::SeqCst);
        Ok(())
    }

    /// createPrack: the RAck carries the 1xx's RSeq followed by
    /// its CSeq number and method.
    pub fn create_prack(&self, response_1xx: &Response) -> Result<Request> {
        let cseq = response_1xx.cseq_header()?.typed()?;
        let rseq = rseq_of(response_1xx).ok_or_else(|| {
            Error::ProtocolError("1xx has no RSeq, cannot build PRACK".into())
        })?;
        let mut request = self.create_request(Method::PRack)?;
        request.headers.push(Header::Other(
            "RAck".into(),
            format!("{} {} {}", rseq, cseq.seq, cseq.method),
        ));
        Ok(request)
    }

    /// createReliableProvisionalResponse: valid only for
    /// server-side INVITE dialogs whose request carried 100rel support.
    pub fn create_reliable_provisional_response(&self, status: StatusCode, request: &Request) -> Result<Response> {
        if !self.inner.is_server {
            return Err(Error::InvalidArgument(
                "reliable provisional responses are only created server-side".into(),
            ));
        }
        let supports_100rel = request.headers.iter().any(|h| {
            let text = h.to_string();
            (text.starts_with("Supported") || text.starts_with("Require")) && text.contains("100rel")
        });
        if !supports_100rel {
            return Err(Error::ProtocolError(
                "request did not indicate 100rel support".into(),
            ));
        }
        let rseq = (rand::random::<u32>() % (u32::MAX - 1)) + 1;

        let mut headers = request.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_) | Header::CallId(_) | Header::From(_) | Header::To(_) | Header::CSeq(_)
            )
        });
        if let Some(to) = headers.iter_mut().find_map(|h| match h {
            Header::To(t) => Some(t),
            _ => None,
        }) {
            *to = rsip::typed::To::try_from(to.clone())?
                .with_tag(self.inner.local_tag.clone().into())
                .into();
        }
        for rr in request.headers.iter().filter(|h| matches!(h, Header::RecordRoute(_))) {
            headers.push(rr.clone());
        }
        headers.push(Header::Other("RSeq".into(), rseq.to_string()));
        headers.push(Header::Other("Require".into(), "100rel".into()));

        Ok(Response {
            status_code: status,
            version: rsip::Version::V2,
            headers,
            body: vec![],
        })
    }

    /// sendReliableProvisionalResponse: requires no other 1xx is
    /// currently outstanding; returns the dialog id it installed plus the
    /// timer value the caller should schedule for retransmission (Timer T1,
    /// doubling until T2).
    pub fn send_reliable_provisional_response(
        &self,
        response: &Response,
        config: &StackConfig,
    ) -> Result<DialogId> {
        let mut pending = self.inner.pending_reliable_response.lock().unwrap();
        if pending.is_some() {
            return Err(Error::SequenceError(
                "a reliable provisional response is already pending PRACK".into(),
            ));
        }
        let cseq = response.cseq_header()?.typed()?;
        let rseq = rseq_of(response)
            .ok_or_else(|| Error::InvalidArgument("response has no RSeq".into()))?;

        let dialog_id = dialog_id::id_from_request_as_uas(&rsip::Request {
            method: cseq.method.clone(),
            uri: self.inner.local_party.clone(),
            headers: response.headers.clone(),
            version: rsip::Version::V2,
            body: vec![],
        })
        .unwrap_or_else(|_| DialogId::new(self.inner.call_id.clone(), self.inner.local_tag.clone(), "".to_string()));

        *pending = Some(PendingReliableResponse {
            response: response.clone(),
            rseq,
            cseq: cseq.seq,
            method: cseq.method,
            timer_id: None,
        });
        let _ = config.t1;
        Ok(dialog_id)
    }

    /// handlePrack: matches RAck to the pending reliable response.
    pub fn handle_prack(&self, request: &Request) -> Result<bool> {
        let rack = request
            .headers
            .iter()
            .find_map(|h| {
                let text = h.to_string();
                text.strip_prefix("RAck:").or_else(|| text.strip_prefix("RAck :")).map(|s| s.trim().to_string())
            })
            .ok_or_else(|| Error::ProtocolError("PRACK has no RAck header".into()))?;

        let mut pending = self.inner.pending_reliable_response.lock().unwrap();
        let matches = match &*pending {
            Some(p) => rack == format!("{} {} {}", p.rseq, p.cseq, p.method),
            None => false,
        };
        if matches {
            *pending = None;
        }
        Ok(matches)
    }

    /// handleAck: returns true iff the ACK is new and should be
    /// delivered to the upper layer, flipping EARLY->CONFIRMED.
    pub fn handle_ack(&self, cseq: u32) -> Result<bool> {
        {
            let seen = self.inner.ack_seen.read().unwrap();
            if *seen == Some(cseq) {
                return Ok(false);
            }
        }
        if self.state().is_terminated() {
            return Ok(false);
        }
        let last = self.inner.last_response.read().unwrap().clone();
        let is_final_2xx = last
            .as_ref()
            .map(|l| l.status_code.code() / 100 == 2 && l.cseq == cseq)
            .unwrap_or(false);
        if !is_final_2xx {
            return Ok(false);
        }
        *self.inner.ack_seen.write().unwrap() = Some(cseq);
        if let Some(id) = self.dialog_id() {
            self.transition(DialogState::Confirmed(id))?;
        }
        Ok(true)
    }

    /// setLastResponse: the central state-machine hook.
    pub fn set_last_response(
        &self,
        request: &Request,
        response: &Response,
        for_subscription: bool,
        config: &StackConfig,
    ) -> Result<()> {
        if response.status_code == StatusCode::Trying {
            return Ok(());
        }
        let cseq = response.cseq_header()?.typed()?;
        let to_tag = response.to_header()?.tag()?.map(|t| t.to_string());

        {
            let mut last = self.inner.last_response.write().unwrap();
            *last = Some(LastResponseSummary {
                status_code: response.status_code.clone(),
                method: cseq.method.clone(),
                cseq: cseq.seq,
                to_tag: to_tag.clone(),
                from_tag: response.from_header()?.tag()?.map(|t| t.to_string()),
                top_via: response.headers.iter().find(|h| matches!(h, Header::Via(_))).cloned(),
            });
        }

        let code = response.status_code.code();
        let state = self.state();
        let is_dialog_creating = matches!(cseq.method, Method::Invite | Method::Subscribe);

        if (100..200).contains(&code) && to_tag.is_some() && matches!(state, DialogState::Null) {
            let new_tag = to_tag.clone().unwrap();
            *self.inner.remote_tag.write().unwrap() = Some(new_tag.clone());
            self.install_route_set_from_response(response, config);
            let early_id = self.early_dialog_id();
            self.transition(DialogState::Early(early_id, response.clone()))?;
            return Ok(());
        }

        if (100..200).contains(&code) && to_tag.is_some() && state.is_early() {
            if config.remote_tag_reassignment_allowed {
                *self.inner.remote_tag.write().unwrap() = to_tag.clone();
                self.install_route_set_from_response(response, config);
            }
            return Ok(());
        }

        if code / 100 == 2 && is_dialog_creating && to_tag.is_some() {
            *self.inner.remote_tag.write().unwrap() = to_tag;
            if !(cseq.method == Method::Subscribe) {
                self.install_route_set_from_response(response, config);
            }
            if let Some(target) = route_set::remote_target_from_contact(&response.headers) {
                *self.inner.remote_target.write().unwrap() = Some(target);
            }
            if cseq.method == Method::Invite {
                self.inner.last_invite_ok_received.fetch_max(cseq.seq, Ordering::SeqCst);
                *self.inner.re_invite_in_flight.write().unwrap() = false;
            }
            let id = self
                .dialog_id()
                .or_else(|| dialog_id::id_from_response_as_uac(response).ok().flatten());
            if let Some(id) = id {
                self.transition(DialogState::Confirmed(id))?;
            }
            return Ok(());
        }

        if (300..700).contains(&code) && is_dialog_creating && state.is_early() {
            let id = self
                .dialog_id()
                .unwrap_or_else(|| DialogId::new(self.inner.call_id.clone(), self.inner.local_tag.clone(), to_tag.clone().unwrap_or_default()));
            let reason = if for_subscription && code == 489 {
                return Ok(());
            } else {
                TerminatedReason::Rejected(response.status_code.clone())
            };
            self.transition(DialogState::Terminated(id, Some(reason)))?;
            return Ok(());
        }

        if code / 100 == 2 && cseq.method == Method::Invite && state.is_confirmed() {
            if let Some(target) = route_set::remote_target_from_contact(&response.headers) {
                *self.inner.remote_target.write().unwrap() = Some(target);
            }
            *self.inner.re_invite_in_flight.write().unwrap() = false;
            return Ok(());
        }

        if code / 100 == 2 && cseq.method == Method::Bye && self.inner.terminate_on_bye {
            let id = self.dialog_id().unwrap_or_else(|| {
                DialogId::new(self.inner.call_id.clone(), self.inner.local_tag.clone(), self.remote_tag().unwrap_or_default())
            });
            self.transition(DialogState::Terminated(id, Some(TerminatedReason::Bye)))?;
            return Ok(());
        }

        let _ = request;
        Ok(())
    }

    /// Server-side analogue of [`Dialog::set_last_response`]: called when
    /// this dialog's own UAS sends `response`. Needed because a sent
    /// response carries the dialog's own local tag as the To-tag rather than
    /// a remote tag just learned from the wire, so it cannot reuse
    /// `set_last_response`'s to-tag-is-remote-tag assumption.
    pub fn note_sent_response(&self, request: &Request, response: &Response) -> Result<()> {
        if response.status_code == StatusCode::Trying {
            return Ok(());
        }
        if !self.inner.is_server {
            return Err(Error::InvalidArgument(
                "note_sent_response is only valid for server-side dialogs".into(),
            ));
        }
        let cseq = response.cseq_header()?.typed()?;
        let code = response.status_code.code();
        let state = self.state();
        let is_dialog_creating = matches!(cseq.method, Method::Invite | Method::Subscribe);
        let remote_tag = self.remote_tag().unwrap_or_default();
        let id = DialogId::new(self.inner.call_id.clone(), self.inner.local_tag.clone(), remote_tag);

        if (100..200).contains(&code) && matches!(state, DialogState::Null) {
            self.transition(DialogState::Early(self.early_dialog_id(), response.clone()))?;
            return Ok(());
        }

        if code / 100 == 2 && is_dialog_creating {
            if let Some(target) = route_set::remote_target_from_contact(&request.headers) {
                *self.inner.remote_target.write().unwrap() = Some(target);
            }
            if cseq.method == Method::Invite {
                self.inner.last_invite_ok_received.fetch_max(cseq.seq, Ordering::SeqCst);
            }
            self.transition(DialogState::Confirmed(id))?;
            return Ok(());
        }

        if (300..700).contains(&code) && is_dialog_creating && state.is_early() {
            self.transition(DialogState::Terminated(
                id,
                Some(TerminatedReason::Rejected(response.status_code.clone())),
            ))?;
            return Ok(());
        }

        if code / 100 == 2 && cseq.method == Method::Bye && self.inner.terminate_on_bye {
            self.transition(DialogState::Terminated(id, Some(TerminatedReason::Bye)))?;
        }
        Ok(())
    }

    fn install_route_set_from_response(&self, response: &Response, config: &StackConfig) {
        let confirmed_and_frozen = self.state().is_confirmed();
        let subscribe_202_carve_out = config.pending_route_update_on_202
            && self.inner.subscription.read().unwrap().is_some()
            && response.status_code.code() == 202;
        if confirmed_and_frozen && !subscribe_202_carve_out {
            return;
        }
        *self.inner.route_set.write().unwrap() = route_set::route_set_from_response(response);
        if let Some(target) = route_set::remote_target_from_contact(&response.headers) {
            *self.inner.remote_target.write().unwrap() = Some(target);
        }
    }

    fn transition(&self, next: DialogState) -> Result<()> {
        let mut state = self.inner.state.write().unwrap();
        if !state.can_transition_to(&next) {
            warn!(from = ?*state, to = ?next, "illegal dialog state transition suppressed");
            return Ok(());
        }
        info!(call_id = %self.inner.call_id, from = ?*state, to = ?next, "dialog state transition");
        let terminated = next.is_terminated();
        let terminated_id = next.dialog_id().cloned();
        *state = next;
        drop(state);
        if terminated {
            if let Some(id) = terminated_id {
                if self.inner.terminated_once.fire() {
                    self.emit(Event::DialogTerminated(id));
                }
            }
        }
        Ok(())
    }

    /// Marks this dialog as a forked secondary of `primary`.
    pub fn set_original_dialog(&self, primary: &Dialog) {
        *self.inner.original_dialog.write().unwrap() = Some(std::sync::Arc::downgrade(&primary.inner));
    }

    pub fn original_dialog(&self) -> Option<Dialog> {
        self.inner
            .original_dialog
            .read()
            .unwrap()
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(|inner| Dialog { inner })
    }

    /// checkRetransmissionForForking: marks and reports whether
    /// this response fingerprint has already been observed on this dialog's
    /// fork family.
    pub fn check_retransmission_for_forking(&self, response: &Response) -> bool {
        let fp = forking::fingerprint(response);
        let mut seen = self.inner.responses_seen_in_forking.lock().unwrap();
        !seen.insert(fp)
    }

    /// Marks this dialog as carrying an RFC 3265 subscription, so that a
    /// NOTIFY on it is treated as target-refreshing and a 489 response
    /// during EARLY does not terminate it.
    pub fn set_subscription(&self, subscription: SubscriptionState) {
        *self.inner.subscription.write().unwrap() = Some(subscription);
    }

    pub fn subscription(&self) -> Option<SubscriptionState> {
        self.inner.subscription.read().unwrap().clone()
    }

    pub fn raise_early_state_timeout(&self) {
        if let Some(id) = self.dialog_id() {
            self.emit(Event::DialogError(id, DialogErrorReason::EarlyStateTimeout));
        } else {
            debug!(early_id = %self.early_dialog_id(), "early-state timeout on dialog without a full id yet");
        }
    }

    /// Arms the EARLY-state timeout: if this dialog is still EARLY once
    /// `config.early_dialog_timeout` elapses, fires `raise_early_state_timeout`.
    /// A dialog that reaches CONFIRMED or TERMINATED first is a no-op here --
    /// the check is against state at fire time, not at schedule time.
    pub fn spawn_early_state_timer(&self, config: &StackConfig) {
        let dialog = self.clone();
        let timeout = config.early_dialog_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if dialog.state().is_early() {
                dialog.raise_early_state_timeout();
            }
        });
    }

    /// Runs `on_expiry` after `config.connection_linger_timer`, keeping a
    /// TERMINATED dialog reachable that long for a retransmitted BYE or a
    /// late ACK. A zero linger runs `on_expiry` inline rather than scheduling
    /// a task for it.
    pub fn spawn_linger<F>(&self, config: &StackConfig, on_expiry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let linger = config.connection_linger_timer;
        if linger.is_zero() {
            on_expiry();
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            on_expiry();
        });
    }

    pub fn terminate(&self, reason: TerminatedReason) -> Result<()> {
        let id = self.dialog_id().unwrap_or_else(|| {
            DialogId::new(self.inner.call_id.clone(), self.inner.local_tag.clone(), self.remote_tag().unwrap_or_default())
        });
        self.transition(DialogState::Terminated(id, Some(reason)))
    }
}

fn rseq_of(response: &Response) -> Option<u32> {
    response.headers.iter().find_map(|h| {
        let text = h.to_string();
        text.strip_prefix("RSeq:")
            .or_else(|| text.strip_prefix("RSeq :"))
            .and_then(|v| v.trim().parse().ok())
    })
}
