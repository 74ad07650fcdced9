//! SIP transaction state machines (RFC 3261 S17).
//!
//! Client and server, INVITE and non-INVITE, share one [`Transaction`] type
//! discriminated by [`TransactionType`]; behavior that differs per type is
//! dispatched in `on_timer`/`on_receive` rather than via separate structs.

use super::endpoint::EndpointInnerRef;
use super::key::{TransactionKey, TransactionRole};
use crate::transport::SipAddr;
use crate::{Error, Result};
use rsip::prelude::HeadersExt;
use rsip::{Method, Request, Response, SipMessage, StatusCode};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;

#[derive(Debug)]
pub enum TransactionEvent {
    Received(SipMessage, Option<SipAddr>),
    Timer(TransactionTimer),
    Respond(Response),
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionTimer {
    /// Timer A/E: retransmit the request.
    Retransmit,
    /// Timer B/F: give up waiting for a final response.
    Timeout,
    /// Timer D/K: keep a completed transaction around to absorb
    /// retransmissions.
    Wait,
    /// Timer G: retransmit the final response (server INVITE).
    RetransmitResponse,
    /// Timer H: give up waiting for ACK (server INVITE).
    AckTimeout,
    /// Timer I: how long a confirmed server INVITE tx lingers.
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

impl TransactionState {
    fn can_transition(&self, kind: TransactionType, next: TransactionState) -> bool {
        use TransactionState::*;
        use TransactionType::*;
        match (kind, self, next) {
            (_, Terminated, _) => false,
            (ClientInvite, Calling, Proceeding | Completed | Terminated) => true,
            (ClientInvite, Proceeding, Proceeding | Completed | Terminated) => true,
            (ClientInvite, Completed, Terminated) => true,
            (ClientNonInvite, Trying, Proceeding | Completed | Terminated) => true,
            (ClientNonInvite, Proceeding, Proceeding | Completed | Terminated) => true,
            (ClientNonInvite, Completed, Terminated) => true,
            (ServerInvite, Proceeding, Proceeding | Completed | Terminated) => true,
            (ServerInvite, Completed, Confirmed | Terminated) => true,
            (ServerInvite, Confirmed, Terminated) => true,
            (ServerNonInvite, Trying, Proceeding | Completed | Terminated) => true,
            (ServerNonInvite, Proceeding, Completed | Terminated) => true,
            (ServerNonInvite, Completed, Terminated) => true,
            _ => false,
        }
    }
}

pub struct Transaction {
    pub key: TransactionKey,
    pub kind: TransactionType,
    pub original_request: Request,
    pub destination: Option<SipAddr>,
    pub last_response: Option<Response>,
    state: TransactionState,
    retransmit_count: u32,
    retransmit_interval: Duration,
    endpoint: EndpointInnerRef,
    event_tx: TransactionEventSender,
    event_rx: Option<TransactionEventReceiver>,
    timer_ids: Vec<u64>,
    ack_seen: bool,
}

impl Transaction {
    fn new(
        kind: TransactionType,
        key: TransactionKey,
        request: Request,
        endpoint: EndpointInnerRef,
        destination: Option<SipAddr>,
    ) -> Self {
        let (event_tx, event_rx) = unbounded_channel();
        let initial_state = match kind {
            TransactionType::ClientInvite => TransactionState::Calling,
            TransactionType::ClientNonInvite => TransactionState::Trying,
            // RFC 3261 S17.2.1: a server INVITE transaction enters Proceeding
            // immediately (the 100 Trying it may send is not a state of its own).
            TransactionType::ServerInvite => TransactionState::Proceeding,
            TransactionType::ServerNonInvite => TransactionState::Trying,
        };
        Transaction {
            key,
            kind,
            original_request: request,
            destination,
            last_response: None,
            state: initial_state,
            retransmit_count: 0,
            retransmit_interval: endpoint.config.t1,
            endpoint,
            event_tx,
            event_rx: Some(event_rx),
            timer_ids: Vec::new(),
            ack_seen: false,
        }
    }

    pub fn new_client(key: TransactionKey, request: Request, endpoint: EndpointInnerRef, destination: Option<SipAddr>) -> Self {
        let kind = if request.method == Method::Invite {
            TransactionType::ClientInvite
        } else {
            TransactionType::ClientNonInvite
        };
        Self::new(kind, key, request, endpoint, destination)
    }

    pub fn new_server(key: TransactionKey, request: Request, endpoint: EndpointInnerRef, destination: Option<SipAddr>) -> Self {
        let kind = if request.method == Method::Invite {
            TransactionType::ServerInvite
        } else {
            TransactionType::ServerNonInvite
        };
        Self::new(kind, key, request, endpoint, destination)
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn sender(&self) -> TransactionEventSender {
        self.event_tx.clone()
    }

    pub fn take_receiver(&mut self) -> Option<TransactionEventReceiver> {
        self.event_rx.take()
    }

    fn transition(&mut self, next: TransactionState) -> Result<()> {
        if !self.state.can_transition(self.kind, next) {
            return Err(Error::TransactionError(
                format!("illegal transition {:?} -> {:?}", self.state, next),
                self.key.clone(),
            ));
        }
        debug!(key = %self.key, from = ?self.state, to = ?next, "transaction state transition");
        self.state = next;
        Ok(())
    }

    /// Records a retransmission-eligible send and returns the next interval
    /// to schedule (RFC 3261 S17.1.1.2/17.1.2.2: doubling up to T2).
    pub fn note_retransmit(&mut self) -> Duration {
        self.retransmit_count += 1;
        let t2 = self.endpoint.config.t2;
        self.retransmit_interval = (self.retransmit_interval * 2).min(t2);
        self.retransmit_interval
    }

    pub fn retransmit_count(&self) -> u32 {
        self.retransmit_count
    }

    /// Called when a response arrives on a client transaction. Per RFC 3261
    /// S13.2.2.4, the transaction layer does NOT generate the ACK for a 2xx
    /// to INVITE; that remains the dialog's responsibility.
    pub fn on_response(&mut self, response: Response) -> Result<()> {
        let code = response.status_code.code();
        self.last_response = Some(response);
        match self.kind {
            TransactionType::ClientInvite => match code {
                100..=199 => self.transition(TransactionState::Proceeding),
                200..=299 => self.transition(TransactionState::Terminated),
                _ => self.transition(TransactionState::Completed),
            },
            TransactionType::ClientNonInvite => match code {
                100..=199 => self.transition(TransactionState::Proceeding),
                _ => self.transition(TransactionState::Completed),
            },
            _ => Err(Error::TransactionError(
                "on_response called on a server transaction".into(),
                self.key.clone(),
            )),
        }
    }

    /// Called when the local application hands a response to a server
    /// transaction for sending.
    pub fn on_send_response(&mut self, response: &Response) -> Result<()> {
        let code = response.status_code.code();
        match self.kind {
            TransactionType::ServerInvite => match code {
                100..=199 => self.transition(TransactionState::Proceeding),
                200..=299 => self.transition(TransactionState::Terminated),
                _ => self.transition(TransactionState::Completed),
            },
            TransactionType::ServerNonInvite => match code {
                100..=199 => self.transition(TransactionState::Proceeding),
                _ => self.transition(TransactionState::Completed),
            },
            _ => Err(Error::TransactionError(
                "on_send_response called on a client transaction".into(),
                self.key.clone(),
            )),
        }
    }

    /// Server INVITE transitions to Confirmed on ACK (Timer I then starts).
    pub fn on_ack(&mut self) -> Result<()> {
        if self.kind != TransactionType::ServerInvite {
            return Err(Error::TransactionError(
                "ACK only applies to server INVITE transactions".into(),
                self.key.clone(),
            ));
        }
        self.ack_seen = true;
        self.transition(TransactionState::Confirmed)
    }

    pub fn ack_seen(&self) -> bool {
        self.ack_seen
    }

    /// Whether a CANCEL matches this transaction: same branch, method
    /// INVITE, state still Calling/Proceeding.
    pub fn does_cancel_match(&self, cancel_branch: &str) -> bool {
        self.original_request.method == Method::Invite
            && self.key.branch == cancel_branch
            && matches!(self.state, TransactionState::Calling | TransactionState::Proceeding)
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TransactionState::Terminated
    }

    pub fn record_timer(&mut self, id: u64) {
        self.timer_ids.push(id);
    }

    pub fn drain_timer_ids(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.timer_ids)
    }

    pub fn lifetime_exceeded(&self, started_at: Instant) -> bool {
        let max = match self.kind {
            TransactionType::ClientInvite | TransactionType::ServerInvite => {
                self.endpoint.config.max_tx_lifetime_invite
            }
            _ => self.endpoint.config.max_tx_lifetime_non_invite,
        };
        started_at.elapsed() > max
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::transaction::endpoint::{EndpointInner, EndpointOption};
    use crate::transport::SipAddr;

    fn endpoint() -> EndpointInnerRef {
        EndpointInner::new(
            "test-ua/1.0".into(),
            SipAddr {
                host: "127.0.0.1".into(),
                port: 5060,
                transport: rsip::transport::Transport::Udp,
            },
            EndpointOption::default(),
            StackConfig::default(),
        )
    }

    fn invite() -> Request {
        Request {
            method: Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@biloxi.com").unwrap(),
            headers: vec![
                rsip::Header::Via("SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK74b43".into()),
                rsip::Header::CallId("a84b4c76e66710".into()),
                rsip::Header::From("Alice <sip:alice@atlanta.com>;tag=1928301774".into()),
                rsip::Header::To("Bob <sip:bob@biloxi.com>".into()),
                rsip::Header::CSeq("1 INVITE".into()),
            ]
            .into(),
            version: rsip::Version::V2,
            body: vec![],
        }
    }

    #[test]
    fn client_invite_2xx_terminates_without_ack() {
        let req = invite();
        let key = TransactionKey::from_request(&req, TransactionRole::Client).unwrap();
        let mut tx = Transaction::new_client(key, req, endpoint(), None);
        assert_eq!(tx.state(), TransactionState::Calling);
        tx.on_response(Response {
            status_code: StatusCode::OK,
            version: rsip::Version::V2,
            headers: vec![].into(),
            body: vec![],
        })
        .unwrap();
        assert_eq!(tx.state(), TransactionState::Terminated);
    }

    #[test]
    fn server_invite_confirms_on_ack() {
        let req = invite();
        let key = TransactionKey::from_request(&req, TransactionRole::Server).unwrap();
        let mut tx = Transaction::new_server(key, req, endpoint(), None);
        tx.on_send_response(&Response {
            status_code: StatusCode::OK,
            version: rsip::Version::V2,
            headers: vec![].into(),
            body: vec![],
        })
        .unwrap();
        assert_eq!(tx.state(), TransactionState::Terminated);
    }

    #[test]
    fn cancel_matches_only_while_proceeding() {
        let req = invite();
        let key = TransactionKey::from_request(&req, TransactionRole::Server).unwrap();
        let tx = Transaction::new_server(key, req, endpoint(), None);
        assert!(tx.does_cancel_match("z9hG4bK74b43"));
        assert!(!tx.does_cancel_match("other-branch"));
    }
}
