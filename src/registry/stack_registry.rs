//! The stack registry: concurrent indexes mapping wire-derived
//! keys to dialogs and transactions, and the admission path for inbound
//! messages.

use crate::config::StackConfig;
use crate::dialog::{Dialog, DialogId, EarlyDialogId};
use crate::identifiers;
use crate::transaction::{Transaction, TransactionKey, TransactionRole, TopViaBranchExt};
use crate::{Error, Result};
use dashmap::DashMap;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Method, Request, Response, SipMessage};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of [`StackRegistry::new_server_request`]: an inbound request
/// either belongs to a transaction the registry already knows about, should
/// have a new one created for it, or is shed under load. `CreateNew` and
/// `Shed` are deliberately distinct -- both used to collapse to `None`,
/// leaving the caller unable to tell "make a transaction" from "drop this".
#[derive(Debug)]
pub enum ServerRequestAdmission {
    Existing(Arc<std::sync::Mutex<Transaction>>),
    CreateNew,
    Shed,
}

/// Indexes dialogs and transactions are never the event source themselves --
/// each [`Dialog`] already carries the [`crate::events::EventSender`] it was
/// constructed with and emits `DialogTerminated` exactly once via its own
/// `DeliverOnce` guard on transition. The registry only indexes and removes.
pub struct StackRegistry {
    dialogs: DashMap<DialogId, Dialog>,
    early_dialogs: DashMap<EarlyDialogId, Dialog>,
    server_dialog_merge: DashMap<String, Dialog>,
    client_txs: DashMap<TransactionKey, Arc<std::sync::Mutex<Transaction>>>,
    server_txs: DashMap<TransactionKey, Arc<std::sync::Mutex<Transaction>>>,
    merge_txs: DashMap<String, TransactionKey>,
    pending_server_txs: DashMap<TransactionKey, Arc<std::sync::Mutex<Transaction>>>,
    terminated_pending_ack: DashMap<TransactionKey, Arc<std::sync::Mutex<Transaction>>>,
}

impl StackRegistry {
    pub fn new() -> Self {
        StackRegistry {
            dialogs: DashMap::new(),
            early_dialogs: DashMap::new(),
            server_dialog_merge: DashMap::new(),
            client_txs: DashMap::new(),
            server_txs: DashMap::new(),
            merge_txs: DashMap::new(),
            pending_server_txs: DashMap::new(),
            terminated_pending_ack: DashMap::new(),
        }
    }

    pub fn dialog_count(&self) -> usize {
        self.dialogs.len()
    }

    pub fn early_dialog_count(&self) -> usize {
        self.early_dialogs.len()
    }

    /// Inserts into the early index and arms the EARLY-state timeout; call
    /// when a dialog moves into EARLY.
    pub fn put_early_dialog(&self, dialog: Dialog, config: &StackConfig) {
        let id = dialog.early_dialog_id();
        if self.early_dialogs.contains_key(&id) {
            return;
        }
        self.early_dialogs.entry(id).or_insert_with(|| dialog.clone());
        dialog.spawn_early_state_timer(config);
    }

    /// Schedules `dialog`'s removal from the registry after
    /// `config.connection_linger_timer`, so a retransmitted BYE or a late
    /// ACK directed at a just-TERMINATED dialog still finds it. Call this in
    /// place of an immediate [`Self::remove_dialog`] once a dialog
    /// terminates.
    pub fn schedule_dialog_removal(registry: &Arc<StackRegistry>, dialog: Dialog, config: &StackConfig) {
        let registry = registry.clone();
        let dialog_for_removal = dialog.clone();
        dialog.spawn_linger(config, move || registry.remove_dialog(&dialog_for_removal));
    }

    /// put_dialog: inserts under `dialog_id` if absent, never
    /// replacing an incumbent. Returns the dialog actually stored (the new
    /// one, or the incumbent on a race).
    pub fn put_dialog(&self, dialog: Dialog) -> Dialog {
        let id = match dialog.dialog_id() {
            Some(id) => id,
            None => return dialog,
        };
        self.early_dialogs.remove(&dialog.early_dialog_id());
        let entry = self.dialogs.entry(id).or_insert_with(|| dialog.clone());
        if let Some(merge_id) = entry.first_tx_info.merge_id.clone() {
            self.server_dialog_merge.entry(merge_id).or_insert_with(|| entry.clone());
        }
        entry.clone()
    }

    /// remove_dialog: removes by full id and early id, removes any
    /// merge entry, and relies on [`Dialog::terminate`]'s `DeliverOnce`
    /// guard to emit `DialogTerminated` at most once.
    pub fn remove_dialog(&self, dialog: &Dialog) {
        if let Some(id) = dialog.dialog_id() {
            self.dialogs.remove(&id);
        }
        self.early_dialogs.remove(&dialog.early_dialog_id());
        if let Some(merge_id) = dialog.first_tx_info.merge_id.clone() {
            self.server_dialog_merge.remove(&merge_id);
        }
        info!(call_id = dialog.call_id(), "dialog removed from registry");
    }

    pub fn find_dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id).map(|d| d.clone())
    }

    pub fn find_early_dialog(&self, id: &EarlyDialogId) -> Option<Dialog> {
        self.early_dialogs.get(id).map(|d| d.clone())
    }

    /// find_subscribe_for_notify: matches on call-id, event
    /// package/id, and from-tag(tx) == to-tag(notify). Ties prefer a
    /// transaction whose dialog's local target equals the NOTIFY
    /// Request-URI.
    pub fn find_subscribe_for_notify(&self, notify: &Request) -> Option<Dialog> {
        let call_id = notify.call_id_header().ok()?.value().to_string();
        let notify_to_tag = notify.to_header().ok()?.tag().ok().flatten()?.to_string();

        let mut candidate: Option<Dialog> = None;
        for entry in self.dialogs.iter() {
            let dialog = entry.value();
            if dialog.call_id() != call_id {
                continue;
            }
            let Some(sub) = dialog.subscription.read().unwrap().clone() else {
                continue;
            };
            if !sub.matches_notify(notify) {
                continue;
            }
            let Some(id) = dialog.dialog_id() else { continue };
            if id.remote_tag != notify_to_tag.to_lowercase() && id.local_tag != notify_to_tag.to_lowercase() {
                continue;
            }
            candidate = Some(dialog.clone());
            break;
        }
        candidate
    }

    /// find_merged: true if a different ongoing server
    /// transaction or confirmed server dialog shares this request's merge
    /// id (RFC 3261 S8.2.2.2 loop detection).
    pub fn find_merged(&self, request: &Request) -> bool {
        if request.method != Method::Invite {
            return false;
        }
        let Some(merge_id) = identifiers::merge_id(&SipMessage::Request(request.clone())) else {
            return false;
        };
        let incoming_branch = request.top_via_branch().unwrap_or_default();
        if let Some(existing_branch) = self.merge_txs.get(&merge_id) {
            if existing_branch.branch != incoming_branch {
                return true;
            }
        }
        if self.server_dialog_merge.contains_key(&merge_id) {
            return true;
        }
        false
    }

    /// new_server_request: admits an inbound request onto an
    /// existing server transaction if one matches; otherwise reports whether
    /// the caller should create a new one or shed it under load. These are
    /// distinct outcomes -- a caller that only gets `Ok(None)` cannot tell
    /// "go ahead and create a transaction" from "drop this request".
    pub fn new_server_request(&self, request: &Request, config: &StackConfig) -> Result<ServerRequestAdmission> {
        let key = TransactionKey::from_request(request, TransactionRole::Server)?;
        if let Some(tx) = self.server_txs.get(&key) {
            return Ok(ServerRequestAdmission::Existing(tx.clone()));
        }
        if let Some(tx) = self.pending_server_txs.get(&key) {
            return Ok(ServerRequestAdmission::Existing(tx.clone()));
        }

        let occupancy = self.server_txs.len() as f32 / config.server_transaction_capacity.max(1) as f32;
        if occupancy >= config.load_shed_high_water {
            warn!(occupancy, "server transaction table at capacity, shedding new request");
            return Ok(ServerRequestAdmission::Shed);
        }
        if occupancy > config.load_shed_low_water {
            let band = (config.load_shed_high_water - config.load_shed_low_water).max(f32::EPSILON);
            let shed_probability = (occupancy - config.load_shed_low_water) / band;
            if rand::random::<f32>() < shed_probability {
                warn!(occupancy, shed_probability, "server transaction table under load, shedding new request");
                return Ok(ServerRequestAdmission::Shed);
            }
        }
        Ok(ServerRequestAdmission::CreateNew)
    }

    pub fn insert_server_tx(&self, key: TransactionKey, tx: Arc<std::sync::Mutex<Transaction>>) {
        if let Some(merge_id) = {
            let guard = tx.lock().unwrap();
            identifiers::merge_id(&SipMessage::Request(guard.original_request.clone()))
        } {
            self.merge_txs.insert(merge_id, key.clone());
        }
        self.server_txs.insert(key, tx);
    }

    pub fn mark_terminated_pending_ack(&self, key: TransactionKey, tx: Arc<std::sync::Mutex<Transaction>>) {
        self.server_txs.remove(&key);
        self.terminated_pending_ack.insert(key, tx);
    }

    pub fn find_terminated_pending_ack(&self, key: &TransactionKey) -> Option<Arc<std::sync::Mutex<Transaction>>> {
        self.terminated_pending_ack.get(key).map(|t| t.clone())
    }

    pub fn complete_pending_ack(&self, key: &TransactionKey) {
        self.terminated_pending_ack.remove(key);
    }

    /// new_server_response mirror: looks up the client
    /// transaction a response belongs to.
    pub fn find_client_tx(&self, response: &Response) -> Option<Arc<std::sync::Mutex<Transaction>>> {
        let branch = identifiers::transaction_id(&SipMessage::Response(response.clone()))?;
        let method = response.cseq_header().ok()?.typed().ok()?.method;
        let key = TransactionKey {
            branch,
            method,
            role: TransactionRole::Client,
        };
        self.client_txs.get(&key).map(|t| t.clone())
    }

    pub fn insert_client_tx(&self, key: TransactionKey, tx: Arc<std::sync::Mutex<Transaction>>) {
        self.client_txs.insert(key, tx);
    }

    pub fn remove_client_tx(&self, key: &TransactionKey) {
        self.client_txs.remove(key);
    }

    pub fn remove_server_tx(&self, key: &TransactionKey) {
        self.server_txs.remove(key);
        self.pending_server_txs.remove(key);
    }

    /// Leak auditor: marks registry entries whose call-id is not
    /// in `active_call_ids`. A caller runs this periodically; a dialog
    /// marked on two consecutive sweeps is stale and should be terminated
    /// by the caller.
    pub fn audit_unreferenced<'a>(&self, active_call_ids: impl Iterator<Item = &'a str>) -> Vec<DialogId> {
        let active: std::collections::HashSet<&str> = active_call_ids.collect();
        let mut stale = Vec::new();
        for entry in self.dialogs.iter() {
            if !active.contains(entry.value().call_id()) {
                if let Some(id) = entry.value().dialog_id() {
                    stale.push(id);
                }
            }
        }
        debug!(stale = stale.len(), "registry audit sweep complete");
        stale
    }
}

impl Default for StackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::{Header, Method};

    fn sample_request(branch: &str) -> Request {
        Request {
            method: Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@biloxi.com").unwrap(),
            headers: vec![
                Header::Via(format!("SIP/2.0/UDP pc33.atlanta.com;branch={branch}").into()),
                Header::CallId("a84b4c76e66710@atlanta.com".into()),
                Header::From("Alice <sip:alice@atlanta.com>;tag=1928301774".into()),
                Header::To("Bob <sip:bob@biloxi.com>".into()),
                Header::CSeq("1 INVITE".into()),
                Header::MaxForwards(70.into()),
            ]
            .into(),
            version: rsip::Version::V2,
            body: vec![],
        }
    }

    #[test]
    fn admits_new_request_below_low_water() {
        let registry = StackRegistry::new();
        let config = StackConfig::default();
        let admission = registry.new_server_request(&sample_request("z9hG4bK1"), &config).unwrap();
        assert!(matches!(admission, ServerRequestAdmission::CreateNew));
    }

    #[test]
    fn sheds_new_request_at_or_above_high_water() {
        let registry = StackRegistry::new();
        let mut config = StackConfig::default();
        config.server_transaction_capacity = 1;
        let key = TransactionKey::from_request(&sample_request("z9hG4bK1"), TransactionRole::Server).unwrap();
        let tx = Arc::new(std::sync::Mutex::new(crate::transaction::Transaction::new_server(
            key,
            sample_request("z9hG4bK1"),
            crate::transaction::endpoint::EndpointInner::new(
                "test-ua/1.0".into(),
                crate::transport::SipAddr {
                    host: "127.0.0.1".into(),
                    port: 5060,
                    transport: rsip::transport::Transport::Udp,
                },
                crate::transaction::endpoint::EndpointOption::default(),
                StackConfig::default(),
            ),
            None,
        )));
        registry.insert_server_tx(
            TransactionKey::from_request(&sample_request("z9hG4bK1"), TransactionRole::Server).unwrap(),
            tx,
        );

        let admission = registry.new_server_request(&sample_request("z9hG4bK2"), &config).unwrap();
        assert!(matches!(admission, ServerRequestAdmission::Shed));
    }

    #[test]
    fn finds_existing_transaction_by_key_instead_of_shedding() {
        let registry = StackRegistry::new();
        let mut config = StackConfig::default();
        config.server_transaction_capacity = 1;
        let request = sample_request("z9hG4bK1");
        let key = TransactionKey::from_request(&request, TransactionRole::Server).unwrap();
        let tx = Arc::new(std::sync::Mutex::new(crate::transaction::Transaction::new_server(
            key.clone(),
            request.clone(),
            crate::transaction::endpoint::EndpointInner::new(
                "test-ua/1.0".into(),
                crate::transport::SipAddr {
                    host: "127.0.0.1".into(),
                    port: 5060,
                    transport: rsip::transport::Transport::Udp,
                },
                crate::transaction::endpoint::EndpointOption::default(),
                StackConfig::default(),
            ),
            None,
        )));
        registry.insert_server_tx(key, tx);

        let admission = registry.new_server_request(&request, &config).unwrap();
        assert!(matches!(admission, ServerRequestAdmission::Existing(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn early_state_timeout_fires_only_while_still_early() {
        let mut config = StackConfig::default();
        config.early_dialog_timeout = std::time::Duration::from_secs(5);
        let registry = StackRegistry::new();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let invite = sample_request("z9hG4bK1");
        let dialog = crate::dialog::Dialog::new_uac(&invite, Some(tx)).unwrap();
        let ringing = rsip::Response {
            status_code: rsip::StatusCode::Ringing,
            version: rsip::Version::V2,
            headers: vec![
                Header::To("Bob <sip:bob@biloxi.com>;tag=314159".into()),
                Header::From("Alice <sip:alice@atlanta.com>;tag=1928301774".into()),
                Header::CallId("a84b4c76e66710@atlanta.com".into()),
                Header::CSeq("1 INVITE".into()),
            ]
            .into(),
            body: vec![],
        };
        dialog.set_last_response(&invite, &ringing, false, &config).unwrap();
        assert!(dialog.state().is_early());

        registry.put_early_dialog(dialog.clone(), &config);
        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        let event = rx.try_recv().expect("early-state timeout event expected");
        assert!(matches!(
            event,
            crate::events::Event::DialogError(_, crate::events::DialogErrorReason::EarlyStateTimeout)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_dialog_never_raises_early_state_timeout() {
        let mut config = StackConfig::default();
        config.early_dialog_timeout = std::time::Duration::from_secs(5);
        let registry = StackRegistry::new();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let invite = sample_request("z9hG4bK1");
        let dialog = crate::dialog::Dialog::new_uac(&invite, Some(tx)).unwrap();
        let ok = rsip::Response {
            status_code: rsip::StatusCode::OK,
            version: rsip::Version::V2,
            headers: vec![
                Header::To("Bob <sip:bob@biloxi.com>;tag=314159".into()),
                Header::From("Alice <sip:alice@atlanta.com>;tag=1928301774".into()),
                Header::CallId("a84b4c76e66710@atlanta.com".into()),
                Header::CSeq("1 INVITE".into()),
                Header::Contact("<sip:bob@192.0.2.4>".into()),
            ]
            .into(),
            body: vec![],
        };
        dialog.set_last_response(&invite, &ok, false, &config).unwrap();
        assert!(dialog.state().is_confirmed());

        registry.put_early_dialog(dialog.clone(), &config);
        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert!(rx.try_recv().is_err(), "a confirmed dialog must not raise an early-state timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn dialog_removal_is_delayed_by_the_linger_window() {
        let mut config = StackConfig::default();
        config.connection_linger_timer = std::time::Duration::from_secs(8);
        let registry = std::sync::Arc::new(StackRegistry::new());

        let invite = sample_request("z9hG4bK1");
        let dialog = crate::dialog::Dialog::new_uac(&invite, None).unwrap();
        let ok = rsip::Response {
            status_code: rsip::StatusCode::OK,
            version: rsip::Version::V2,
            headers: vec![
                Header::To("Bob <sip:bob@biloxi.com>;tag=314159".into()),
                Header::From("Alice <sip:alice@atlanta.com>;tag=1928301774".into()),
                Header::CallId("a84b4c76e66710@atlanta.com".into()),
                Header::CSeq("1 INVITE".into()),
                Header::Contact("<sip:bob@192.0.2.4>".into()),
            ]
            .into(),
            body: vec![],
        };
        dialog.set_last_response(&invite, &ok, false, &config).unwrap();
        assert!(dialog.state().is_confirmed());
        registry.put_dialog(dialog.clone());
        assert_eq!(registry.dialog_count(), 1);

        dialog.terminate(crate::dialog::TerminatedReason::Bye).unwrap();
        StackRegistry::schedule_dialog_removal(&registry, dialog.clone(), &config);

        tokio::task::yield_now().await;
        assert_eq!(registry.dialog_count(), 1, "dialog must stay indexed during the linger window");

        tokio::time::advance(std::time::Duration::from_secs(9)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.dialog_count(), 0, "dialog must be removed once the linger window elapses");
    }

    #[tokio::test]
    async fn zero_linger_removes_the_dialog_inline() {
        let mut config = StackConfig::default();
        config.connection_linger_timer = std::time::Duration::ZERO;
        let registry = std::sync::Arc::new(StackRegistry::new());

        let invite = sample_request("z9hG4bK1");
        let dialog = crate::dialog::Dialog::new_uac(&invite, None).unwrap();
        let ok = rsip::Response {
            status_code: rsip::StatusCode::OK,
            version: rsip::Version::V2,
            headers: vec![
                Header::To("Bob <sip:bob@biloxi.com>;tag=314159".into()),
                Header::From("Alice <sip:alice@atlanta.com>;tag=1928301774".into()),
                Header::CallId("a84b4c76e66710@atlanta.com".into()),
                Header::CSeq("1 INVITE".into()),
                Header::Contact("<sip:bob@192.0.2.4>".into()),
            ]
            .into(),
            body: vec![],
        };
        dialog.set_last_response(&invite, &ok, false, &config).unwrap();
        registry.put_dialog(dialog.clone());

        dialog.terminate(crate::dialog::TerminatedReason::Bye).unwrap();
        StackRegistry::schedule_dialog_removal(&registry, dialog, &config);

        assert_eq!(registry.dialog_count(), 0, "zero linger must remove the dialog without scheduling a task");
    }
}
