//! Integration tests covering: basic call setup, forking, re-INVITE target
//! refresh, reliable provisionals + PRACK, merged-request loop detection,
//! and late ACK after termination.

use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Method, Request, Response, StatusCode};
use sip_dialog_core::config::StackConfig;
use sip_dialog_core::dialog::{Dialog, DialogState, SubscriptionState};
use sip_dialog_core::registry::StackRegistry;
use sip_dialog_core::transaction::endpoint::{EndpointInner, EndpointOption};
use sip_dialog_core::transaction::key::{TransactionKey, TransactionRole};
use sip_dialog_core::transaction::Transaction;
use sip_dialog_core::transport::SipAddr;

fn invite_request() -> Request {
    Request {
        method: Method::Invite,
        uri: rsip::Uri::try_from("sip:bob@biloxi.com").unwrap(),
        headers: vec![
            Header::Via("SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds".into()),
            Header::CallId("a84b4c76e66710@atlanta.com".into()),
            Header::From("Alice <sip:alice@atlanta.com>;tag=1928301774".into()),
            Header::To("Bob <sip:bob@biloxi.com>".into()),
            Header::CSeq("1 INVITE".into()),
            Header::Contact("<sip:alice@pc33.atlanta.com>".into()),
            Header::MaxForwards(70.into()),
        ]
        .into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}

fn response_to(request: &Request, status: StatusCode, to_tag: &str, record_routes: &[&str]) -> Response {
    let mut headers: Vec<Header> = vec![
        Header::Via(request.via_header().unwrap().clone()),
        Header::CallId(request.call_id_header().unwrap().clone()),
        Header::From(request.from_header().unwrap().clone()),
        Header::To(format!("Bob <sip:bob@biloxi.com>;tag={to_tag}").into()),
        Header::CSeq(request.cseq_header().unwrap().clone()),
    ];
    for rr in record_routes {
        headers.push(Header::RecordRoute(format!("<{rr};lr>").into()));
    }
    headers.push(Header::Contact("<sip:bob@192.0.2.4>".into()));
    Response {
        status_code: status,
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}

#[test]
fn scenario_1_basic_call_setup_with_route_reversal_and_ack() {
    let config = StackConfig::default();
    let invite = invite_request();
    let dialog = Dialog::new_uac(&invite, None).unwrap();
    assert!(matches!(dialog.state(), DialogState::Null));

    let ringing = response_to(&invite, StatusCode::Ringing, "314159", &["sip:p1.atlanta.com", "sip:p2.atlanta.com"]);
    dialog.set_last_response(&invite, &ringing, false, &config).unwrap();
    assert!(dialog.state().is_early());

    let ok = response_to(&invite, StatusCode::OK, "314159", &["sip:p1.atlanta.com", "sip:p2.atlanta.com"]);
    dialog.set_last_response(&invite, &ok, false, &config).unwrap();
    assert!(dialog.state().is_confirmed());

    let bye = dialog.create_request(Method::Bye).unwrap();
    let routes: Vec<_> = bye
        .headers
        .iter()
        .filter(|h| matches!(h, Header::Route(_)))
        .map(|h| h.to_string())
        .collect();
    assert_eq!(routes.len(), 2);
    assert!(routes[0].contains("p2.atlanta.com"));
    assert!(routes[1].contains("p1.atlanta.com"));

    let ack = dialog.create_ack(1).unwrap();
    assert_eq!(ack.method, Method::Ack);
    assert!(ack.to_header().unwrap().tag().unwrap().unwrap().to_string() == "314159");
    dialog.send_ack(&ack, vec![]).unwrap();
}

#[test]
fn scenario_2_forked_response_creates_secondary_dialog() {
    let config = StackConfig::default();
    let invite = invite_request();
    let primary = Dialog::new_uac(&invite, None).unwrap();

    let ringing_a = response_to(&invite, StatusCode::Ringing, "branchA-tag", &[]);
    primary.set_last_response(&invite, &ringing_a, false, &config).unwrap();
    assert!(primary.state().is_early());

    let secondary = Dialog::new_uac(&invite, None).unwrap();
    secondary.set_original_dialog(&primary);
    let ringing_b = response_to(&invite, StatusCode::Ringing, "branchB-tag", &[]);
    secondary.set_last_response(&invite, &ringing_b, false, &config).unwrap();
    assert!(secondary.state().is_early());

    assert_eq!(secondary.original_dialog().unwrap().call_id(), primary.call_id());

    assert!(!primary.check_retransmission_for_forking(&ringing_a));
    assert!(primary.check_retransmission_for_forking(&ringing_a));
}

#[test]
fn scenario_3_reinvite_refreshes_target_but_freezes_route_set() {
    let config = StackConfig::default();
    let invite = invite_request();
    let dialog = Dialog::new_uac(&invite, None).unwrap();
    let ok = response_to(&invite, StatusCode::OK, "314159", &["sip:p1.atlanta.com"]);
    dialog.set_last_response(&invite, &ok, false, &config).unwrap();
    assert!(dialog.state().is_confirmed());

    let reinvite = dialog.create_request(Method::Invite).unwrap();
    dialog.send_request(&reinvite).unwrap();
    assert_eq!(reinvite.cseq_header().unwrap().typed().unwrap().seq, 2);

    let mut reinvite_ok = response_to(&reinvite, StatusCode::OK, "314159", &[]);
    reinvite_ok.headers = reinvite_ok
        .headers
        .iter()
        .filter(|h| !matches!(h, Header::Contact(_)))
        .cloned()
        .collect::<Vec<_>>()
        .into();
    reinvite_ok.headers.push(Header::Contact("<sip:bob@198.51.100.9>".into()));

    dialog.set_last_response(&reinvite, &reinvite_ok, false, &config).unwrap();

    let bye = dialog.create_request(Method::Bye).unwrap();
    let routes: Vec<_> = bye.headers.iter().filter(|h| matches!(h, Header::Route(_))).collect();
    assert_eq!(routes.len(), 1, "route set must stay frozen across the re-INVITE");
    assert!(bye.uri.to_string().contains("198.51.100.9"), "request-uri must follow the refreshed target");
}

#[test]
fn scenario_4_reliable_provisional_and_prack() {
    let mut invite = invite_request();
    invite.headers.push(Header::Other("Supported".into(), "100rel".into()));

    let dialog = Dialog::new_uas(&invite, "314159".into(), None).unwrap();
    let config = StackConfig::default();

    let provisional = dialog
        .create_reliable_provisional_response(StatusCode::Ringing, &invite)
        .unwrap();
    dialog.note_sent_response(&invite, &provisional).unwrap();
    assert!(dialog.state().is_early());

    let dialog_id = dialog.send_reliable_provisional_response(&provisional, &config).unwrap();
    assert_eq!(dialog_id.call_id, "a84b4c76e66710@atlanta.com");

    let prack = dialog.create_prack(&provisional).unwrap();
    let rack = prack
        .headers
        .iter()
        .find_map(|h| {
            let text = h.to_string();
            text.strip_prefix("RAck:")
                .or_else(|| text.strip_prefix("RAck :"))
                .map(|s| s.trim().to_string())
        })
        .unwrap();
    assert!(rack.ends_with("1 INVITE"));

    assert!(dialog.handle_prack(&prack).unwrap());
    assert!(!dialog.handle_prack(&prack).unwrap(), "a second identical PRACK must not match again");
}

#[test]
fn scenario_5_merged_request_is_detected_as_a_loop() {
    let registry = StackRegistry::new();
    let endpoint = EndpointInner::new(
        "test-ua/1.0".into(),
        SipAddr {
            host: "127.0.0.1".into(),
            port: 5060,
            transport: rsip::transport::Transport::Udp,
        },
        EndpointOption::default(),
        StackConfig::default(),
    );

    let first = invite_request();
    let key = TransactionKey::from_request(&first, TransactionRole::Server).unwrap();
    let tx = std::sync::Arc::new(std::sync::Mutex::new(Transaction::new_server(
        key,
        first.clone(),
        endpoint,
        None,
    )));
    registry.insert_server_tx(TransactionKey::from_request(&first, TransactionRole::Server).unwrap(), tx);

    let mut looped = first.clone();
    looped.headers = looped
        .headers
        .iter()
        .map(|h| match h {
            Header::Via(_) => Header::Via("SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKdifferentbranch".into()),
            other => other.clone(),
        })
        .collect::<Vec<_>>()
        .into();

    assert!(registry.find_merged(&looped));
    assert!(!registry.find_merged(&first), "a retransmission of the original request is not a loop");
}

#[test]
fn scenario_6_late_ack_after_termination_does_not_resurrect_or_double_fire() {
    let config = StackConfig::default();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let invite = invite_request();
    let dialog = Dialog::new_uac(&invite, Some(tx)).unwrap();

    let ok = response_to(&invite, StatusCode::OK, "314159", &[]);
    dialog.set_last_response(&invite, &ok, false, &config).unwrap();
    assert!(dialog.state().is_confirmed());

    let bye = dialog.create_request(Method::Bye).unwrap();
    let bye_ok = response_to(&bye, StatusCode::OK, "314159", &[]);
    dialog.set_last_response(&bye, &bye_ok, false, &config).unwrap();
    assert!(dialog.state().is_terminated());

    dialog
        .terminate(sip_dialog_core::dialog::TerminatedReason::Bye)
        .unwrap();
    dialog
        .terminate(sip_dialog_core::dialog::TerminatedReason::Bye)
        .unwrap();

    assert!(!dialog.handle_ack(1).unwrap(), "a late ACK must not resurrect a terminated dialog");

    let mut terminated_events = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, sip_dialog_core::events::Event::DialogTerminated(_)) {
            terminated_events += 1;
        }
    }
    assert_eq!(terminated_events, 1, "DialogTerminated must be delivered exactly once");
}

fn subscribe_request() -> Request {
    Request {
        method: Method::Subscribe,
        uri: rsip::Uri::try_from("sip:bob@biloxi.com").unwrap(),
        headers: vec![
            Header::Via("SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds".into()),
            Header::CallId("a84b4c76e66710@atlanta.com".into()),
            Header::From("Alice <sip:alice@atlanta.com>;tag=1928301774".into()),
            Header::To("Bob <sip:bob@biloxi.com>".into()),
            Header::CSeq("1 SUBSCRIBE".into()),
            Header::Contact("<sip:alice@pc33.atlanta.com>".into()),
            Header::MaxForwards(70.into()),
            Header::Other("Event".into(), "dialog".into()),
        ]
        .into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}

#[test]
fn subscription_carries_through_dialog_and_suppresses_489_termination() {
    let config = StackConfig::default();
    let subscribe = subscribe_request();

    let dialog = Dialog::new_uac(&subscribe, None).unwrap();
    dialog.set_subscription(SubscriptionState::from_subscribe(&subscribe).unwrap());
    assert!(dialog.subscription().is_some());

    let early = response_to(&subscribe, StatusCode::Ringing, "sub-tag", &[]);
    dialog.set_last_response(&subscribe, &early, true, &config).unwrap();
    assert!(dialog.state().is_early());

    let raw_489 = format!(
        "SIP/2.0 489 Bad Event\r\n\
         Via: {via}\r\n\
         Call-ID: {call_id}\r\n\
         From: {from}\r\n\
         To: Bob <sip:bob@biloxi.com>;tag=sub-tag\r\n\
         CSeq: {cseq}\r\n\
         Content-Length: 0\r\n\r\n",
        via = subscribe.via_header().unwrap(),
        call_id = subscribe.call_id_header().unwrap(),
        from = subscribe.from_header().unwrap(),
        cseq = subscribe.cseq_header().unwrap(),
    );
    let rejected = match rsip::SipMessage::try_from(raw_489).unwrap() {
        rsip::SipMessage::Response(r) => r,
        _ => unreachable!(),
    };
    dialog.set_last_response(&subscribe, &rejected, true, &config).unwrap();
    assert!(!dialog.state().is_terminated(), "489 on a subscription dialog must not terminate it");
}
