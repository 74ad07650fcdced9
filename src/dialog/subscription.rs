//! RFC 3265 SUBSCRIBE/NOTIFY dialog extension state.
//!
//! A subscription dialog is otherwise an ordinary [`super::Dialog`]; this
//! module only adds the event-package bookkeeping `find_subscribe_for_notify`
//! needs and the NOTIFY target-refresh carve-out.

use rsip::Request;

/// RFC 3265 SS3.1.4.1: a 489 on a subscription dialog never terminates it,
/// deviating from the general 3xx-6xx rule. That carve-out is unconditional
/// on `event_package`/`id`, so it is handled directly in
/// `Dialog::set_last_response` rather than carried as a field here.
#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub event_package: String,
    pub id: Option<String>,
}

/// The `Event` header has no dedicated variant in [`rsip::Header`]; it is
/// carried generically, so it is located by its serialized "Event: " prefix
/// rather than by pattern-matching a header variant.
fn event_header_value(headers: &rsip::Headers) -> Option<String> {
    headers.iter().find_map(|h| {
        let text = h.to_string();
        text.split_once(':').and_then(|(name, value)| {
            name.trim().eq_ignore_ascii_case("Event").then(|| value.trim().to_string())
        })
    })
}

impl SubscriptionState {
    pub fn from_subscribe(req: &Request) -> crate::Result<Self> {
        let event = event_header_value(&req.headers)
            .ok_or_else(|| crate::Error::InvalidArgument("SUBSCRIBE has no Event header".into()))?;
        let (event_package, id) = match event.split_once(';') {
            Some((pkg, rest)) => (
                pkg.trim().to_string(),
                rest.trim()
                    .strip_prefix("id=")
                    .map(|s| s.to_string()),
            ),
            None => (event.trim().to_string(), None),
        };
        Ok(SubscriptionState { event_package, id })
    }

    /// Whether `notify`'s Event header matches this subscription, per RFC
    /// 3265 SS7.2.1 (package and, if present, id must both match).
    pub fn matches_notify(&self, notify: &Request) -> bool {
        let event = event_header_value(&notify.headers);
        match event {
            Some(event) => {
                let (pkg, id) = match event.split_once(';') {
                    Some((pkg, rest)) => (
                        pkg.trim().to_string(),
                        rest.trim().strip_prefix("id=").map(|s| s.to_string()),
                    ),
                    None => (event.trim().to_string(), None),
                };
                pkg.eq_ignore_ascii_case(&self.event_package) && id == self.id
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe_with_event(event: &str) -> Request {
        let raw = format!(
            "SUBSCRIBE sip:bob@biloxi.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
             Call-ID: a84b4c76e66710\r\n\
             From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
             To: Bob <sip:bob@biloxi.com>\r\n\
             CSeq: 1 SUBSCRIBE\r\n\
             Event: {event}\r\n\
             Content-Length: 0\r\n\r\n"
        );
        match rsip::SipMessage::try_from(raw).unwrap() {
            rsip::SipMessage::Request(req) => req,
            _ => unreachable!(),
        }
    }

    #[test]
    fn parses_event_package_and_id() {
        let sub = SubscriptionState::from_subscribe(&subscribe_with_event("dialog;id=1234")).unwrap();
        assert_eq!(sub.event_package, "dialog");
        assert_eq!(sub.id.as_deref(), Some("1234"));
    }

    #[test]
    fn matches_notify_on_package_and_id() {
        let sub = SubscriptionState::from_subscribe(&subscribe_with_event("presence")).unwrap();
        let notify = subscribe_with_event("presence");
        assert!(sub.matches_notify(&notify));
        let mismatched = subscribe_with_event("dialog");
        assert!(!sub.matches_notify(&mismatched));
    }
}
