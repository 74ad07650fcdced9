//! Route set and remote target management.

use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Request, Response, Uri};
use tracing::warn;

/// An entry of the dialog's route set, carrying whether it announced loose
/// routing (`;lr`) so callers can tell a strict router apart without
/// re-parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub uri: Uri,
}

impl Route {
    fn from_uri(uri: Uri) -> Self {
        let is_loose = uri.params.iter().any(|p| matches!(p, rsip::Param::Lr));
        if !is_loose {
            warn!(%uri, "route set entry lacks ;lr, treating peer as a strict router");
        }
        Route { uri }
    }
}

fn record_route_uris(headers: &rsip::Headers) -> Vec<Uri> {
    headers
        .iter()
        .filter_map(|h| match h {
            rsip::Header::RecordRoute(rr) => rr
                .typed()
                .ok()
                .and_then(|t| t.0.uris().first().map(|u| u.uri.clone())),
            _ => None,
        })
        .collect()
}

/// Builds the route set a UAC installs from a dialog-creating response:
/// Record-Route entries walked in reverse.
pub fn route_set_from_response(resp: &Response) -> Vec<Route> {
    let mut uris = record_route_uris(&resp.headers);
    uris.reverse();
    uris.into_iter().map(Route::from_uri).collect()
}

/// Builds the route set a UAS installs from a dialog-creating request:
/// Record-Route entries in the order they appear.
pub fn route_set_from_request(req: &Request) -> Vec<Route> {
    record_route_uris(&req.headers)
        .into_iter()
        .map(Route::from_uri)
        .collect()
}

/// The remote target learned from a message's first Contact header, stripped
/// of `;transport=` (the target is reused as a future Request-URI, not
/// echoed verbatim).
pub fn remote_target_from_contact(headers: &rsip::Headers) -> Option<Uri> {
    headers.iter().find_map(|h| match h {
        rsip::Header::Contact(_) => {
            let text = h.to_string();
            let value = text.split_once(':').map(|(_, v)| v.trim()).unwrap_or(&text);
            crate::rsip_ext::extract_uri_from_contact(value).ok()
        }
        _ => None,
    })
}

fn default_target(remote_target: Option<&Uri>, remote_party: &Uri) -> Uri {
    remote_target.cloned().unwrap_or_else(|| {
        let mut stripped = remote_party.clone();
        stripped.params.clear();
        stripped
    })
}

/// Builds the Request-URI and Route headers for an in-dialog request, given
/// the frozen route set and the current remote target.
///
/// A loose router (top route carries `;lr`) never becomes the Request-URI:
/// the Request-URI stays the remote target and every route, including the
/// top one, goes into a Route header. Only a strict router (no `;lr`) is
/// placed in the Request-URI, and dropped from the Route headers that
/// follow, per RFC 3261 S12.2.1.1.
pub fn build_routing(route_set: &[Route], remote_target: Option<&Uri>, remote_party: &Uri) -> (Uri, Vec<rsip::Header>) {
    let top_is_loose = route_set
        .first()
        .map(|r| r.uri.params.iter().any(|p| matches!(p, rsip::Param::Lr)))
        .unwrap_or(false);

    let (request_uri, routes_in_headers): (Uri, &[Route]) = match route_set.first() {
        Some(_) if top_is_loose => (default_target(remote_target, remote_party), route_set),
        Some(strict) => (strict.uri.clone(), &route_set[1..]),
        None => (default_target(remote_target, remote_party), route_set),
    };

    let route_headers = routes_in_headers
        .iter()
        .map(|route| rsip::Header::Route(format!("<{}>", route.uri).into()))
        .collect();
    (request_uri, route_headers)
}
