//! Small extensions to `rsip` types used throughout the dialog and
//! transaction layers.

/// Extracts the URI portion of a `Contact` header line, stripping the
/// `transport` parameter carried by the Contact (the remote target is used
/// as a Request-URI, not echoed verbatim).
pub fn extract_uri_from_contact(line: &str) -> crate::Result<rsip::Uri> {
    if let Ok(contact) = rsip::headers::Contact::try_from(line) {
        if let Ok(mut uri) = contact.uri() {
            uri.params.retain(|p| !matches!(p, rsip::Param::Transport(_)));
            return Ok(uri);
        }
    }

    match line.split('<').nth(1).and_then(|s| s.split('>').next()) {
        Some(uri) => rsip::Uri::try_from(uri).map_err(Into::into),
        None => Err(crate::Error::Error(format!("no uri found: {}", line))),
    }
}
