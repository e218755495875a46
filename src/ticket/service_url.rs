//! Service URL cleaning, matching and ticket round-trip.
//!
//! Services receive their ticket as a `ticket=` query parameter. That
//! parameter is the only part of the query ignored when comparing a
//! validation request against the service a ticket was issued for; every
//! other parameter is significant.

use url::Url;

const TICKET_PARAM: &str = "ticket";

/// Clean a service parameter taken from a request.
///
/// Returns `None` for an absent or blank value. Parseable URLs lose any
/// `ticket` parameter; unparseable values are passed through trimmed so that
/// issuance can reject them with a proper message.
pub fn clean_service_url(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match Url::parse(raw) {
        Ok(mut url) => {
            strip_ticket_param(&mut url);
            Some(url.to_string())
        }
        Err(_) => Some(raw.to_string()),
    }
}

/// Parse a service URL into the form used for comparisons.
pub fn normalize(raw: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(raw.trim())?;
    if url.cannot_be_a_base() {
        return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase);
    }
    url.set_fragment(None);
    strip_ticket_param(&mut url);
    Ok(url)
}

/// Whether a validation request targets the service a ticket was issued for.
pub fn services_match(issued_for: &str, requested: &str) -> bool {
    match (normalize(issued_for), normalize(requested)) {
        (Ok(a), Ok(b)) => a == b,
        _ => issued_for.trim() == requested.trim(),
    }
}

/// Append a ticket to a service URL as the `ticket` query parameter.
pub fn service_uri_with_ticket(service: &str, ticket_id: &str) -> Result<String, url::ParseError> {
    let mut url = normalize(service)?;
    url.query_pairs_mut().append_pair(TICKET_PARAM, ticket_id);
    Ok(url.to_string())
}

/// Drop `ticket` pairs from the raw query; every other byte is left as sent.
fn strip_ticket_param(url: &mut Url) {
    let kept = {
        let Some(query) = url.query() else {
            return;
        };
        let segments: Vec<&str> = query.split('&').collect();
        let kept: Vec<&str> = segments
            .iter()
            .copied()
            .filter(|segment| !is_ticket_pair(segment))
            .collect();
        if kept.len() == segments.len() {
            return;
        }
        kept.join("&")
    };

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.set_query(Some(&kept));
    }
}

fn is_ticket_pair(segment: &str) -> bool {
    let key = segment.split_once('=').map_or(segment, |(key, _)| key);
    url::form_urlencoded::parse(key.as_bytes())
        .next()
        .is_some_and(|(key, _)| key == TICKET_PARAM)
}
