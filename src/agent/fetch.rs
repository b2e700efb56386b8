//! FETCH response handling
//!
//! Turns async-imap `Fetch` items into [`RawMessage`]s. Individual
//! unparseable responses are logged and skipped, never fatal.

use async_imap::types::Fetch;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::warn;

use crate::types::{MessageEnvelope, RawMessage};

/// Attributes requested for every message fetch.
pub const FETCH_QUERY: &str = "(UID ENVELOPE INTERNALDATE BODY.PEEK[])";

/// Drain a FETCH stream, skipping (with a warning) any response that fails
/// to parse, such as stray literals in malformed envelopes.
pub async fn collect_tolerant<E: std::fmt::Display>(
    stream: impl futures::Stream<Item = Result<Fetch, E>>,
    context: &str,
) -> Vec<Fetch> {
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => items.push(fetch),
            Err(e) => {
                warn!(%context, error = %e, "Skipping unparseable IMAP response");
            }
        }
    }
    items
}

/// Build a [`RawMessage`] from one FETCH response.
///
/// Requires a UID and an envelope; the internal date is the authority for
/// the backfill window, with the envelope date as fallback and "now" as a
/// last resort so a missing date never loses a message.
pub fn parse_raw_message(fetch: &Fetch) -> Option<RawMessage> {
    let uid = fetch.uid?;
    let envelope = fetch.envelope()?;

    let subject = envelope
        .subject
        .as_ref()
        .map(|s| decode_rfc2047(&String::from_utf8_lossy(s)))
        .unwrap_or_default();

    let from = envelope
        .from
        .as_ref()
        .and_then(|addrs| addrs.first())
        .map(format_address)
        .unwrap_or_default();

    let to = envelope
        .to
        .as_ref()
        .map(|addrs| addrs.iter().map(format_address).collect())
        .unwrap_or_default();

    let date = fetch
        .internal_date()
        .map(|d| d.with_timezone(&Utc))
        .or_else(|| {
            envelope
                .date
                .as_ref()
                .and_then(|d| parse_envelope_date(&String::from_utf8_lossy(d)))
        })
        .unwrap_or_else(Utc::now);

    let source = fetch.body().map(|b| b.to_vec()).unwrap_or_default();

    Some(RawMessage {
        uid: u64::from(uid),
        envelope: MessageEnvelope {
            subject,
            from,
            to,
            date,
        },
        source,
    })
}

fn format_address(addr: &imap_proto::types::Address<'_>) -> String {
    let mailbox = addr
        .mailbox
        .as_ref()
        .map(|m| String::from_utf8_lossy(m).to_string())
        .unwrap_or_default();
    let host = addr
        .host
        .as_ref()
        .map(|h| String::from_utf8_lossy(h).to_string())
        .unwrap_or_default();
    format!("{}@{}", mailbox, host)
}

fn parse_envelope_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Decode RFC 2047 encoded words ("=?UTF-8?B?...?=") in header values.
pub fn decode_rfc2047(input: &str) -> String {
    let fake_header = format!("X: {}", input);
    match mailparse::parse_header(fake_header.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => input.to_string(),
    }
}

/// Format a cutoff for `UID SEARCH SINCE` ("01-Jun-2024"). SINCE has day
/// granularity, so the caller still filters per message.
pub fn imap_since_date(cutoff: DateTime<Utc>) -> String {
    cutoff.format("%d-%b-%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn since_date_uses_imap_day_format() {
        let cutoff = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(imap_since_date(cutoff), "01-Jun-2024");
    }

    #[test]
    fn rfc2047_encoded_subject_is_decoded() {
        assert_eq!(decode_rfc2047("=?UTF-8?B?SGVsbG8gV29ybGQ=?="), "Hello World");
        assert_eq!(decode_rfc2047("plain subject"), "plain subject");
    }

    #[test]
    fn envelope_date_parses_rfc2822() {
        let parsed = parse_envelope_date("Sat, 1 Jun 2024 12:00:00 +0000").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        assert!(parse_envelope_date("not a date").is_none());
    }
}
