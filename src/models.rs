//! Entity shapes, transport-record mapping, and tool input DTOs
//!
//! Defines the plain entity types returned by every operation
//! ([`EmailAddress`], [`EmailMessage`], [`EmailFolder`]) and the total mapping
//! functions that build them from `async-imap` records, decoupling the tool
//! layer from transport-library shapes. Also holds the schema-bearing tool
//! input types.

use async_imap::imap_proto::types::{Address, Envelope};
use async_imap::types::{Fetch, Name};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::query::{FetchOptions, SearchQuery};

/// One message participant
///
/// `address` is never absent: when the transport record omits the mailbox or
/// host it defaults to the empty string (the mapper is total and must not
/// fail).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailAddress {
    /// Display name, omitted when the transport record has none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Address string (`mailbox@host`), empty when the source omits it
    pub address: String,
}

/// One fetched message summary
///
/// `id` is the message UID within the listed folder (sequence number when the
/// server omits the UID); `date` is always a valid instant.
#[derive(Debug, Clone, Serialize)]
pub struct EmailMessage {
    /// Message UID within the folder of the listing operation
    pub id: u32,
    /// Decoded Subject header, empty when absent
    pub subject: String,
    /// Ordered From participants
    pub from: Vec<EmailAddress>,
    /// Ordered To participants
    pub to: Vec<EmailAddress>,
    /// Envelope date, falling back to the IMAP internal date, then the epoch
    pub date: DateTime<Utc>,
    /// Plain-text body when fetched and mapped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// HTML body when fetched and mapped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

/// One mailbox/folder
#[derive(Debug, Clone, Serialize)]
pub struct EmailFolder {
    /// Leaf folder name, decoded from modified UTF-7
    pub name: String,
    /// Full hierarchical path; uniquely identifies the folder in the account
    pub path: String,
    /// Special-use tag (`\Sent`, `\Drafts`, ...) when the server reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_use: Option<String>,
    /// Raw protocol attributes as reported by LIST
    pub flags: Vec<String>,
}

/// Map a transport-native address record to [`EmailAddress`]
///
/// Pure and total: a record with no mailbox or host yields an empty address
/// string, and the display name is preserved only when present.
pub fn map_address(address: &Address<'_>) -> EmailAddress {
    let mailbox = address.mailbox.as_deref();
    let host = address.host.as_deref();
    let address_string = match (mailbox, host) {
        (Some(mailbox), Some(host)) => format!(
            "{}@{}",
            String::from_utf8_lossy(mailbox),
            String::from_utf8_lossy(host)
        ),
        (Some(mailbox), None) => String::from_utf8_lossy(mailbox).into_owned(),
        _ => String::new(),
    };
    EmailAddress {
        name: address.name.as_deref().map(decode_header_value),
        address: address_string,
    }
}

/// Map an optional address list element-wise
fn map_addresses(addresses: Option<&Vec<Address<'_>>>) -> Vec<EmailAddress> {
    addresses
        .map(|list| list.iter().map(map_address).collect())
        .unwrap_or_default()
}

/// Map a fetched message to [`EmailMessage`]
///
/// Body parts present in the fetch are intentionally not copied into the
/// summary; the summary carries envelope fields only.
pub fn map_message(fetch: &Fetch) -> EmailMessage {
    build_message(
        fetch.uid.unwrap_or(fetch.message),
        fetch.envelope(),
        fetch.internal_date().map(|d| d.with_timezone(&Utc)),
    )
}

/// Build a message summary from envelope parts
///
/// Total over malformed upstream records: missing envelope fields degrade to
/// empty strings/lists, and an unparseable date falls back to the internal
/// date, then the Unix epoch.
fn build_message(
    id: u32,
    envelope: Option<&Envelope<'_>>,
    internal_date: Option<DateTime<Utc>>,
) -> EmailMessage {
    let subject = envelope
        .and_then(|env| env.subject.as_deref())
        .map(decode_header_value)
        .unwrap_or_default();
    let date = envelope
        .and_then(|env| env.date.as_deref())
        .and_then(parse_envelope_date)
        .or(internal_date)
        .unwrap_or(DateTime::UNIX_EPOCH);

    EmailMessage {
        id,
        subject,
        from: map_addresses(envelope.and_then(|env| env.from.as_ref())),
        to: map_addresses(envelope.and_then(|env| env.to.as_ref())),
        date,
        text: None,
        html: None,
    }
}

/// Map a LIST response entry to [`EmailFolder`]
pub fn map_folder(name: &Name) -> EmailFolder {
    let flags = name
        .attributes()
        .iter()
        .map(|attr| format!("{attr:?}"))
        .collect::<Vec<_>>();
    EmailFolder {
        name: leaf_name(name.name(), name.delimiter()),
        path: name.name().to_owned(),
        special_use: special_use_from_flags(&flags),
        flags,
    }
}

/// Decode the leaf segment of a mailbox path from modified UTF-7
fn leaf_name(path: &str, delimiter: Option<&str>) -> String {
    let leaf = match delimiter.filter(|d| !d.is_empty()) {
        Some(d) => path.rsplit(d).next().unwrap_or(path),
        None => path,
    };
    utf7_imap::decode_utf7_imap(leaf.to_owned())
}

/// Derive the special-use tag from LIST attributes (RFC 6154)
fn special_use_from_flags(flags: &[String]) -> Option<String> {
    const SPECIAL_USE: [&str; 7] = ["Sent", "Drafts", "Trash", "Junk", "Archive", "All", "Flagged"];
    flags.iter().find_map(|flag| {
        SPECIAL_USE
            .iter()
            .find(|tag| flag.contains(*tag))
            .map(|tag| format!("\\{tag}"))
    })
}

/// Decode an RFC 2047 encoded-word header value
///
/// Falls back to a lossy UTF-8 conversion when the bytes do not parse as a
/// header, so the mapping stays total.
pub fn decode_header_value(raw: &[u8]) -> String {
    let mut line = Vec::with_capacity(raw.len() + 4);
    line.extend_from_slice(b"X: ");
    line.extend_from_slice(raw);
    match mailparse::parse_header(&line) {
        Ok((header, _)) => header.get_value(),
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}

/// Parse an envelope Date header into a UTC instant
///
/// Tries strict RFC 2822 first, then the lenient `mailparse` parser for the
/// sloppy-but-real forms seen in the wild. `dateparse` maps unparseable text
/// to second 0, so an epoch result from it is treated as a parse failure and
/// the caller falls back to the internal date.
fn parse_envelope_date(raw: &[u8]) -> Option<DateTime<Utc>> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc2822(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    match mailparse::dateparse(text) {
        Ok(seconds) if seconds != 0 => DateTime::from_timestamp(seconds, 0),
        _ => None,
    }
}

/// Keep the `limit` most recent messages, newest first
///
/// Sorts the in-memory result set by date descending and truncates. Used by
/// the inbox resource snapshot.
pub fn most_recent(mut messages: Vec<EmailMessage>, limit: usize) -> Vec<EmailMessage> {
    messages.sort_by(|a, b| b.date.cmp(&a.date));
    messages.truncate(limit);
    messages
}

/// Input: send one message via the delivery transport
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SendEmailInput {
    /// Recipient email address
    pub to: String,
    /// Subject line (non-empty)
    pub subject: String,
    /// Plain-text body (non-empty)
    pub text: String,
    /// Optional HTML body; when present the message is multipart/alternative
    pub html: Option<String>,
}

/// Input: search a folder and fetch matching summaries
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchEmailsInput {
    /// Search criteria tree
    pub query: SearchQuery,
    /// Projection of message parts to fetch
    pub fetch_options: FetchOptions,
    /// Folder to search (defaults to `INBOX`)
    #[serde(default = "default_folder")]
    pub folder: String,
    /// Maximum messages to return (positive, default 10)
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// Default folder for search
pub fn default_folder() -> String {
    "INBOX".to_owned()
}

/// Default value for `limit` in search
///
/// Chosen as a reasonable balance between response size and host round trips.
fn default_limit() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use async_imap::imap_proto::types::{Address, Envelope};
    use chrono::{DateTime, TimeZone, Utc};

    use super::{
        EmailMessage, build_message, decode_header_value, leaf_name, map_address, most_recent,
        parse_envelope_date, special_use_from_flags,
    };

    fn address<'a>(
        name: Option<&'a [u8]>,
        mailbox: Option<&'a [u8]>,
        host: Option<&'a [u8]>,
    ) -> Address<'a> {
        Address {
            name: name.map(Cow::Borrowed),
            adl: None,
            mailbox: mailbox.map(Cow::Borrowed),
            host: host.map(Cow::Borrowed),
        }
    }

    fn empty_envelope() -> Envelope<'static> {
        Envelope {
            date: None,
            subject: None,
            from: None,
            sender: None,
            reply_to: None,
            to: None,
            cc: None,
            bcc: None,
            in_reply_to: None,
            message_id: None,
        }
    }

    fn message(id: u32, date: DateTime<Utc>) -> EmailMessage {
        EmailMessage {
            id,
            subject: String::new(),
            from: vec![],
            to: vec![],
            date,
            text: None,
            html: None,
        }
    }

    #[test]
    fn map_address_defaults_missing_address_to_empty_string() {
        let mapped = map_address(&address(Some(b"Alice"), None, None));
        assert_eq!(mapped.address, "");
        assert_eq!(mapped.name.as_deref(), Some("Alice"));
    }

    #[test]
    fn map_address_omits_name_when_absent() {
        let mapped = map_address(&address(None, Some(b"alice"), Some(b"example.com")));
        assert_eq!(mapped.address, "alice@example.com");
        assert_eq!(mapped.name, None);
    }

    #[test]
    fn build_message_is_total_over_missing_envelope() {
        let mapped = build_message(7, None, None);
        assert_eq!(mapped.id, 7);
        assert_eq!(mapped.subject, "");
        assert!(mapped.from.is_empty());
        assert_eq!(mapped.date, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn build_message_parses_envelope_date_and_subject() {
        let mut envelope = empty_envelope();
        envelope.date = Some(Cow::Borrowed(b"Tue, 4 Mar 2025 10:30:00 +0000"));
        envelope.subject = Some(Cow::Borrowed(b"Hello"));
        envelope.from = Some(vec![address(None, Some(b"bob"), Some(b"example.org"))]);

        let mapped = build_message(3, Some(&envelope), None);
        assert_eq!(mapped.subject, "Hello");
        assert_eq!(mapped.from[0].address, "bob@example.org");
        assert_eq!(mapped.date, Utc.with_ymd_and_hms(2025, 3, 4, 10, 30, 0).unwrap());
    }

    #[test]
    fn build_message_falls_back_to_internal_date() {
        let internal = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let mut envelope = empty_envelope();
        envelope.date = Some(Cow::Borrowed(b"not a date"));

        let mapped = build_message(1, Some(&envelope), Some(internal));
        assert_eq!(mapped.date, internal);
    }

    #[test]
    fn parse_envelope_date_rejects_non_dates() {
        assert_eq!(parse_envelope_date(b"not a date"), None);
        assert_eq!(parse_envelope_date(b""), None);
        assert_eq!(
            parse_envelope_date(b"Tue, 4 Mar 2025 10:30:00 +0000"),
            Some(Utc.with_ymd_and_hms(2025, 3, 4, 10, 30, 0).unwrap())
        );
    }

    #[test]
    fn decode_header_value_decodes_encoded_words() {
        let decoded = decode_header_value(b"=?UTF-8?B?SMOkbGxv?=");
        assert_eq!(decoded, "H\u{e4}llo");
        assert_eq!(decode_header_value(b"plain subject"), "plain subject");
    }

    #[test]
    fn leaf_name_takes_last_segment_and_decodes_utf7() {
        assert_eq!(leaf_name("Archive/2024", Some("/")), "2024");
        assert_eq!(leaf_name("INBOX", None), "INBOX");
        // "Entw&APw-rfe" is modified UTF-7 for a u-umlaut
        assert_eq!(leaf_name("Entw&APw-rfe", Some("/")), "Entw\u{fc}rfe");
    }

    #[test]
    fn special_use_detected_from_list_attributes() {
        let flags = vec!["NoInferiors".to_owned(), "Extension(\"\\\\Sent\")".to_owned()];
        assert_eq!(special_use_from_flags(&flags).as_deref(), Some("\\Sent"));
        assert_eq!(special_use_from_flags(&["Marked".to_owned()]), None);
    }

    #[test]
    fn most_recent_sorts_descending_and_truncates() {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let messages = (0u32..12)
            .map(|i| message(i, base + chrono::Duration::days(i64::from(i))))
            .collect::<Vec<_>>();

        let top = most_recent(messages, 10);
        assert_eq!(top.len(), 10);
        assert_eq!(top.first().map(|m| m.id), Some(11));
        assert_eq!(top.last().map(|m| m.id), Some(2));
        assert!(top.windows(2).all(|w| w[0].date >= w[1].date));
    }
}
