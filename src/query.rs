//! Search criteria and fetch projection schemas
//!
//! Defines the accepted vocabulary for mailbox searches ([`SearchQuery`], a
//! recursive criteria tree with an `or` combinator) and fetch projections
//! ([`FetchOptions`]), validates request structure before any network call,
//! and compiles both into IMAP `SEARCH`/`FETCH` program strings.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::errors::{AppError, AppResult};

/// Maximum nesting depth of the `or` combinator
///
/// The tree is caller-controlled; the cap bounds validation and search cost.
pub const MAX_QUERY_DEPTH: usize = 32;

/// Maximum length of a text criterion
const MAX_TEXT_LEN: usize = 256;

/// Search criteria tree
///
/// Criteria within one node are combined with AND; the `or` field holds an
/// ordered list of nested trees combined into a disjunction. Every scalar
/// field is optional except `subject`, whose presence is required at each
/// node by [`validate_query`]. Wire names are camelCase.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SearchQuery {
    /// `true` → ANSWERED, `false` → UNANSWERED
    pub answered: Option<bool>,
    /// `true` → DELETED, `false` → UNDELETED
    pub deleted: Option<bool>,
    /// `true` → DRAFT, `false` → UNDRAFT
    pub draft: Option<bool>,
    /// `true` → FLAGGED, `false` → UNFLAGGED
    pub flagged: Option<bool>,
    /// `true` → SEEN, `false` → UNSEEN
    pub seen: Option<bool>,
    /// Match all messages in the folder
    pub all: Option<bool>,
    /// Messages with the Recent flag but not Seen
    pub new: Option<bool>,
    /// Messages without the Recent flag
    pub old: Option<bool>,
    /// Messages with the Recent flag
    pub recent: Option<bool>,
    /// Substring match on the From header
    pub from: Option<String>,
    /// Substring match on the To header
    pub to: Option<String>,
    /// Substring match on the Cc header
    pub cc: Option<String>,
    /// Substring match on the Bcc header
    pub bcc: Option<String>,
    /// Substring match on the message body
    pub body: Option<String>,
    /// Substring match on the Subject header
    pub subject: Option<String>,
    /// Messages with the given keyword flag set
    pub keyword: Option<String>,
    /// Messages without the given keyword flag
    pub un_keyword: Option<String>,
    /// Substring match on arbitrary headers, keyed by header name
    pub header: Option<BTreeMap<String, String>>,
    /// UID set, e.g. `1:100` or `5,7,9`
    pub uid: Option<String>,
    /// Messages larger than this many octets
    pub larger: Option<u64>,
    /// Messages smaller than this many octets
    pub smaller: Option<u64>,
    /// Internal date strictly before this day (`YYYY-MM-DD`)
    pub before: Option<String>,
    /// Internal date on this day (`YYYY-MM-DD`)
    pub on: Option<String>,
    /// Internal date on or after this day (`YYYY-MM-DD`)
    pub since: Option<String>,
    /// Date header strictly before this day (`YYYY-MM-DD`)
    pub sent_before: Option<String>,
    /// Date header on this day (`YYYY-MM-DD`)
    pub sent_on: Option<String>,
    /// Date header on or after this day (`YYYY-MM-DD`)
    pub sent_since: Option<String>,
    /// Modification sequence (CONDSTORE servers)
    pub modseq: Option<u64>,
    /// Gmail message id (X-GM-MSGID)
    pub email_id: Option<String>,
    /// Gmail thread id (X-GM-THRID)
    pub thread_id: Option<String>,
    /// Raw Gmail search expression (X-GM-RAW)
    pub gm_raw: Option<String>,
    /// Nested trees combined into a disjunction with this node's criteria
    #[serde(default)]
    pub or: Vec<SearchQuery>,
}

/// Header projection: everything, or a named subset
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum HeaderSelection {
    /// `true` fetches the full header block; `false` fetches nothing
    All(bool),
    /// Fetch only the named header fields
    Fields(Vec<String>),
}

/// Source projection: the whole message, or a byte range of it
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum SourceSelection {
    /// `true` fetches the full RFC822 source; `false` fetches nothing
    All(bool),
    /// Fetch a partial range of the source
    #[serde(rename_all = "camelCase")]
    Range {
        /// Byte offset to start from (default 0)
        start: Option<u32>,
        /// Maximum number of bytes to return
        max_length: Option<u32>,
    },
}

/// Fetch projection
///
/// Each field selects one part of the message to retrieve. An empty
/// projection defers to the transport default (the envelope, which the
/// summary mapping needs). Wire names are camelCase.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FetchOptions {
    /// Fetch the UID (always requested regardless of this flag)
    pub uid: Option<bool>,
    /// Fetch message flags
    pub flags: Option<bool>,
    /// Fetch the envelope (subject, participants, date)
    pub envelope: Option<bool>,
    /// Fetch the MIME body structure
    pub body_structure: Option<bool>,
    /// Fetch the internal date
    pub internal_date: Option<bool>,
    /// Fetch the message size in octets
    pub size: Option<bool>,
    /// Fetch raw source, fully or partially
    pub source: Option<SourceSelection>,
    /// Fetch headers, fully or by name
    pub headers: Option<HeaderSelection>,
    /// Fetch specific MIME body sections, e.g. `["1", "2.1"]`
    pub body_parts: Option<Vec<String>>,
    /// Fetch the Gmail thread id
    pub thread_id: Option<bool>,
    /// Fetch Gmail labels
    pub labels: Option<bool>,
}

/// Validate a search criteria tree
///
/// Recursive descent over the tree: enforces the depth cap, requires
/// `subject` at every node, and checks every scalar criterion (text bounds,
/// control characters, date syntax, UID-set charset, header-name tokens).
/// Runs synchronously before any connection is attempted.
pub fn validate_query(query: &SearchQuery) -> AppResult<()> {
    validate_query_at(query, 0)
}

fn validate_query_at(query: &SearchQuery, depth: usize) -> AppResult<()> {
    if depth > MAX_QUERY_DEPTH {
        return Err(AppError::invalid(format!(
            "query exceeds maximum or-nesting depth of {MAX_QUERY_DEPTH}"
        )));
    }
    if query.subject.is_none() {
        return Err(AppError::invalid("query.subject is required"));
    }

    for (field, value) in [
        ("from", &query.from),
        ("to", &query.to),
        ("cc", &query.cc),
        ("bcc", &query.bcc),
        ("body", &query.body),
        ("subject", &query.subject),
        ("keyword", &query.keyword),
        ("unKeyword", &query.un_keyword),
        ("gmRaw", &query.gm_raw),
    ] {
        if let Some(v) = value {
            validate_criterion_text(v, field)?;
        }
    }

    // Gmail ids are emitted unquoted into the search program, so they get the
    // same strict charset treatment as UID sets.
    for (field, value) in [("emailId", &query.email_id), ("threadId", &query.thread_id)] {
        if let Some(v) = value {
            validate_gmail_id(v, field)?;
        }
    }

    if let Some(headers) = &query.header {
        for (name, value) in headers {
            validate_header_name(name)?;
            validate_criterion_text(value, "header value")?;
        }
    }

    if let Some(uid) = &query.uid {
        validate_uid_set(uid)?;
    }

    for (field, value) in [
        ("before", &query.before),
        ("on", &query.on),
        ("since", &query.since),
        ("sentBefore", &query.sent_before),
        ("sentOn", &query.sent_on),
        ("sentSince", &query.sent_since),
    ] {
        if let Some(v) = value {
            parse_ymd(v).map_err(|_| {
                AppError::invalid(format!("{field} must be a YYYY-MM-DD date, got '{v}'"))
            })?;
        }
    }

    for child in &query.or {
        validate_query_at(child, depth + 1)?;
    }
    Ok(())
}

/// Validate a fetch projection
pub fn validate_fetch_options(options: &FetchOptions) -> AppResult<()> {
    if let Some(HeaderSelection::Fields(fields)) = &options.headers {
        for field in fields {
            validate_header_name(field)?;
        }
    }
    if let Some(parts) = &options.body_parts {
        for part in parts {
            validate_body_section(part)?;
        }
    }
    Ok(())
}

/// Compile a validated criteria tree into an IMAP SEARCH program
///
/// AND within a node (space-joined keys), `or` children folded into nested
/// binary `OR` expressions with parenthesized operands. An empty tree
/// compiles to `ALL`.
pub fn build_search_program(query: &SearchQuery) -> AppResult<String> {
    let parts = node_parts(query)?;
    if parts.is_empty() {
        Ok("ALL".to_owned())
    } else {
        Ok(parts.join(" "))
    }
}

fn node_parts(query: &SearchQuery) -> AppResult<Vec<String>> {
    let mut parts = Vec::new();

    for (set_key, unset_key, value) in [
        ("ANSWERED", "UNANSWERED", query.answered),
        ("DELETED", "UNDELETED", query.deleted),
        ("DRAFT", "UNDRAFT", query.draft),
        ("FLAGGED", "UNFLAGGED", query.flagged),
        ("SEEN", "UNSEEN", query.seen),
    ] {
        if let Some(v) = value {
            parts.push(if v { set_key } else { unset_key }.to_owned());
        }
    }
    for (key, value) in [
        ("ALL", query.all),
        ("NEW", query.new),
        ("OLD", query.old),
        ("RECENT", query.recent),
    ] {
        if value.unwrap_or(false) {
            parts.push(key.to_owned());
        }
    }

    for (key, value) in [
        ("FROM", &query.from),
        ("TO", &query.to),
        ("CC", &query.cc),
        ("BCC", &query.bcc),
        ("BODY", &query.body),
        ("SUBJECT", &query.subject),
        ("KEYWORD", &query.keyword),
        ("UNKEYWORD", &query.un_keyword),
        ("X-GM-RAW", &query.gm_raw),
    ] {
        if let Some(v) = value
            && !v.is_empty()
        {
            parts.push(format!("{key} \"{}\"", escape_quoted(v)));
        }
    }

    if let Some(headers) = &query.header {
        for (name, value) in headers {
            parts.push(format!("HEADER {name} \"{}\"", escape_quoted(value)));
        }
    }

    if let Some(uid) = &query.uid {
        parts.push(format!("UID {uid}"));
    }
    if let Some(n) = query.larger {
        parts.push(format!("LARGER {n}"));
    }
    if let Some(n) = query.smaller {
        parts.push(format!("SMALLER {n}"));
    }
    if let Some(n) = query.modseq {
        parts.push(format!("MODSEQ {n}"));
    }
    for (key, value) in [
        ("X-GM-MSGID", &query.email_id),
        ("X-GM-THRID", &query.thread_id),
    ] {
        if let Some(v) = value
            && !v.is_empty()
        {
            parts.push(format!("{key} {v}"));
        }
    }

    for (key, value) in [
        ("BEFORE", &query.before),
        ("ON", &query.on),
        ("SINCE", &query.since),
        ("SENTBEFORE", &query.sent_before),
        ("SENTON", &query.sent_on),
        ("SENTSINCE", &query.sent_since),
    ] {
        if let Some(v) = value {
            parts.push(format!("{key} {}", imap_date(parse_ymd(v)?)));
        }
    }

    if !query.or.is_empty() {
        parts.push(or_expression(&query.or)?);
    }

    Ok(parts)
}

/// Fold `or` children into nested binary OR expressions
///
/// A single child degrades to that child's (grouped) criteria. Each operand
/// is parenthesized so multi-key children stay one search-key.
fn or_expression(children: &[SearchQuery]) -> AppResult<String> {
    let mut operands = Vec::with_capacity(children.len());
    for child in children {
        let parts = node_parts(child)?;
        operands.push(if parts.is_empty() {
            "ALL".to_owned()
        } else {
            format!("({})", parts.join(" "))
        });
    }

    let mut iter = operands.into_iter().rev();
    // or_expression is only called with a non-empty child list
    let mut expr = iter
        .next()
        .ok_or_else(|| AppError::Internal("empty or combinator".to_owned()))?;
    for operand in iter {
        expr = format!("OR {operand} {expr}");
    }
    Ok(expr)
}

/// Compile a validated projection into an IMAP FETCH item list
///
/// `UID` is always requested so results can be mapped back to stable ids.
/// A projection that requests nothing defers to `ENVELOPE`.
pub fn build_fetch_items(options: &FetchOptions) -> String {
    let mut items = vec!["UID".to_owned()];

    for (key, value) in [
        ("FLAGS", options.flags),
        ("ENVELOPE", options.envelope),
        ("BODYSTRUCTURE", options.body_structure),
        ("INTERNALDATE", options.internal_date),
        ("RFC822.SIZE", options.size),
        ("X-GM-THRID", options.thread_id),
        ("X-GM-LABELS", options.labels),
    ] {
        if value.unwrap_or(false) {
            items.push(key.to_owned());
        }
    }

    match &options.source {
        Some(SourceSelection::All(true)) => items.push("BODY.PEEK[]".to_owned()),
        Some(SourceSelection::Range { start, max_length }) => {
            let origin = start.unwrap_or(0);
            match max_length {
                Some(len) => items.push(format!("BODY.PEEK[]<{origin}.{len}>")),
                None => items.push("BODY.PEEK[]".to_owned()),
            }
        }
        Some(SourceSelection::All(false)) | None => {}
    }

    match &options.headers {
        Some(HeaderSelection::All(true)) => items.push("BODY.PEEK[HEADER]".to_owned()),
        Some(HeaderSelection::Fields(fields)) if !fields.is_empty() => {
            items.push(format!("BODY.PEEK[HEADER.FIELDS ({})]", fields.join(" ")));
        }
        _ => {}
    }

    if let Some(parts) = &options.body_parts {
        for part in parts {
            items.push(format!("BODY.PEEK[{part}]"));
        }
    }

    if items.len() == 1 {
        items.push("ENVELOPE".to_owned());
    }
    format!("({})", items.join(" "))
}

/// Validate a text criterion's bounds and characters
fn validate_criterion_text(value: &str, field: &str) -> AppResult<()> {
    if value.len() > MAX_TEXT_LEN {
        return Err(AppError::invalid(format!(
            "{field} must be at most {MAX_TEXT_LEN} characters"
        )));
    }
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::invalid(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

/// Validate a header field name as an RFC 5322 token
fn validate_header_name(name: &str) -> AppResult<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(AppError::invalid("header name must be 1..64 characters"));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(AppError::invalid(format!(
            "header name '{name}' must match [A-Za-z0-9_-]+"
        )));
    }
    Ok(())
}

/// Validate a UID set expression
fn validate_uid_set(set: &str) -> AppResult<()> {
    if set.is_empty() || set.len() > MAX_TEXT_LEN {
        return Err(AppError::invalid("uid set must be 1..256 characters"));
    }
    if !set
        .chars()
        .all(|ch| ch.is_ascii_digit() || matches!(ch, ',' | ':' | '*'))
    {
        return Err(AppError::invalid(format!(
            "uid set '{set}' may only contain digits, ',', ':', and '*'"
        )));
    }
    Ok(())
}

/// Validate a Gmail message/thread id
///
/// Ids are decimal renderings of a `u64` and appear unquoted in the search
/// program, so only digits are accepted.
fn validate_gmail_id(value: &str, field: &str) -> AppResult<()> {
    if value.is_empty() || value.len() > 20 || !value.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(AppError::invalid(format!(
            "{field} must be a digits-only id, got '{value}'"
        )));
    }
    Ok(())
}

/// Validate a MIME section specifier for BODY fetches
fn validate_body_section(section: &str) -> AppResult<()> {
    if section.is_empty() || section.len() > 64 {
        return Err(AppError::invalid("body part must be 1..64 characters"));
    }
    if !section
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '.')
    {
        return Err(AppError::invalid(format!(
            "body part '{section}' may only contain digits, letters, and '.'"
        )));
    }
    Ok(())
}

/// Escape backslashes and quotes for IMAP quoted strings
fn escape_quoted(input: &str) -> String {
    input.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Format date as IMAP SEARCH date (e.g., "1-Jan-2025")
fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

/// Parse YYYY-MM-DD date string
fn parse_ymd(input: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| AppError::invalid(format!("invalid date '{input}', expected YYYY-MM-DD")))
}

#[cfg(test)]
mod tests {
    use super::{
        FetchOptions, HeaderSelection, MAX_QUERY_DEPTH, SearchQuery, SourceSelection,
        build_fetch_items, build_search_program, validate_fetch_options, validate_query,
    };

    fn subject_query(subject: &str) -> SearchQuery {
        SearchQuery {
            subject: Some(subject.to_owned()),
            ..SearchQuery::default()
        }
    }

    #[test]
    fn validate_rejects_query_without_subject() {
        let err = validate_query(&SearchQuery::default()).expect_err("must fail");
        assert!(err.to_string().contains("subject is required"));
    }

    #[test]
    fn validate_rejects_subject_missing_in_nested_node() {
        let mut query = subject_query("hello");
        query.or = vec![SearchQuery::default()];
        let err = validate_query(&query).expect_err("must fail");
        assert!(err.to_string().contains("subject is required"));
    }

    #[test]
    fn validate_rejects_excessive_or_depth() {
        let mut query = subject_query("leaf");
        for _ in 0..=MAX_QUERY_DEPTH {
            let mut outer = subject_query("node");
            outer.or = vec![query];
            query = outer;
        }
        let err = validate_query(&query).expect_err("must fail");
        assert!(err.to_string().contains("nesting depth"));
    }

    #[test]
    fn validate_rejects_control_characters_and_bad_dates() {
        let mut query = subject_query("a\nb");
        assert!(validate_query(&query).is_err());

        query = subject_query("ok");
        query.since = Some("March 1".to_owned());
        assert!(validate_query(&query).is_err());

        query = subject_query("ok");
        query.uid = Some("1:10;DROP".to_owned());
        assert!(validate_query(&query).is_err());
    }

    #[test]
    fn gmail_ids_must_be_digits_only() {
        let mut query = subject_query("x");
        query.email_id = Some("1278455344230334865".to_owned());
        validate_query(&query).expect("must validate");
        assert_eq!(
            build_search_program(&query).unwrap(),
            "SUBJECT \"x\" X-GM-MSGID 1278455344230334865"
        );

        // Spaces would splice extra search keys into the program unquoted.
        query.email_id = Some("123 456 OR ALL".to_owned());
        let err = validate_query(&query).expect_err("must fail");
        assert!(err.to_string().contains("digits-only"));

        query = subject_query("x");
        query.thread_id = Some("abc".to_owned());
        assert!(validate_query(&query).is_err());
    }

    #[test]
    fn unknown_query_fields_are_rejected_at_deserialization() {
        let err = serde_json::from_value::<SearchQuery>(serde_json::json!({
            "subject": "x",
            "from_address": "a@b.c"
        }))
        .expect_err("must fail");
        assert!(err.to_string().contains("from_address"));
    }

    #[test]
    fn compiles_and_of_criteria_within_one_node() {
        let mut query = subject_query("invoice");
        query.seen = Some(false);
        query.from = Some("billing@example.com".to_owned());
        query.since = Some("2025-03-01".to_owned());

        let program = build_search_program(&query).expect("must compile");
        assert_eq!(
            program,
            "UNSEEN FROM \"billing@example.com\" SUBJECT \"invoice\" SINCE 1-Mar-2025"
        );
    }

    #[test]
    fn compiles_or_children_into_nested_binary_or() {
        let mut query = subject_query("");
        let mut a = subject_query("alpha");
        a.seen = Some(true);
        let b = subject_query("beta");
        let c = subject_query("gamma");
        query.or = vec![a, b, c];

        let program = build_search_program(&query).expect("must compile");
        assert_eq!(
            program,
            "OR (SEEN SUBJECT \"alpha\") OR (SUBJECT \"beta\") (SUBJECT \"gamma\")"
        );
    }

    #[test]
    fn empty_query_compiles_to_all() {
        let query = subject_query("");
        assert_eq!(build_search_program(&query).unwrap(), "ALL");
    }

    #[test]
    fn escapes_quotes_and_backslashes_in_criteria() {
        let query = subject_query("a \"b\" \\c");
        assert_eq!(
            build_search_program(&query).unwrap(),
            "SUBJECT \"a \\\"b\\\" \\\\c\""
        );
    }

    #[test]
    fn fetch_options_deserialize_union_shapes() {
        let options = serde_json::from_value::<FetchOptions>(serde_json::json!({
            "envelope": true,
            "headers": ["Subject", "Date"],
            "source": { "start": 0, "maxLength": 1024 }
        }))
        .expect("must deserialize");
        assert!(matches!(options.headers, Some(HeaderSelection::Fields(ref f)) if f.len() == 2));
        assert!(matches!(
            options.source,
            Some(SourceSelection::Range { max_length: Some(1024), .. })
        ));

        let flag_form = serde_json::from_value::<FetchOptions>(serde_json::json!({
            "headers": true,
            "source": true
        }))
        .expect("must deserialize");
        assert!(matches!(flag_form.headers, Some(HeaderSelection::All(true))));
    }

    #[test]
    fn builds_fetch_items_from_projection() {
        let options = FetchOptions {
            envelope: Some(true),
            flags: Some(true),
            size: Some(true),
            headers: Some(HeaderSelection::Fields(vec![
                "Subject".to_owned(),
                "Date".to_owned(),
            ])),
            source: Some(SourceSelection::Range {
                start: None,
                max_length: Some(2048),
            }),
            ..FetchOptions::default()
        };
        validate_fetch_options(&options).expect("must validate");
        assert_eq!(
            build_fetch_items(&options),
            "(UID FLAGS ENVELOPE RFC822.SIZE BODY.PEEK[]<0.2048> BODY.PEEK[HEADER.FIELDS (Subject Date)])"
        );
    }

    #[test]
    fn empty_projection_defers_to_envelope() {
        assert_eq!(build_fetch_items(&FetchOptions::default()), "(UID ENVELOPE)");
    }

    #[test]
    fn rejects_malformed_header_names_and_body_parts() {
        let options = FetchOptions {
            headers: Some(HeaderSelection::Fields(vec!["Bad Header".to_owned()])),
            ..FetchOptions::default()
        };
        assert!(validate_fetch_options(&options).is_err());

        let options = FetchOptions {
            body_parts: Some(vec!["1.2]".to_owned()]),
            ..FetchOptions::default()
        };
        assert!(validate_fetch_options(&options).is_err());
    }
}
