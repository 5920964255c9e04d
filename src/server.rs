//! MCP server implementation with tool and resource handlers
//!
//! Implements the `ServerHandler` trait, registers the three email tools, and
//! serves the inbox/folders snapshot resources. Handles input validation,
//! business orchestration, and response formatting. Every payload is
//! indented-JSON text.
//!
//! Error propagation is deliberately asymmetric, matching the contract: tool
//! operations catch transport failures and return them as error-flagged tool
//! results, while resource reads re-raise them to the host's error channel.
//! Validation failures surface as protocol errors before any connection is
//! attempted in either case.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    AnnotateAble, CallToolResult, Content, ErrorData, ListResourcesResult, PaginatedRequestParam,
    RawResource, ReadResourceRequestParam, ReadResourceResult, ResourceContents,
    ServerCapabilities, ServerInfo,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{ServerHandler, tool, tool_handler, tool_router};
use serde::Serialize;

use crate::config::Config;
use crate::errors::{AppError, AppResult};
use crate::imap;
use crate::models::{
    EmailFolder, EmailMessage, SearchEmailsInput, SendEmailInput, map_folder, map_message,
    most_recent,
};
use crate::query;
use crate::smtp::Mailer;

/// Number of messages in the inbox snapshot resource
const INBOX_SNAPSHOT_LIMIT: usize = 10;
/// Fetch projection for the inbox snapshot (envelope only)
const SNAPSHOT_FETCH_ITEMS: &str = "(UID ENVELOPE INTERNALDATE)";

/// Email MCP server
///
/// Holds shared configuration and the process-scoped delivery handle. Mailbox
/// reads open their own connection per invocation; nothing is shared between
/// them.
#[derive(Clone)]
pub struct MailBridgeServer {
    /// Process config (account, endpoints, timeouts)
    config: Arc<Config>,
    /// Long-lived SMTP delivery handle shared across send_email calls
    mailer: Mailer,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MailBridgeServer {
    /// Create a new MCP server instance
    pub fn new(config: Config, mailer: Mailer) -> Self {
        Self {
            config: Arc::new(config),
            mailer,
            tool_router: Self::tool_router(),
        }
    }

    /// Tool: Send one email via the configured account
    ///
    /// Delivery failures are returned as error-flagged results carrying the
    /// underlying message, never raised to the host.
    #[tool(
        name = "send_email",
        description = "Send an email using the configured account"
    )]
    async fn send_email(
        &self,
        Parameters(input): Parameters<SendEmailInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let to = validate_send_input(&input).map_err(|e| e.to_error_data())?;

        match self
            .mailer
            .send(to, &input.subject, &input.text, input.html.as_deref())
            .await
        {
            Ok(receipt) => json_text_result(&receipt),
            Err(e) => Ok(error_result(format!("Failed to send email: {e}"))),
        }
    }

    /// Tool: Search a folder and return matching message summaries
    ///
    /// Validates the criteria tree and projection before connecting, then
    /// opens the folder, searches, and fetches the first `limit` matches in
    /// the order the mailbox reports them.
    #[tool(
        name = "search_emails",
        description = "Search a mail folder with structured criteria"
    )]
    async fn search_emails(
        &self,
        Parameters(input): Parameters<SearchEmailsInput>,
    ) -> Result<CallToolResult, ErrorData> {
        validate_search_input(&input).map_err(|e| e.to_error_data())?;

        match self.search_emails_impl(&input).await {
            Ok(messages) => json_text_result(&messages),
            Err(e) => Ok(error_result(format!("Failed to search emails: {e}"))),
        }
    }

    /// Tool: List all folders of the account
    #[tool(name = "list_folders", description = "List all mail folders")]
    async fn list_folders(&self) -> Result<CallToolResult, ErrorData> {
        match self.list_folders_impl().await {
            Ok(folders) => json_text_result(&folders),
            Err(e) => Ok(error_result(format!("Failed to list folders: {e}"))),
        }
    }
}

/// MCP server handler implementation
///
/// Provides server info plus the read-only inbox/folders resources. Resource
/// failures propagate as protocol errors (unlike the tools above).
#[tool_handler(router = self.tool_router)]
impl ServerHandler for MailBridgeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(
            ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
        )
        .with_instructions(
            "Email MCP server. Tools send, search, and list folders over IMAP/SMTP; \
             resources expose inbox and folder snapshots.",
        )
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        let mut inbox = RawResource::new(self.inbox_uri(), "Inbox");
        inbox.description = Some("10 most recent messages in INBOX".to_owned());
        inbox.mime_type = Some("application/json".to_owned());

        let mut folders = RawResource::new(self.folders_uri(), "Folders");
        folders.description = Some("All mail folders of the account".to_owned());
        folders.mime_type = Some("application/json".to_owned());

        Ok(ListResourcesResult {
            meta: None,
            resources: vec![inbox.no_annotation(), folders.no_annotation()],
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        let uri = request.uri;
        let json = if uri == self.inbox_uri() {
            let messages = self.inbox_snapshot().await.map_err(|e| e.to_error_data())?;
            to_pretty_json(&messages).map_err(|e| e.to_error_data())?
        } else if uri == self.folders_uri() {
            let folders = self.list_folders_impl().await.map_err(|e| e.to_error_data())?;
            to_pretty_json(&folders).map_err(|e| e.to_error_data())?
        } else {
            return Err(AppError::NotFound(format!("unknown resource '{uri}'")).to_error_data());
        };

        Ok(ReadResourceResult::new(vec![ResourceContents::text(
            json, uri,
        )]))
    }
}

/// Business logic for the mailbox-read operations
///
/// Each method acquires its own session via `imap::with_session`, which
/// guarantees release on every exit path.
impl MailBridgeServer {
    /// URI of the inbox snapshot resource, derived from the account address
    fn inbox_uri(&self) -> String {
        format!("mailto:{}/inbox", self.config.user)
    }

    /// URI of the folders snapshot resource
    fn folders_uri(&self) -> String {
        format!("mailto:{}/folders", self.config.user)
    }

    async fn search_emails_impl(&self, input: &SearchEmailsInput) -> AppResult<Vec<EmailMessage>> {
        let program = query::build_search_program(&input.query)?;
        let items = query::build_fetch_items(&input.fetch_options);
        let limit = input.limit;

        imap::with_session(&self.config, Some(&input.folder), move |config, session| {
            async move {
                let uids = imap::uid_search(config, session, &program).await?;
                let page = first_page(uids, limit);
                if page.is_empty() {
                    return Ok(Vec::new());
                }

                let set = page
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                let fetches = imap::uid_fetch(config, session, &set, &items).await?;
                let messages = fetches.iter().map(map_message).collect();
                Ok(in_page_order(&page, messages))
            }
            .boxed()
        })
        .await
    }

    async fn list_folders_impl(&self) -> AppResult<Vec<EmailFolder>> {
        imap::with_session(&self.config, None, |config, session| {
            async move {
                let names = imap::list_all_mailboxes(config, session).await?;
                Ok(names.iter().map(map_folder).collect())
            }
            .boxed()
        })
        .await
    }

    /// Fetch the full INBOX range with envelope projection and keep the 10
    /// most recent messages, newest first
    async fn inbox_snapshot(&self) -> AppResult<Vec<EmailMessage>> {
        imap::with_session(&self.config, Some("INBOX"), |config, session| {
            async move {
                let fetches =
                    imap::uid_fetch(config, session, "1:*", SNAPSHOT_FETCH_ITEMS).await?;
                let messages = fetches.iter().map(map_message).collect();
                Ok(most_recent(messages, INBOX_SNAPSHOT_LIMIT))
            }
            .boxed()
        })
        .await
    }
}

/// Take at most `limit` UIDs, preserving the collaborator's order
fn first_page(uids: Vec<u32>, limit: usize) -> Vec<u32> {
    uids.into_iter().take(limit).collect()
}

/// Re-sequence fetched messages to the search order
///
/// FETCH responses may arrive in any order; the result follows `page`, and
/// messages the server did not return are skipped.
fn in_page_order(page: &[u32], messages: Vec<EmailMessage>) -> Vec<EmailMessage> {
    let mut by_uid: HashMap<u32, EmailMessage> =
        messages.into_iter().map(|m| (m.id, m)).collect();
    page.iter().filter_map(|uid| by_uid.remove(uid)).collect()
}

/// Validate a send request, returning the parsed recipient mailbox
fn validate_send_input(input: &SendEmailInput) -> AppResult<lettre::message::Mailbox> {
    if input.subject.trim().is_empty() {
        return Err(AppError::invalid("subject must not be empty"));
    }
    if input.text.trim().is_empty() {
        return Err(AppError::invalid("text must not be empty"));
    }
    input
        .to
        .parse::<lettre::message::Mailbox>()
        .map_err(|e| AppError::invalid(format!("'to' is not a valid email address: {e}")))
}

/// Validate a search request before any connection is attempted
fn validate_search_input(input: &SearchEmailsInput) -> AppResult<()> {
    validate_folder(&input.folder)?;
    if input.limit == 0 {
        return Err(AppError::invalid("limit must be a positive integer"));
    }
    query::validate_query(&input.query)?;
    query::validate_fetch_options(&input.fetch_options)?;
    Ok(())
}

/// Validate folder name format
fn validate_folder(folder: &str) -> AppResult<()> {
    if folder.is_empty() || folder.len() > 256 {
        return Err(AppError::invalid("folder must be 1..256 characters"));
    }
    if folder.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::invalid(
            "folder must not contain control characters",
        ));
    }
    Ok(())
}

/// Serialize a payload as indented JSON
fn to_pretty_json<T: Serialize>(value: &T) -> AppResult<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| AppError::Internal(format!("serialization failure: {e}")))
}

/// Wrap a payload as a successful JSON text result
fn json_text_result<T: Serialize>(value: &T) -> Result<CallToolResult, ErrorData> {
    let json = to_pretty_json(value).map_err(|e| e.to_error_data())?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

/// Build an error-flagged tool result carrying the failure text
fn error_result(message: String) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message)])
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use crate::models::{EmailMessage, SearchEmailsInput, SendEmailInput, default_folder};
    use crate::query::{FetchOptions, SearchQuery};

    use super::{
        first_page, in_page_order, validate_folder, validate_search_input, validate_send_input,
    };

    fn send_input(to: &str, subject: &str, text: &str) -> SendEmailInput {
        SendEmailInput {
            to: to.to_owned(),
            subject: subject.to_owned(),
            text: text.to_owned(),
            html: None,
        }
    }

    fn search_input(limit: usize) -> SearchEmailsInput {
        SearchEmailsInput {
            query: SearchQuery {
                subject: Some(String::new()),
                ..SearchQuery::default()
            },
            fetch_options: FetchOptions::default(),
            folder: default_folder(),
            limit,
        }
    }

    fn summary(id: u32) -> EmailMessage {
        EmailMessage {
            id,
            subject: String::new(),
            from: vec![],
            to: vec![],
            date: DateTime::UNIX_EPOCH,
            text: None,
            html: None,
        }
    }

    #[test]
    fn fetch_responses_are_resequenced_to_search_order() {
        let page = vec![9, 3, 7];
        let shuffled = vec![summary(7), summary(9), summary(3)];
        let ordered = in_page_order(&page, shuffled);
        assert_eq!(ordered.iter().map(|m| m.id).collect::<Vec<_>>(), vec![9, 3, 7]);

        // Uids the server did not return are skipped, not invented.
        let partial = in_page_order(&page, vec![summary(3)]);
        assert_eq!(partial.iter().map(|m| m.id).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn first_page_truncates_and_preserves_order() {
        assert_eq!(first_page(vec![9, 3, 7, 1, 5], 3), vec![9, 3, 7]);
        assert_eq!(first_page(vec![9, 3], 10), vec![9, 3]);
        assert_eq!(first_page(vec![], 10), Vec::<u32>::new());
    }

    #[test]
    fn send_input_requires_recipient_subject_and_text() {
        assert!(validate_send_input(&send_input("a@example.com", "hi", "body")).is_ok());
        assert!(validate_send_input(&send_input("not-an-address", "hi", "body")).is_err());
        assert!(validate_send_input(&send_input("a@example.com", "  ", "body")).is_err());
        assert!(validate_send_input(&send_input("a@example.com", "hi", "")).is_err());
    }

    #[test]
    fn search_input_requires_positive_limit() {
        assert!(validate_search_input(&search_input(10)).is_ok());
        let err = validate_search_input(&search_input(0)).expect_err("must fail");
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn folder_rejects_control_characters() {
        assert!(validate_folder("INBOX").is_ok());
        assert!(validate_folder("Archive/2024").is_ok());
        assert!(validate_folder("INBOX\r").is_err());
        assert!(validate_folder("").is_err());
    }
}
