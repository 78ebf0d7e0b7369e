// PostgreSQL handshake and simple-query state machine

use crate::executor::QueryExecutor;
use log::{debug, info, warn};
use std::sync::Arc;

use super::message::{RequestMessage, ResponseMessage, Severity, StartupParams, TransactionStatus};
use super::{NetworkError, Result};

/// Where a connection is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingFirstMessage,
    /// An encryption request was answered with `N`; a retry or startup comes next.
    SslDeclined,
    QueryReady,
    Closed,
}

/// Per-connection negotiated state. Owned by exactly one session.
#[derive(Debug, Clone)]
pub struct SessionState {
    phase: SessionPhase,
    startup_params: StartupParams,
    ssl_requested: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::AwaitingFirstMessage,
            startup_params: StartupParams::default(),
            ssl_requested: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase != SessionPhase::Closed
    }

    pub fn is_query_ready(&self) -> bool {
        self.phase == SessionPhase::QueryReady
    }

    /// True until the startup message has been processed.
    pub fn in_startup(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::AwaitingFirstMessage | SessionPhase::SslDeclined
        )
    }

    pub fn startup_params(&self) -> &StartupParams {
        &self.startup_params
    }

    /// Whether the client asked for SSL or GSSAPI encryption before startup.
    pub fn ssl_requested(&self) -> bool {
        self.ssl_requested
    }

    /// Encryption is never accepted, so this is always false.
    pub fn ssl_negotiated(&self) -> bool {
        false
    }

    pub(crate) fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifiers a client would quote in a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: i32,
    pub secret_key: i32,
}

impl BackendKey {
    pub fn generate(process_id: i32) -> Self {
        Self {
            process_id,
            secret_key: rand::random::<i32>(),
        }
    }
}

/// What the session loop should do after writing the responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Close,
}

#[derive(Debug)]
pub struct Reply {
    pub responses: Vec<ResponseMessage>,
    pub action: Action,
}

impl Reply {
    fn send(responses: Vec<ResponseMessage>) -> Self {
        Self {
            responses,
            action: Action::Continue,
        }
    }

    fn none() -> Self {
        Self::send(Vec::new())
    }

    fn close(responses: Vec<ResponseMessage>) -> Self {
        Self {
            responses,
            action: Action::Close,
        }
    }
}

pub struct ProtocolHandler {
    state: SessionState,
    executor: Arc<dyn QueryExecutor>,
    backend_key: BackendKey,
    server_version: String,
}

impl ProtocolHandler {
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        backend_key: BackendKey,
        server_version: impl Into<String>,
    ) -> Self {
        Self {
            state: SessionState::new(),
            executor,
            backend_key,
            server_version: server_version.into(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub(crate) fn close(&mut self) {
        self.state.close();
    }

    /// Advances the state machine by one request.
    pub fn handle_message(&mut self, msg: RequestMessage) -> Result<Reply> {
        if self.state.phase == SessionPhase::Closed {
            return Err(NetworkError::ProtocolViolation(
                "message received on a closed session".to_string(),
            ));
        }

        let reply = match msg {
            RequestMessage::SslNegotiation { .. } | RequestMessage::GssEncNegotiation
                if self.state.in_startup() =>
            {
                debug!("Declining encryption request");
                self.state.phase = SessionPhase::SslDeclined;
                self.state.ssl_requested = true;
                Reply::send(vec![ResponseMessage::SslNegotiationReply { accepted: false }])
            }
            RequestMessage::Startup { params, .. } if self.state.in_startup() => {
                self.handle_startup(params)
            }
            RequestMessage::SimpleQuery { query } if self.state.is_query_ready() => {
                self.handle_query(&query)
            }
            RequestMessage::SimpleQuery { .. } => {
                warn!("Simple query received before startup completed");
                Reply::close(vec![ResponseMessage::error(
                    Severity::Fatal,
                    "08P01",
                    "expected startup message",
                )])
            }
            RequestMessage::CancelRequest { process_id, .. } => {
                info!("Cancel request for backend {}; nothing to cancel", process_id);
                Reply::close(Vec::new())
            }
            RequestMessage::Terminate => Reply::close(Vec::new()),
            RequestMessage::Unknown { first_byte } => {
                warn!("Ignoring unknown message starting with 0x{:02x}", first_byte);
                Reply::none()
            }
            other => {
                warn!(
                    "Ignoring {:?} in phase {:?}",
                    other, self.state.phase
                );
                Reply::none()
            }
        };

        if reply.action == Action::Close {
            self.state.close();
        }
        Ok(reply)
    }

    fn handle_startup(&mut self, params: StartupParams) -> Reply {
        info!(
            "Startup for user {:?} on database {:?}",
            params.get("user").unwrap_or(""),
            params.get("database").unwrap_or("")
        );

        let user = params.get("user").unwrap_or("postgres").to_string();
        let mut responses = vec![ResponseMessage::AuthenticationOk];
        let settings = [
            ("server_version", self.server_version.as_str()),
            ("server_encoding", "UTF8"),
            ("client_encoding", "UTF8"),
            ("DateStyle", "ISO, MDY"),
            ("integer_datetimes", "on"),
            ("standard_conforming_strings", "on"),
            ("TimeZone", "UTC"),
            ("session_authorization", user.as_str()),
        ];
        responses.extend(settings.iter().map(|(name, value)| {
            ResponseMessage::ParameterStatus {
                name: name.to_string(),
                value: value.to_string(),
            }
        }));
        responses.push(ResponseMessage::BackendKeyData {
            process_id: self.backend_key.process_id,
            secret_key: self.backend_key.secret_key,
        });
        responses.push(ResponseMessage::ReadyForQuery {
            status: TransactionStatus::Idle,
        });

        self.state.startup_params = params;
        self.state.phase = SessionPhase::QueryReady;
        Reply::send(responses)
    }

    fn handle_query(&mut self, query: &str) -> Reply {
        debug!("Executing query: {}", query);
        let mut responses = Vec::new();

        if query.trim().is_empty() {
            responses.push(ResponseMessage::EmptyQueryResponse);
        } else {
            match self.executor.execute(query) {
                Ok(result) => {
                    if result.has_row_set() {
                        responses.push(ResponseMessage::RowDescription {
                            columns: result.columns,
                        });
                        responses.extend(result.rows.into_iter().map(|row| {
                            ResponseMessage::DataRow {
                                values: row
                                    .into_iter()
                                    .map(|value| value.map(String::into_bytes))
                                    .collect(),
                            }
                        }));
                    }
                    responses.push(ResponseMessage::CommandComplete {
                        tag: result.command_tag,
                    });
                }
                Err(e) => {
                    warn!("Query failed: {}", e);
                    responses.push(ResponseMessage::error(
                        Severity::Error,
                        e.sqlstate(),
                        e.to_string(),
                    ));
                }
            }
        }

        responses.push(ResponseMessage::ReadyForQuery {
            status: TransactionStatus::Idle,
        });
        Reply::send(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorError, QueryResult, SampleExecutor};
    use crate::network::message::ColumnDescriptor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        calls: AtomicUsize,
    }

    impl QueryExecutor for CountingExecutor {
        fn execute(&self, query: &str) -> std::result::Result<QueryResult, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if query.starts_with("bad") {
                return Err(ExecutorError::Syntax(query.to_string()));
            }
            Ok(QueryResult::rows(
                vec![ColumnDescriptor::new("one")],
                vec![vec![Some("1".to_string())], vec![None]],
            ))
        }
    }

    fn counting_handler() -> (ProtocolHandler, Arc<CountingExecutor>) {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });
        let key = BackendKey {
            process_id: 1234,
            secret_key: 5678,
        };
        (ProtocolHandler::new(executor.clone(), key, "15.0"), executor)
    }

    fn startup(pairs: &[(&str, &str)]) -> RequestMessage {
        RequestMessage::Startup {
            protocol_version: crate::network::PROTOCOL_VERSION_3,
            params: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn query(text: &str) -> RequestMessage {
        RequestMessage::SimpleQuery {
            query: text.to_string(),
        }
    }

    #[test]
    fn test_ssl_request_is_declined() {
        let (mut handler, _) = counting_handler();
        let reply = handler
            .handle_message(RequestMessage::SslNegotiation {
                ssl_code: crate::network::SSL_REQUEST_CODE,
            })
            .unwrap();

        assert_eq!(
            reply.responses,
            vec![ResponseMessage::SslNegotiationReply { accepted: false }]
        );
        assert_eq!(reply.action, Action::Continue);
        assert_eq!(handler.state().phase(), SessionPhase::SslDeclined);

        // A retried request is answered again
        let reply = handler
            .handle_message(RequestMessage::GssEncNegotiation)
            .unwrap();
        assert_eq!(reply.responses.len(), 1);
        assert!(handler.state().in_startup());
    }

    #[test]
    fn test_declined_ssl_is_remembered_after_startup() {
        let (mut handler, _) = counting_handler();
        assert!(!handler.state().ssl_requested());

        handler
            .handle_message(RequestMessage::SslNegotiation {
                ssl_code: crate::network::SSL_REQUEST_CODE,
            })
            .unwrap();
        handler.handle_message(startup(&[("user", "alice")])).unwrap();

        let state = handler.state();
        assert_eq!(state.phase(), SessionPhase::QueryReady);
        assert!(state.ssl_requested());
        assert!(!state.ssl_negotiated());
    }

    #[test]
    fn test_plain_startup_records_no_ssl_request() {
        let (mut handler, _) = counting_handler();
        handler.handle_message(startup(&[("user", "alice")])).unwrap();
        assert!(handler.state().is_query_ready());
        assert!(!handler.state().ssl_requested());
    }

    #[test]
    fn test_startup_sequence() {
        let (mut handler, _) = counting_handler();
        let reply = handler
            .handle_message(startup(&[("user", "alice"), ("database", "mydb")]))
            .unwrap();

        assert_eq!(reply.responses.first(), Some(&ResponseMessage::AuthenticationOk));
        let tail = &reply.responses[reply.responses.len() - 2..];
        assert_eq!(
            tail,
            &[
                ResponseMessage::BackendKeyData {
                    process_id: 1234,
                    secret_key: 5678
                },
                ResponseMessage::ReadyForQuery {
                    status: TransactionStatus::Idle
                },
            ]
        );
        assert!(reply.responses.contains(&ResponseMessage::ParameterStatus {
            name: "session_authorization".to_string(),
            value: "alice".to_string(),
        }));

        assert!(handler.state().is_query_ready());
        assert_eq!(handler.state().startup_params().get("database"), Some("mydb"));
    }

    #[test]
    fn test_query_after_startup() {
        let (mut handler, executor) = counting_handler();
        handler.handle_message(startup(&[("user", "alice")])).unwrap();

        let reply = handler.handle_message(query("SELECT 1")).unwrap();
        let tags: Vec<u8> = reply.responses.iter().map(ResponseMessage::tag).collect();
        assert_eq!(tags, b"TDDCZ".to_vec());
        assert_eq!(
            reply.responses[2],
            ResponseMessage::DataRow { values: vec![None] }
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert!(handler.state().is_query_ready());
    }

    #[test]
    fn test_query_before_startup_is_rejected() {
        let (mut handler, executor) = counting_handler();

        let reply = handler.handle_message(query("SELECT 1")).unwrap();
        assert_eq!(reply.action, Action::Close);
        assert_eq!(reply.responses.len(), 1);
        assert_eq!(reply.responses[0].tag(), b'E');
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(handler.state().phase(), SessionPhase::Closed);
        assert!(!handler.state().is_query_ready());

        let err = handler.handle_message(startup(&[])).unwrap_err();
        assert!(matches!(err, NetworkError::ProtocolViolation(_)));
    }

    #[test]
    fn test_query_after_ssl_decline_without_startup() {
        let (mut handler, executor) = counting_handler();
        handler
            .handle_message(RequestMessage::SslNegotiation {
                ssl_code: crate::network::SSL_REQUEST_CODE,
            })
            .unwrap();

        let reply = handler.handle_message(query("SELECT 1")).unwrap();
        assert_eq!(reply.action, Action::Close);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_executor_error_becomes_error_response() {
        let (mut handler, _) = counting_handler();
        handler.handle_message(startup(&[])).unwrap();

        let reply = handler.handle_message(query("bad sql")).unwrap();
        let tags: Vec<u8> = reply.responses.iter().map(ResponseMessage::tag).collect();
        assert_eq!(tags, b"EZ".to_vec());
        assert_eq!(reply.action, Action::Continue);
        assert!(handler.state().is_query_ready());
    }

    #[test]
    fn test_empty_query() {
        let (mut handler, executor) = counting_handler();
        handler.handle_message(startup(&[])).unwrap();

        let reply = handler.handle_message(query("  ")).unwrap();
        assert_eq!(
            reply.responses[0],
            ResponseMessage::EmptyQueryResponse
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_message_changes_nothing() {
        let (mut handler, _) = counting_handler();
        let reply = handler
            .handle_message(RequestMessage::Unknown { first_byte: b'P' })
            .unwrap();

        assert!(reply.responses.is_empty());
        assert_eq!(reply.action, Action::Continue);
        assert_eq!(handler.state().phase(), SessionPhase::AwaitingFirstMessage);
    }

    #[test]
    fn test_terminate_closes() {
        let (mut handler, _) = counting_handler();
        handler.handle_message(startup(&[])).unwrap();

        let reply = handler.handle_message(RequestMessage::Terminate).unwrap();
        assert!(reply.responses.is_empty());
        assert_eq!(reply.action, Action::Close);
        assert!(!handler.state().is_connected());
    }

    #[test]
    fn test_cancel_request_closes_without_reply() {
        let (mut handler, _) = counting_handler();
        let reply = handler
            .handle_message(RequestMessage::CancelRequest {
                process_id: 1,
                secret_key: 2,
            })
            .unwrap();
        assert!(reply.responses.is_empty());
        assert_eq!(reply.action, Action::Close);
    }

    #[test]
    fn test_second_startup_is_ignored() {
        let (mut handler, _) = counting_handler();
        handler.handle_message(startup(&[("user", "alice")])).unwrap();

        let reply = handler.handle_message(startup(&[("user", "eve")])).unwrap();
        assert!(reply.responses.is_empty());
        assert_eq!(handler.state().startup_params().get("user"), Some("alice"));
    }

    #[test]
    fn test_sample_executor_through_handler() {
        let executor: Arc<dyn QueryExecutor> = Arc::new(SampleExecutor::new(3));
        let mut handler = ProtocolHandler::new(executor, BackendKey::generate(1), "15.0");
        handler.handle_message(startup(&[])).unwrap();

        let reply = handler.handle_message(query("SELECT * FROM users")).unwrap();
        assert_eq!(reply.responses.len(), 1 + 3 + 1 + 1);
        assert_eq!(
            reply.responses[4],
            ResponseMessage::CommandComplete {
                tag: "SELECT 3".to_string()
            }
        );
    }
}
