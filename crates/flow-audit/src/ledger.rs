use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use http_assembler::{Request, Response};

use crate::journal::JournalSink;
use crate::record::{AlertLevel, JournalRecord, RecordKind, SessionId, StreamId};

/// Default activity window within which connections from one client IP are
/// grouped into the same session.
pub const DEFAULT_SESSION_WINDOW: Duration = Duration::from_secs(30);

/// A correlated user session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: SessionId,
    pub client_ip: IpAddr,
    pub started_at: DateTime<Utc>,
    pub alert: AlertLevel,
    last_seen: Instant,
}

/// One TCP connection's lifecycle record, owned by exactly one session.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub id: StreamId,
    pub session: SessionId,
    pub client: SocketAddr,
    pub target: SocketAddr,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed: bool,
}

#[derive(Default)]
struct LedgerState {
    next_session: u64,
    next_stream: u64,
    sessions: HashMap<SessionId, SessionRecord>,
    streams: HashMap<StreamId, StreamRecord>,
}

/// The session/stream correlator consumed by the relay.
///
/// Cheap to clone and safe to use from any number of connections
/// concurrently. Every mutation is mirrored into the journal (when one is
/// attached); journal problems are logged and swallowed so audit never
/// interferes with forwarding.
#[derive(Clone)]
pub struct FlowLedger {
    state: Arc<Mutex<LedgerState>>,
    journal: Option<JournalSink>,
    window: Duration,
}

impl FlowLedger {
    /// In-memory ledger without persistence.
    pub fn new(window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            journal: None,
            window,
        }
    }

    /// Ledger that mirrors every mutation into `journal`.
    pub fn with_journal(window: Duration, journal: JournalSink) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new(window)
        }
    }

    /// Open a stream record for a freshly accepted connection.
    ///
    /// The most recent session for this client IP with activity inside the
    /// window is reused (refreshing its last-activity time); otherwise a new
    /// session is created.
    pub async fn start_stream(&self, client: SocketAddr, target: SocketAddr) -> StreamId {
        let (stream_id, session_id, session_created) = {
            let mut state = self.lock();
            let now = Instant::now();
            let ip = client.ip();

            let existing = state
                .sessions
                .values_mut()
                .filter(|s| s.client_ip == ip && now.duration_since(s.last_seen) <= self.window)
                .max_by_key(|s| s.last_seen);

            let (session_id, created) = match existing {
                Some(session) => {
                    session.last_seen = now;
                    (session.id, false)
                }
                None => {
                    state.next_session += 1;
                    let id = SessionId(state.next_session);
                    state.sessions.insert(
                        id,
                        SessionRecord {
                            id,
                            client_ip: ip,
                            started_at: Utc::now(),
                            alert: AlertLevel::None,
                            last_seen: now,
                        },
                    );
                    (id, true)
                }
            };

            state.next_stream += 1;
            let stream_id = StreamId(state.next_stream);
            state.streams.insert(
                stream_id,
                StreamRecord {
                    id: stream_id,
                    session: session_id,
                    client,
                    target,
                    opened_at: Utc::now(),
                    closed_at: None,
                    closed: false,
                },
            );
            (stream_id, session_id, created)
        };

        if session_created {
            self.emit(
                JournalRecord::new(
                    RecordKind::SessionOpened,
                    serde_json::json!({ "client_ip": client.ip().to_string() }),
                )
                .with_session(session_id),
            )
            .await;
        }
        self.emit(
            JournalRecord::new(
                RecordKind::StreamOpened,
                serde_json::json!({
                    "client": client.to_string(),
                    "target": target.to_string(),
                }),
            )
            .with_session(session_id)
            .with_stream(stream_id),
        )
        .await;

        stream_id
    }

    /// Mark a stream closed. Safe to call for an unknown id.
    pub async fn close_stream(&self, id: StreamId) {
        let session = {
            let mut state = self.lock();
            match state.streams.get_mut(&id) {
                Some(stream) => {
                    stream.closed = true;
                    stream.closed_at = Some(Utc::now());
                    Some(stream.session)
                }
                None => None,
            }
        };
        let Some(session) = session else {
            tracing::warn!(stream = id.0, "close_stream for unknown stream");
            return;
        };
        self.emit(
            JournalRecord::new(RecordKind::StreamClosed, serde_json::json!({}))
                .with_session(session)
                .with_stream(id),
        )
        .await;
    }

    /// Record a reconstructed request against a stream. A non-empty tag set
    /// raises the owning session's alert level to at least
    /// [`AlertLevel::Marked`].
    pub async fn log_request(&self, id: StreamId, request: &Request, tags: &[String]) {
        let session = self.session_of(id);
        let record = JournalRecord::new(
            RecordKind::Request,
            serde_json::json!({
                "method": request.method,
                "path": request.path,
                "version": request.version,
                "headers": &request.headers,
                "body": request.body_text(),
                "tags": tags,
            }),
        )
        .with_stream(id);
        self.emit(match session {
            Some(session) => record.with_session(session),
            None => record,
        })
        .await;

        if !tags.is_empty() {
            self.raise_alert_level(id, AlertLevel::Marked).await;
        }
    }

    /// Record a reconstructed response against a stream. Responses are never
    /// policy-evaluated; the tag slot exists for symmetry and is usually
    /// empty.
    pub async fn log_response(&self, id: StreamId, response: &Response, tags: &[String]) {
        let session = self.session_of(id);
        let record = JournalRecord::new(
            RecordKind::Response,
            serde_json::json!({
                "status": response.status,
                "version": response.version,
                "headers": &response.headers,
                "body": response.body_text(),
                "tags": tags,
            }),
        )
        .with_stream(id);
        self.emit(match session {
            Some(session) => record.with_session(session),
            None => record,
        })
        .await;

        if !tags.is_empty() {
            self.raise_alert_level(id, AlertLevel::Marked).await;
        }
    }

    /// Raise the alert level of the session owning `id`. Monotonic: a lower
    /// level than the stored one is a no-op.
    pub async fn raise_alert_level(&self, id: StreamId, level: AlertLevel) {
        let raised = {
            let mut state = self.lock();
            let Some(session_id) = state.streams.get(&id).map(|s| s.session) else {
                tracing::warn!(stream = id.0, "raise_alert_level for unknown stream");
                return;
            };
            match state.sessions.get_mut(&session_id) {
                Some(session) if level > session.alert => {
                    session.alert = level;
                    Some(session_id)
                }
                _ => None,
            }
        };
        let Some(session_id) = raised else {
            return;
        };
        self.emit(
            JournalRecord::new(
                RecordKind::AlertRaised,
                serde_json::json!({ "level": level.as_u8() }),
            )
            .with_session(session_id)
            .with_stream(id),
        )
        .await;
    }

    /// The session owning a stream, if the stream is known.
    pub fn session_of(&self, id: StreamId) -> Option<SessionId> {
        self.lock().streams.get(&id).map(|s| s.session)
    }

    /// Current alert level of a session.
    pub fn alert_level(&self, id: SessionId) -> Option<AlertLevel> {
        self.lock().sessions.get(&id).map(|s| s.alert)
    }

    /// Snapshot of one stream record.
    pub fn stream(&self, id: StreamId) -> Option<StreamRecord> {
        self.lock().streams.get(&id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn emit(&self, record: JournalRecord) {
        if let Some(journal) = &self.journal {
            journal.log(record).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str, port: u16) -> SocketAddr {
        format!("{ip}:{port}").parse().unwrap()
    }

    fn ledger(window_ms: u64) -> FlowLedger {
        FlowLedger::new(Duration::from_millis(window_ms))
    }

    #[tokio::test]
    async fn same_ip_within_window_reuses_the_session() {
        let ledger = ledger(10_000);
        let target = addr("127.0.0.1", 5000);

        let first = ledger.start_stream(addr("10.0.0.1", 40001), target).await;
        let second = ledger.start_stream(addr("10.0.0.1", 40002), target).await;

        assert_ne!(first, second);
        assert_eq!(ledger.session_of(first), ledger.session_of(second));
    }

    #[tokio::test]
    async fn expired_window_creates_a_new_session() {
        let ledger = ledger(100);
        let target = addr("127.0.0.1", 5000);

        let first = ledger.start_stream(addr("10.0.0.1", 40001), target).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        let second = ledger.start_stream(addr("10.0.0.1", 40002), target).await;

        assert_ne!(ledger.session_of(first), ledger.session_of(second));
    }

    #[tokio::test]
    async fn activity_refreshes_the_window() {
        let ledger = ledger(400);
        let target = addr("127.0.0.1", 5000);

        let first = ledger.start_stream(addr("10.0.0.1", 40001), target).await;
        // Keep touching the session at intervals shorter than the window;
        // the cumulative time exceeds it but the session must survive.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let next = ledger.start_stream(addr("10.0.0.1", 40002), target).await;
            assert_eq!(ledger.session_of(first), ledger.session_of(next));
        }
    }

    #[tokio::test]
    async fn different_ips_get_different_sessions() {
        let ledger = ledger(10_000);
        let target = addr("127.0.0.1", 5000);

        let first = ledger.start_stream(addr("10.0.0.1", 40001), target).await;
        let second = ledger.start_stream(addr("10.0.0.2", 40001), target).await;

        assert_ne!(ledger.session_of(first), ledger.session_of(second));
    }

    #[tokio::test]
    async fn alert_level_is_monotonic() {
        let ledger = ledger(10_000);
        let stream = ledger
            .start_stream(addr("10.0.0.1", 40001), addr("127.0.0.1", 5000))
            .await;
        let session = ledger.session_of(stream).unwrap();

        assert_eq!(ledger.alert_level(session), Some(AlertLevel::None));

        ledger.raise_alert_level(stream, AlertLevel::Blocked).await;
        assert_eq!(ledger.alert_level(session), Some(AlertLevel::Blocked));

        // Raising to a lower level never decreases the stored value.
        ledger.raise_alert_level(stream, AlertLevel::Marked).await;
        assert_eq!(ledger.alert_level(session), Some(AlertLevel::Blocked));
    }

    #[tokio::test]
    async fn tagged_request_escalates_to_marked() {
        let ledger = ledger(10_000);
        let stream = ledger
            .start_stream(addr("10.0.0.1", 40001), addr("127.0.0.1", 5000))
            .await;
        let session = ledger.session_of(stream).unwrap();

        let request = Request::default();
        ledger.log_request(stream, &request, &[]).await;
        assert_eq!(ledger.alert_level(session), Some(AlertLevel::None));

        ledger
            .log_request(stream, &request, &["api".to_string()])
            .await;
        assert_eq!(ledger.alert_level(session), Some(AlertLevel::Marked));
    }

    #[tokio::test]
    async fn close_stream_marks_the_record() {
        let ledger = ledger(10_000);
        let stream = ledger
            .start_stream(addr("10.0.0.1", 40001), addr("127.0.0.1", 5000))
            .await;

        assert!(!ledger.stream(stream).unwrap().closed);
        ledger.close_stream(stream).await;

        let record = ledger.stream(stream).unwrap();
        assert!(record.closed);
        assert!(record.closed_at.is_some());
    }

    #[tokio::test]
    async fn unknown_stream_ids_are_tolerated() {
        let ledger = ledger(10_000);
        // None of these should panic or create records.
        ledger.close_stream(StreamId(99)).await;
        ledger.raise_alert_level(StreamId(99), AlertLevel::Blocked).await;
        ledger.log_request(StreamId(99), &Request::default(), &[]).await;
        assert_eq!(ledger.session_of(StreamId(99)), None);
    }
}
