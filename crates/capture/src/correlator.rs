//! Session correlator.
//!
//! Sessions are correlated in memory from their start notification until
//! they reach a terminal status, at which point the full record is written
//! through the ingestion pipeline and the entry is removed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use ct_domain::error::Error;
use ct_domain::source::{SessionStart, SessionStatus};
use ct_domain::storage::SessionRecord;
use ct_domain::trace::TraceEvent;

use crate::pipeline::{IngestOutcome, IngestionPipeline};

fn rank(status: SessionStatus) -> u8 {
    match status {
        SessionStatus::Pending => 0,
        SessionStatus::Connecting => 1,
        SessionStatus::InProgress => 2,
        SessionStatus::Ended | SessionStatus::Rejected | SessionStatus::Missed => 3,
    }
}

/// Whether a session may move from `from` to `to`. Statuses only move
/// forward; any non-terminal status may end directly.
pub fn session_transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    !from.is_terminal() && rank(to) > rank(from)
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Updated(SessionStatus),
    /// Terminal status reached; the record was handed to the pipeline.
    Flushed(SessionRecord),
    /// Transition not allowed from the current status; nothing changed.
    Ignored,
    UnknownSession,
}

/// How many finished session ids are remembered to reject replayed starts.
const RECENTLY_FINISHED: usize = 1_024;

#[derive(Default)]
struct Finished {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl Finished {
    fn remember(&mut self, session_id: &str) {
        if !self.ids.insert(session_id.to_owned()) {
            return;
        }
        self.order.push_back(session_id.to_owned());
        if self.order.len() > RECENTLY_FINISHED {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

pub struct SessionCorrelator {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    finished: Mutex<Finished>,
    pipeline: Arc<IngestionPipeline>,
}

impl SessionCorrelator {
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            finished: Mutex::new(Finished::default()),
            pipeline,
        }
    }

    /// Create a `pending` entry. A repeated start for a live or recently
    /// finished session is a no-op. Returns whether an entry was created.
    pub fn start(&self, start: &SessionStart) -> bool {
        if self.finished.lock().ids.contains(&start.session_id) {
            tracing::debug!(session_id = %start.session_id, "start for finished session ignored");
            return false;
        }
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&start.session_id) {
            tracing::debug!(session_id = %start.session_id, "duplicate session start ignored");
            return false;
        }
        sessions.insert(
            start.session_id.clone(),
            SessionRecord {
                session_id: start.session_id.clone(),
                channel_id: start.channel_id.clone(),
                initiator_id: start.initiator_id.clone(),
                counterpart_id: start.counterpart_id.clone(),
                media: start.media,
                status: SessionStatus::Pending,
                started_at_ms: start.started_at_ms,
                ended_at_ms: None,
                duration_ms: None,
            },
        );
        tracing::debug!(session_id = %start.session_id, channel_id = %start.channel_id, "session started");
        true
    }

    pub async fn update(&self, session_id: &str, status: SessionStatus, at_ms: i64) -> SessionUpdate {
        let finished = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(session_id) else {
                let err = Error::UnknownSession(session_id.to_owned());
                tracing::warn!(session_id, status = %status, error = %err, "state change for unknown session dropped");
                return SessionUpdate::UnknownSession;
            };

            if !session_transition_allowed(session.status, status) {
                tracing::debug!(
                    session_id,
                    from = %session.status,
                    to = %status,
                    "session transition ignored"
                );
                return SessionUpdate::Ignored;
            }

            session.status = status;
            if !status.is_terminal() {
                return SessionUpdate::Updated(status);
            }

            session.ended_at_ms = Some(at_ms);
            session.duration_ms = Some(at_ms.saturating_sub(session.started_at_ms).max(0));
            self.finished.lock().remember(session_id);
            sessions.remove(session_id)
        };

        let Some(record) = finished else {
            return SessionUpdate::Ignored;
        };
        if self.pipeline.ingest_session(&record).await == IngestOutcome::Dropped {
            tracing::error!(session_id, "session record lost: raw append failed");
        }
        TraceEvent::SessionFlushed {
            session_id: record.session_id.clone(),
            status: record.status.as_str().to_owned(),
            duration_ms: record.duration_ms,
        }
        .emit();
        SessionUpdate::Flushed(record)
    }

    pub fn active(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.lock().get(session_id).cloned()
    }
}
