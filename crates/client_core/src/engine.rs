//! Reconciliation of one analysis session's inputs into a consistent view-state.
//!
//! [`fold`] applies a single [`SessionInput`] to an owned [`SessionState`] and returns the
//! next state. It performs no I/O, so the whole state machine can be exercised without a
//! live channel. Once a session reaches [`Phase::Completed`] or [`Phase::Failed`] every
//! further input is logged and dropped, leaving the state untouched.

use std::{sync::OnceLock, time::Duration};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use shared::{
    domain::{Perspective, Report, SessionId, ANALYSIS_STEPS, TERMINAL_STEP_NAME},
    protocol::{FinalResult, PartialResult, StreamFrame},
};
use tracing::{debug, info, warn};

/// Upper bound on placeholder slots a cardinality hint may open.
pub const MAX_EXPECTED_COUNT: usize = 256;
/// Status messages retained per session; older ones are dropped first.
pub const STATUS_LOG_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Initiating,
    Streaming,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted,
    Current,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAdvance {
    Advanced,
    Stale,
    Unknown,
}

/// Ordered, fixed list of stages plus how many leading stages are done.
///
/// The stage at index `completed` (if any) is the current one. `completed` only grows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProgress {
    stages: Vec<String>,
    completed: usize,
}

impl StepProgress {
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stages: stages.into_iter().map(Into::into).collect(),
            completed: 0,
        }
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn current_index(&self) -> Option<usize> {
        (self.completed < self.stages.len()).then_some(self.completed)
    }

    pub fn status(&self, index: usize) -> StageStatus {
        if index < self.completed {
            StageStatus::Done
        } else if index == self.completed {
            StageStatus::Current
        } else {
            StageStatus::NotStarted
        }
    }

    /// Marks `step_name` and every stage before it done, unless that would move backwards.
    pub fn mark_done(&mut self, step_name: &str) -> StageAdvance {
        let Some(index) = self.stages.iter().position(|stage| stage == step_name) else {
            return StageAdvance::Unknown;
        };
        if index < self.completed {
            return StageAdvance::Stale;
        }
        self.completed = index + 1;
        StageAdvance::Advanced
    }

    pub fn complete_all(&mut self) {
        self.completed = self.stages.len();
    }
}

impl Default for StepProgress {
    fn default() -> Self {
        Self::new(ANALYSIS_STEPS.iter().copied())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Empty,
    Filled(Perspective),
}

impl Slot {
    pub fn perspective(&self) -> Option<&Perspective> {
        match self {
            Slot::Empty => None,
            Slot::Filled(perspective) => Some(perspective),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Initiation,
    Transport,
    Application,
    AbnormalClose,
    IdleTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Report(Report),
    Failure(Failure),
}

/// Everything the engine can be told about a session, from any producer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Initiate { topic: String },
    SessionAssigned(SessionId),
    InitiationFailed(String),
    Frame(StreamFrame),
    TransportOpened,
    TransportError(String),
    TransportClosed,
    IdleTimeout(Duration),
}

impl SessionInput {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionInput::Initiate { .. } => "initiate",
            SessionInput::SessionAssigned(_) => "session_assigned",
            SessionInput::InitiationFailed(_) => "initiation_failed",
            SessionInput::Frame(frame) => frame.kind(),
            SessionInput::TransportOpened => "transport_opened",
            SessionInput::TransportError(_) => "transport_error",
            SessionInput::TransportClosed => "transport_closed",
            SessionInput::IdleTimeout(_) => "idle_timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    session_id: Option<SessionId>,
    topic: Option<String>,
    phase: Phase,
    created_at: Option<DateTime<Utc>>,
    steps: StepProgress,
    expected_count: Option<usize>,
    slots: Vec<Slot>,
    summary: Option<String>,
    status_log: Vec<String>,
    iteration: Option<u64>,
    articles_found: Option<u64>,
    outcome: Option<Outcome>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(StepProgress::default())
    }
}

impl SessionState {
    pub fn new(steps: StepProgress) -> Self {
        Self {
            session_id: None,
            topic: None,
            phase: Phase::Idle,
            created_at: None,
            steps,
            expected_count: None,
            slots: Vec::new(),
            summary: None,
            status_log: Vec::new(),
            iteration: None,
            articles_found: None,
            outcome: None,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn steps(&self) -> &StepProgress {
        &self.steps
    }

    pub fn expected_count(&self) -> Option<usize> {
        self.expected_count
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// The most recent status messages, oldest first.
    pub fn status_log(&self) -> &[String] {
        &self.status_log
    }

    pub fn latest_status(&self) -> Option<&str> {
        self.status_log.last().map(String::as_str)
    }

    pub fn iteration(&self) -> Option<u64> {
        self.iteration
    }

    pub fn articles_found(&self) -> Option<u64> {
        self.articles_found
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }
}

pub fn fold(mut state: SessionState, input: SessionInput, at: DateTime<Utc>) -> SessionState {
    if state.phase.is_terminal() {
        debug!(
            phase = ?state.phase,
            input = input.kind(),
            "session: ignoring input after termination"
        );
        return state;
    }

    match (state.phase, input) {
        (Phase::Idle, SessionInput::Initiate { topic }) => {
            state.topic = Some(topic);
            state.created_at = Some(at);
            state.phase = Phase::Initiating;
        }
        (Phase::Initiating, SessionInput::SessionAssigned(session_id)) => {
            info!(%session_id, "session: streaming");
            state.session_id = Some(session_id);
            state.phase = Phase::Streaming;
        }
        (Phase::Initiating, SessionInput::InitiationFailed(message)) => {
            fail(&mut state, FailureKind::Initiation, message);
        }
        (Phase::Streaming, SessionInput::Frame(frame)) => apply_frame(&mut state, frame, at),
        (Phase::Streaming, SessionInput::TransportOpened) => {
            debug!(session_id = ?state.session_id, "session: transport opened");
        }
        (Phase::Streaming, SessionInput::TransportError(detail)) => {
            fail(&mut state, FailureKind::Transport, detail);
        }
        (Phase::Streaming, SessionInput::TransportClosed) => {
            fail(
                &mut state,
                FailureKind::AbnormalClose,
                "connection closed before a final result was received",
            );
        }
        (Phase::Streaming, SessionInput::IdleTimeout(window)) => {
            fail(
                &mut state,
                FailureKind::IdleTimeout,
                format!("no event received within {}s", window.as_secs()),
            );
        }
        (phase, input) => {
            warn!(?phase, input = input.kind(), "session: input not valid in phase; ignored");
        }
    }

    state
}

fn apply_frame(state: &mut SessionState, frame: StreamFrame, at: DateTime<Utc>) {
    match frame {
        StreamFrame::Status { message, step_name } => {
            if !message.is_empty() {
                record_status(state, message);
            }
            if let Some(step_name) = step_name {
                apply_stage_completed(state, &step_name, at);
            }
        }
        StreamFrame::SummaryToken { token } => {
            if !token.is_empty() {
                state
                    .summary
                    .get_or_insert_with(String::new)
                    .push_str(&token);
            }
        }
        StreamFrame::PartialResult { data } => match data {
            PartialResult::Summary { content } => state.summary = Some(content),
            PartialResult::ClusterCount { count } => apply_cardinality(state, count),
            PartialResult::Perspective { perspective } => upsert_perspective(state, perspective),
        },
        StreamFrame::FinalResult { data } => complete_with_snapshot(state, data, at),
        StreamFrame::Error { message } => {
            let message = if message.is_empty() {
                "the analysis backend reported an unspecified error".to_string()
            } else {
                message
            };
            fail(state, FailureKind::Application, message);
        }
        StreamFrame::EndOfStream => {
            fail(
                state,
                FailureKind::AbnormalClose,
                "stream ended without a final result",
            );
        }
    }
}

fn iteration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Also matches the backend's "Current iteration: n".
    PATTERN.get_or_init(|| Regex::new(r"(?i)\biteration:\s*(\d+)").expect("iteration pattern"))
}

fn articles_found_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\barticles found:\s*(\d+)").expect("articles found pattern")
    })
}

fn capture_count(pattern: &Regex, message: &str) -> Option<u64> {
    pattern
        .captures(message)
        .and_then(|captures| captures.get(1))
        .and_then(|value| value.as_str().parse().ok())
}

/// `(iteration, articles_found)` mentioned in one status message.
pub fn status_counters(message: &str) -> (Option<u64>, Option<u64>) {
    (
        capture_count(iteration_pattern(), message),
        capture_count(articles_found_pattern(), message),
    )
}

fn record_status(state: &mut SessionState, message: String) {
    let (iteration, articles_found) = status_counters(&message);
    if iteration.is_some() {
        state.iteration = iteration;
    }
    if articles_found.is_some() {
        state.articles_found = articles_found;
    }
    if state.status_log.len() >= STATUS_LOG_LIMIT {
        let excess = state.status_log.len() + 1 - STATUS_LOG_LIMIT;
        state.status_log.drain(..excess);
    }
    state.status_log.push(message);
}

fn apply_stage_completed(state: &mut SessionState, step_name: &str, at: DateTime<Utc>) {
    if step_name == TERMINAL_STEP_NAME {
        complete_from_accumulated(state, at);
        return;
    }
    match state.steps.mark_done(step_name) {
        StageAdvance::Advanced => {
            debug!(step_name, completed = state.steps.completed(), "session: stage done");
        }
        StageAdvance::Stale => {
            debug!(step_name, "session: ignoring late stage completion");
        }
        StageAdvance::Unknown => {
            warn!(step_name, "session: ignoring completion for undeclared stage");
        }
    }
}

fn apply_cardinality(state: &mut SessionState, count: usize) {
    if let Some(expected) = state.expected_count {
        debug!(expected, count, "session: cardinality already set; ignoring hint");
        return;
    }
    let count = if count > MAX_EXPECTED_COUNT {
        warn!(count, max = MAX_EXPECTED_COUNT, "session: clamping oversized cardinality hint");
        MAX_EXPECTED_COUNT
    } else {
        count
    };
    state.expected_count = Some(count);
    if state.slots.len() < count {
        state.slots.resize(count, Slot::Empty);
    }
}

/// Two perspectives with ids are the same entity only when the ids agree; the
/// title stands in for identity whenever either side lacks an id.
fn same_identity(existing: &Perspective, incoming: &Perspective) -> bool {
    match (&existing.id, &incoming.id) {
        (Some(existing_id), Some(incoming_id)) => existing_id == incoming_id,
        _ => existing.title == incoming.title,
    }
}

fn upsert_perspective(state: &mut SessionState, mut perspective: Perspective) {
    let by_id = perspective.id.as_ref().and_then(|id| {
        state
            .slots
            .iter()
            .position(|slot| slot.perspective().and_then(|p| p.id.as_ref()) == Some(id))
    });
    let matched = by_id.or_else(|| {
        let by_title = state.slots.iter().position(|slot| {
            slot.perspective()
                .is_some_and(|existing| same_identity(existing, &perspective))
        });
        if by_title.is_some() {
            debug!(title = %perspective.title, "session: perspective matched by title");
        }
        by_title
    });

    let Some(index) = matched else {
        match state.slots.iter().position(Slot::is_empty) {
            Some(index) => state.slots[index] = Slot::Filled(perspective),
            None => state.slots.push(Slot::Filled(perspective)),
        }
        return;
    };

    if perspective.id.is_none() {
        perspective.id = state.slots[index].perspective().and_then(|p| p.id.clone());
    }
    state.slots[index] = Slot::Filled(perspective);
    merge_title_duplicates(state, index);
}

/// Drops id-less entries that now resolve to the slot at `index`.
fn merge_title_duplicates(state: &mut SessionState, index: usize) {
    let Some(title) = state.slots[index].perspective().map(|p| p.title.clone()) else {
        return;
    };
    let before = state.slots.len();
    let mut position = 0;
    state.slots.retain(|slot| {
        let current = position;
        position += 1;
        current == index
            || !slot
                .perspective()
                .is_some_and(|p| p.id.is_none() && p.title == title)
    });
    if state.slots.len() < before {
        debug!(%title, merged = before - state.slots.len(), "session: merged title duplicates");
        let expected = state.expected_count.unwrap_or(0);
        if state.slots.len() < expected {
            state.slots.resize(expected, Slot::Empty);
        }
    }
}

fn complete_with_snapshot(state: &mut SessionState, data: FinalResult, at: DateTime<Utc>) {
    let FinalResult {
        topic,
        overall_summary,
        perspectives,
    } = data;
    if let Some(submitted) = state.topic.as_deref() {
        if !topic.is_empty() && topic != submitted {
            warn!(%submitted, snapshot = %topic, "session: final result topic differs from submitted topic");
        }
    }
    let topic = if topic.is_empty() {
        state.topic.clone().unwrap_or_default()
    } else {
        topic
    };

    state.expected_count = Some(perspectives.len());
    state.slots = perspectives.iter().cloned().map(Slot::Filled).collect();
    state.summary = Some(overall_summary.clone());
    complete(
        state,
        Report {
            topic,
            overall_summary,
            perspectives,
            completed_at: at,
        },
    );
}

fn complete_from_accumulated(state: &mut SessionState, at: DateTime<Utc>) {
    let perspectives: Vec<Perspective> = state
        .slots
        .iter()
        .filter_map(Slot::perspective)
        .cloned()
        .collect();
    state.expected_count = Some(perspectives.len());
    state.slots = perspectives.iter().cloned().map(Slot::Filled).collect();
    let report = Report {
        topic: state.topic.clone().unwrap_or_default(),
        overall_summary: state.summary.clone().unwrap_or_default(),
        perspectives,
        completed_at: at,
    };
    complete(state, report);
}

fn complete(state: &mut SessionState, report: Report) {
    info!(
        session_id = ?state.session_id,
        perspectives = report.perspectives.len(),
        "session: completed"
    );
    state.steps.complete_all();
    state.outcome = Some(Outcome::Report(report));
    state.phase = Phase::Completed;
}

fn fail(state: &mut SessionState, kind: FailureKind, message: impl Into<String>) {
    let message = message.into();
    warn!(session_id = ?state.session_id, ?kind, %message, "session: failed");
    state.outcome = Some(Outcome::Failure(Failure { kind, message }));
    state.phase = Phase::Failed;
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
