use std::{mem, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

pub mod config;
pub mod engine;
pub mod error;
pub mod initiator;
pub mod projector;
pub mod simulator;
pub mod transport;

pub use config::{load_settings, ClientSettings, ProducerMode};
pub use engine::{fold, Failure, FailureKind, Outcome, Phase, SessionInput, SessionState};
pub use error::{ClientError, Result};
pub use initiator::{SessionInitiator, SessionProducer};
pub use projector::{project, RenderModel, SlotView, StageView};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    PhaseChanged { from: Phase, to: Phase },
    ViewUpdated(Box<RenderModel>),
    Error(String),
}

#[derive(Default)]
struct Tracked {
    generation: u64,
    state: SessionState,
}

struct ActiveSession {
    generation: u64,
    task: JoinHandle<()>,
}

/// Owns at most one analysis session and republishes its view to subscribers.
pub struct AnalysisClient {
    initiator: SessionInitiator,
    idle_timeout: Duration,
    tracked: RwLock<Tracked>,
    active: Mutex<Option<ActiveSession>>,
    events: broadcast::Sender<ClientEvent>,
}

impl AnalysisClient {
    pub fn new(initiator: SessionInitiator, idle_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            initiator,
            idle_timeout,
            tracked: RwLock::new(Tracked::default()),
            active: Mutex::new(None),
            events,
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self> {
        Ok(Self::new(
            SessionInitiator::from_settings(settings)?,
            settings.idle_timeout,
        ))
    }

    pub fn mode(&self) -> ProducerMode {
        self.initiator.mode()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn view(&self) -> RenderModel {
        project(&self.tracked.read().await.state)
    }

    pub async fn snapshot(&self) -> SessionState {
        self.tracked.read().await.state.clone()
    }

    /// Starts a session for `topic`, tearing down any session already in flight.
    pub async fn submit_topic(self: &Arc<Self>, topic: &str) -> Result<()> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ClientError::InvalidTopic);
        }

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!(generation = previous.generation, "client: tearing down previous session");
            previous.task.abort();
        }

        let (generation, from, model) = {
            let mut tracked = self.tracked.write().await;
            tracked.generation += 1;
            let from = tracked.state.phase();
            tracked.state = fold(
                SessionState::default(),
                SessionInput::Initiate {
                    topic: topic.to_string(),
                },
                Utc::now(),
            );
            (tracked.generation, from, project(&tracked.state))
        };
        info!(generation, topic, "client: session submitted");
        self.publish(from, model);

        let client = Arc::clone(self);
        let task = tokio::spawn(client.drive(generation, topic.to_string()));
        *active = Some(ActiveSession { generation, task });
        Ok(())
    }

    /// Tears down the active session, if any, and returns to `Idle`.
    pub async fn cancel(&self) {
        let mut active = self.active.lock().await;
        let Some(previous) = active.take() else {
            return;
        };
        previous.task.abort();

        let (from, model) = {
            let mut tracked = self.tracked.write().await;
            tracked.generation += 1;
            let from = tracked.state.phase();
            tracked.state = SessionState::default();
            (from, project(&tracked.state))
        };
        info!(generation = previous.generation, "client: session cancelled");
        self.publish(from, model);
    }

    /// Resolves once the current session terminates. `None` if no session is running.
    pub async fn wait_for_outcome(&self) -> Option<Outcome> {
        let mut rx = self.events.subscribe();
        loop {
            {
                let tracked = self.tracked.read().await;
                match tracked.state.phase() {
                    Phase::Idle => return None,
                    phase if phase.is_terminal() => return tracked.state.outcome().cloned(),
                    _ => {}
                }
            }
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn drive(self: Arc<Self>, generation: u64, topic: String) {
        let session_id = match self.initiator.initiate(&topic).await {
            Ok(session_id) => session_id,
            Err(err) => {
                self.apply(generation, SessionInput::InitiationFailed(err.to_string()))
                    .await;
                return;
            }
        };
        if !self
            .apply(generation, SessionInput::SessionAssigned(session_id.clone()))
            .await
        {
            return;
        }

        let mut source = match self.initiator.connect(&session_id).await {
            Ok(source) => source,
            Err(err) => {
                self.apply(generation, SessionInput::TransportError(err.to_string()))
                    .await;
                return;
            }
        };

        loop {
            let input = match timeout(self.idle_timeout, source.next()).await {
                Ok(Some(signal)) => signal.into(),
                Ok(None) => SessionInput::TransportClosed,
                Err(_) => SessionInput::IdleTimeout(self.idle_timeout),
            };
            if !self.apply(generation, input).await {
                break;
            }
        }
        debug!(%session_id, generation, "client: session loop finished");
    }

    /// Folds `input` into the tracked state. Returns whether the session should keep running.
    async fn apply(&self, generation: u64, input: SessionInput) -> bool {
        let (from, model) = {
            let mut tracked = self.tracked.write().await;
            if tracked.generation != generation {
                debug!(
                    generation,
                    current = tracked.generation,
                    input = input.kind(),
                    "client: dropping input from superseded session"
                );
                return false;
            }
            let from = tracked.state.phase();
            let state = mem::take(&mut tracked.state);
            tracked.state = fold(state, input, Utc::now());
            (from, project(&tracked.state))
        };
        let keep_running = !model.is_terminal();
        self.publish(from, model);
        keep_running
    }

    fn publish(&self, from: Phase, model: RenderModel) {
        let to = model.phase;
        if from != to {
            debug!(?from, ?to, "client: phase changed");
            let _ = self.events.send(ClientEvent::PhaseChanged { from, to });
        }
        let failure = match (&model.outcome, from != to) {
            (Some(Outcome::Failure(failure)), true) => Some(failure.message.clone()),
            _ => None,
        };
        let _ = self.events.send(ClientEvent::ViewUpdated(Box::new(model)));
        if let Some(message) = failure {
            warn!(%message, "client: session failed");
            let _ = self.events.send(ClientEvent::Error(message));
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
