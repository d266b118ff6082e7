//! Offline producer that replays the stream grammar from a fixture at a fixed pace.

use std::{fs, path::Path, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{
        format_step_name, Evidence, Perspective, RatedStrength, SessionId, ANALYSIS_STEPS,
        TERMINAL_STEP_NAME,
    },
    protocol::{FinalResult, PartialResult, StreamFrame},
};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::SimulationSettings,
    error::{ClientError, Result},
    initiator::SessionProducer,
    transport::{EventSource, TransportSignal},
};

const MIN_TICK: Duration = Duration::from_millis(1);

/// How the simulated stream reaches its terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureShape {
    /// Cardinality hint, one frame per perspective, summary tokens, then a terminal status.
    #[default]
    Incremental,
    /// Stage statuses followed directly by the final snapshot.
    SnapshotOnly,
}

impl std::str::FromStr for FixtureShape {
    type Err = ClientError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "incremental" => Ok(Self::Incremental),
            "snapshot_only" | "snapshot" => Ok(Self::SnapshotOnly),
            other => Err(ClientError::Config(format!(
                "unknown simulation shape {other:?}; expected incremental or snapshot_only"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub topic: String,
    #[serde(rename = "overallSummary", alias = "summary")]
    pub overall_summary: String,
    pub perspectives: Vec<Perspective>,
    #[serde(default, rename = "articlesFound", alias = "articles_found")]
    pub articles_found: u64,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| ClientError::Fixture(format!("failed to read {}: {err}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|err| ClientError::Fixture(format!("failed to parse {}: {err}", path.display())))
    }

    pub fn builtin() -> Self {
        let perspectives = vec![
            builtin_perspective(
                "carbon-pricing",
                "Market-Based Carbon Pricing",
                "Putting a price on emissions lets markets find the cheapest reductions.",
                4.0,
                &[
                    "Cap-and-trade cut sulphur dioxide emissions faster than forecast.",
                    "Revenue recycling can offset household costs.",
                ],
                &["Economically efficient", "Technology neutral"],
                &["Politically fragile price levels"],
            ),
            builtin_perspective(
                "green-industrial",
                "Green Industrial Policy",
                "Public investment and subsidies build clean industries and jobs directly.",
                3.5,
                &[
                    "Subsidised solar manufacturing drove module prices down sharply.",
                    "Targeted grants crowd in private capital.",
                ],
                &["Creates visible local benefits"],
                &["Risk of picking losers", "Fiscal cost"],
            ),
            builtin_perspective(
                "climate-justice",
                "Climate Justice",
                "Policy should prioritise the communities most exposed to climate harm.",
                3.0,
                &["Low-income households spend a larger share of income on energy."],
                &["Centres equity"],
                &["Harder to quantify outcomes"],
            ),
        ];
        Self {
            topic: "Climate policy".to_string(),
            overall_summary: "Debate centres on whether markets, public investment or equity-first \
                              measures should lead the transition."
                .to_string(),
            perspectives,
            articles_found: 12,
        }
    }
}

fn builtin_perspective(
    id: &str,
    title: &str,
    narrative: &str,
    strength: f64,
    evidence: &[&str],
    strengths: &[&str],
    weaknesses: &[&str],
) -> Perspective {
    let mut perspective = Perspective::new(title).with_id(id);
    perspective.narrative_summary = narrative.to_string();
    perspective.rated_strength = Some(RatedStrength::from(strength));
    perspective.evidence = evidence
        .iter()
        .enumerate()
        .map(|(index, statement)| Evidence::Structured {
            id: Some(format!("{id}-evidence-{index}")),
            statement: statement.to_string(),
            source: None,
        })
        .collect();
    perspective.strengths = Some(strengths.iter().map(|s| s.to_string()).collect());
    perspective.weaknesses = Some(weaknesses.iter().map(|s| s.to_string()).collect());
    perspective
}

/// The full, deterministic frame sequence for `fixture`.
pub fn script(fixture: &Fixture, shape: FixtureShape) -> Vec<StreamFrame> {
    let status = |message: String, step_name: Option<&str>| StreamFrame::Status {
        message,
        step_name: step_name.map(str::to_string),
    };

    let mut frames = vec![status(
        format!("Starting analysis for topic: '{}'", fixture.topic),
        None,
    )];
    for (index, stage) in ANALYSIS_STEPS.iter().enumerate() {
        if index == 0 {
            frames.push(status("Current iteration: 1".to_string(), None));
            frames.push(status(
                format!("Articles found: {}", fixture.articles_found),
                None,
            ));
        }
        frames.push(status(
            format!("Completed step: {}", format_step_name(stage)),
            Some(*stage),
        ));
    }

    match shape {
        FixtureShape::Incremental => {
            frames.push(StreamFrame::PartialResult {
                data: PartialResult::ClusterCount {
                    count: fixture.perspectives.len(),
                },
            });
            frames.extend(fixture.perspectives.iter().cloned().map(|perspective| {
                StreamFrame::PartialResult {
                    data: PartialResult::Perspective { perspective },
                }
            }));
            frames.extend(
                fixture
                    .overall_summary
                    .split_inclusive(' ')
                    .map(|token| StreamFrame::SummaryToken {
                        token: token.to_string(),
                    }),
            );
            frames.push(status(
                "Analysis complete!".to_string(),
                Some(TERMINAL_STEP_NAME),
            ));
        }
        FixtureShape::SnapshotOnly => {
            frames.push(status("Analysis complete!".to_string(), None));
            frames.push(StreamFrame::FinalResult {
                data: FinalResult {
                    topic: fixture.topic.clone(),
                    overall_summary: fixture.overall_summary.clone(),
                    perspectives: fixture.perspectives.clone(),
                },
            });
        }
    }
    frames.push(StreamFrame::EndOfStream);
    frames
}

/// Emits `script(fixture, shape)` one frame per `tick`.
pub fn simulate(fixture: &Fixture, shape: FixtureShape, tick: Duration) -> EventSource {
    let frames = script(fixture, shape);
    let tick = tick.max(MIN_TICK);
    EventSource::spawn(move |tx| async move {
        if tx.send(TransportSignal::Opened).await.is_err() {
            return;
        }
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        for frame in frames {
            ticker.tick().await;
            debug!(kind = frame.kind(), "simulator: emitting frame");
            if tx.send(TransportSignal::Frame(frame)).await.is_err() {
                return;
            }
        }
        let _ = tx.send(TransportSignal::Closed).await;
    })
}

pub struct SimulatedProducer {
    fixture: Fixture,
    shape: FixtureShape,
    tick: Duration,
}

impl SimulatedProducer {
    pub fn new(fixture: Fixture, shape: FixtureShape, tick: Duration) -> Self {
        Self {
            fixture,
            shape,
            tick,
        }
    }

    pub fn from_settings(settings: &SimulationSettings) -> Result<Self> {
        let fixture = match &settings.fixture_path {
            Some(path) => Fixture::load(path)?,
            None => Fixture::builtin(),
        };
        Ok(Self::new(fixture, settings.shape, settings.tick))
    }

    pub fn fixture(&self) -> &Fixture {
        &self.fixture
    }
}

#[async_trait]
impl SessionProducer for SimulatedProducer {
    async fn initiate(&self, topic: &str) -> Result<SessionId> {
        let session_id = SessionId(format!("sim-{}", Uuid::new_v4()));
        info!(%session_id, topic, fixture_topic = %self.fixture.topic, "simulator: session created");
        Ok(session_id)
    }

    async fn connect(&self, session_id: &SessionId) -> Result<EventSource> {
        debug!(%session_id, shape = ?self.shape, "simulator: streaming fixture");
        Ok(simulate(&self.fixture, self.shape, self.tick))
    }
}

#[cfg(test)]
#[path = "tests/simulator_tests.rs"]
mod tests;
