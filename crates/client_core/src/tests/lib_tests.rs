use super::*;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::{
    domain::{Perspective, SessionId},
    protocol::{FinalResult, PartialResult, StreamFrame},
};
use tokio::net::TcpListener;

use crate::transport::{EventSource, TransportSignal};

#[derive(Clone)]
struct Script {
    signals: Vec<TransportSignal>,
    hold_open: bool,
}

#[derive(Default)]
struct ScriptedProducer {
    scripts: HashMap<String, Script>,
    reject_with: Option<String>,
    initiated: AtomicUsize,
    active_streams: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

impl ScriptedProducer {
    fn with_script(mut self, topic: &str, signals: Vec<TransportSignal>, hold_open: bool) -> Self {
        self.scripts.insert(
            topic.to_string(),
            Script {
                signals,
                hold_open,
            },
        );
        self
    }
}

struct StreamGuard {
    active: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.released.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionProducer for ScriptedProducer {
    async fn initiate(&self, topic: &str) -> Result<SessionId> {
        self.initiated.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.reject_with {
            return Err(ClientError::Initiation(message.clone()));
        }
        Ok(SessionId(topic.to_ascii_lowercase().replace(' ', "-")))
    }

    async fn connect(&self, session_id: &SessionId) -> Result<EventSource> {
        let script = self
            .scripts
            .iter()
            .find(|(topic, _)| topic.to_ascii_lowercase().replace(' ', "-") == session_id.as_str())
            .map(|(_, script)| script.clone())
            .ok_or_else(|| ClientError::Transport(format!("no script for {session_id}")))?;
        self.active_streams.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard {
            active: Arc::clone(&self.active_streams),
            released: Arc::clone(&self.released),
        };
        Ok(EventSource::spawn(move |tx| async move {
            let _guard = guard;
            for signal in script.signals {
                if tx.send(signal).await.is_err() {
                    return;
                }
            }
            if script.hold_open {
                std::future::pending::<()>().await;
            }
        }))
    }
}

fn frame(frame: StreamFrame) -> TransportSignal {
    TransportSignal::Frame(frame)
}

fn stage(step_name: &str) -> TransportSignal {
    frame(StreamFrame::Status {
        message: format!("Completed step: {step_name}"),
        step_name: Some(step_name.to_string()),
    })
}

fn cluster_count(count: usize) -> TransportSignal {
    frame(StreamFrame::PartialResult {
        data: PartialResult::ClusterCount { count },
    })
}

fn arrival(perspective: &Perspective) -> TransportSignal {
    frame(StreamFrame::PartialResult {
        data: PartialResult::Perspective {
            perspective: perspective.clone(),
        },
    })
}

fn client_with(producer: ScriptedProducer, idle_timeout: Duration) -> (Arc<AnalysisClient>, Arc<ScriptedProducer>) {
    let producer = Arc::new(producer);
    let initiator = SessionInitiator::with_producer(
        Arc::clone(&producer) as Arc<dyn SessionProducer>,
        ProducerMode::Simulated,
    );
    (
        Arc::new(AnalysisClient::new(initiator, idle_timeout)),
        producer,
    )
}

async fn outcome_of(client: &AnalysisClient) -> Option<Outcome> {
    tokio::time::timeout(Duration::from_secs(5), client.wait_for_outcome())
        .await
        .expect("outcome before timeout")
}

fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn phase_changes(events: &[ClientEvent]) -> Vec<(Phase, Phase)> {
    events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::PhaseChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn snapshot_completes_session_and_publishes_transitions() {
    let a = Perspective::new("A").with_id("a");
    let b = Perspective::new("B").with_id("b");
    let producer = ScriptedProducer::default().with_script(
        "Climate policy",
        vec![
            TransportSignal::Opened,
            stage("search_agent"),
            cluster_count(2),
            arrival(&a),
            arrival(&b),
            frame(StreamFrame::FinalResult {
                data: FinalResult {
                    topic: "Climate policy".to_string(),
                    overall_summary: "...".to_string(),
                    perspectives: vec![a.clone(), b.clone()],
                },
            }),
        ],
        true,
    );
    let (client, producer) = client_with(producer, Duration::from_secs(5));
    let mut events = client.subscribe_events();

    client.submit_topic("  Climate policy ").await.expect("submit");
    let Some(Outcome::Report(report)) = outcome_of(&client).await else {
        panic!("expected report");
    };
    assert_eq!(report.topic, "Climate policy");
    assert_eq!(report.perspectives, vec![a.clone(), b.clone()]);

    let view = client.view().await;
    assert_eq!(view.phase, Phase::Completed);
    assert_eq!(view.slots, vec![SlotView::Resolved(a), SlotView::Resolved(b)]);
    assert_eq!(view.session_id, Some(SessionId("climate-policy".to_string())));

    let events = drain(&mut events);
    assert_eq!(
        phase_changes(&events),
        vec![
            (Phase::Idle, Phase::Initiating),
            (Phase::Initiating, Phase::Streaming),
            (Phase::Streaming, Phase::Completed),
        ]
    );
    assert!(!events
        .iter()
        .any(|event| matches!(event, ClientEvent::Error(_))));

    tokio::time::timeout(Duration::from_secs(1), async {
        while !producer.released.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream released after completion");
}

#[tokio::test]
async fn close_without_snapshot_fails_with_partial_view() {
    let a = Perspective::new("A").with_id("a");
    let producer = ScriptedProducer::default().with_script(
        "Climate policy",
        vec![
            TransportSignal::Opened,
            stage("search_agent"),
            cluster_count(2),
            arrival(&a),
            TransportSignal::Closed,
        ],
        false,
    );
    let (client, _) = client_with(producer, Duration::from_secs(5));
    let mut events = client.subscribe_events();

    client.submit_topic("Climate policy").await.expect("submit");
    let Some(Outcome::Failure(failure)) = outcome_of(&client).await else {
        panic!("expected failure");
    };
    assert_eq!(failure.kind, FailureKind::AbnormalClose);

    let view = client.view().await;
    assert_eq!(view.slots, vec![SlotView::Resolved(a), SlotView::Pending]);

    let errors: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ClientEvent::Error(message) => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![failure.message]);
}

#[tokio::test]
async fn dropped_channel_counts_as_abnormal_close() {
    let producer = ScriptedProducer::default().with_script(
        "Climate policy",
        vec![TransportSignal::Opened, stage("search_agent")],
        false,
    );
    let (client, _) = client_with(producer, Duration::from_secs(5));
    client.submit_topic("Climate policy").await.expect("submit");
    let Some(Outcome::Failure(failure)) = outcome_of(&client).await else {
        panic!("expected failure");
    };
    assert_eq!(failure.kind, FailureKind::AbnormalClose);
}

#[tokio::test]
async fn initiation_failure_never_opens_a_stream() {
    let producer = ScriptedProducer {
        reject_with: Some("HTTP error! status: 500".to_string()),
        ..ScriptedProducer::default()
    };
    let (client, producer) = client_with(producer, Duration::from_secs(5));
    client.submit_topic("Climate policy").await.expect("submit");

    let Some(Outcome::Failure(failure)) = outcome_of(&client).await else {
        panic!("expected failure");
    };
    assert_eq!(failure.kind, FailureKind::Initiation);
    assert!(failure.message.contains("HTTP error! status: 500"));
    assert_eq!(client.view().await.session_id, None);
    assert_eq!(producer.active_streams.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn blank_topic_is_rejected_without_state_change() {
    let (client, producer) = client_with(ScriptedProducer::default(), Duration::from_secs(5));
    assert!(matches!(
        client.submit_topic("   ").await,
        Err(ClientError::InvalidTopic)
    ));
    assert_eq!(client.view().await.phase, Phase::Idle);
    assert_eq!(producer.initiated.load(Ordering::SeqCst), 0);
    assert_eq!(client.wait_for_outcome().await, None);
}

#[tokio::test]
async fn silent_stream_times_out() {
    let producer = ScriptedProducer::default().with_script(
        "Climate policy",
        vec![TransportSignal::Opened, stage("search_agent")],
        true,
    );
    let (client, _) = client_with(producer, Duration::from_millis(50));
    client.submit_topic("Climate policy").await.expect("submit");

    let Some(Outcome::Failure(failure)) = outcome_of(&client).await else {
        panic!("expected failure");
    };
    assert_eq!(failure.kind, FailureKind::IdleTimeout);
    assert_eq!(
        client.view().await.stages[0].status,
        crate::engine::StageStatus::Done
    );
}

#[tokio::test]
async fn new_topic_tears_down_previous_session() {
    let stale = Perspective::new("Stale").with_id("stale");
    let fresh = Perspective::new("Fresh").with_id("fresh");
    let producer = ScriptedProducer::default()
        .with_script(
            "First",
            vec![TransportSignal::Opened, cluster_count(3), arrival(&stale)],
            true,
        )
        .with_script(
            "Second",
            vec![
                TransportSignal::Opened,
                frame(StreamFrame::FinalResult {
                    data: FinalResult {
                        topic: "Second".to_string(),
                        overall_summary: "Done".to_string(),
                        perspectives: vec![fresh.clone()],
                    },
                }),
            ],
            true,
        );
    let (client, producer) = client_with(producer, Duration::from_secs(5));

    client.submit_topic("First").await.expect("submit first");
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.view().await.resolved_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first session streaming");

    client.submit_topic("Second").await.expect("submit second");
    let Some(Outcome::Report(report)) = outcome_of(&client).await else {
        panic!("expected report");
    };
    assert_eq!(report.topic, "Second");

    let view = client.view().await;
    assert_eq!(view.topic.as_deref(), Some("Second"));
    assert_eq!(view.slots, vec![SlotView::Resolved(fresh)]);

    tokio::time::timeout(Duration::from_secs(1), async {
        while producer.active_streams.load(Ordering::SeqCst) != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both streams released");
}

#[tokio::test]
async fn cancel_returns_to_idle_and_releases_stream() {
    let producer = ScriptedProducer::default().with_script(
        "Climate policy",
        vec![TransportSignal::Opened],
        true,
    );
    let (client, producer) = client_with(producer, Duration::from_secs(5));
    client.submit_topic("Climate policy").await.expect("submit");
    tokio::time::timeout(Duration::from_secs(5), async {
        while producer.active_streams.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream opened");

    client.cancel().await;
    assert_eq!(client.view().await.phase, Phase::Idle);
    assert_eq!(client.wait_for_outcome().await, None);

    tokio::time::timeout(Duration::from_secs(1), async {
        while producer.active_streams.load(Ordering::SeqCst) != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream released");
}

async fn spawn_backend() -> (String, String) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route(
            "/api/v1/analyze",
            post(|| async { Json(json!({"session_id": "live-1"})) }),
        )
        .route("/api/v1/ws/:session_id", get(stream_handler));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (
        format!("http://{addr}/api/v1"),
        format!("ws://{addr}/api/v1/ws"),
    )
}

async fn stream_handler(ws: WebSocketUpgrade, Path(session_id): Path<String>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| replay_backend(socket, session_id))
}

async fn replay_backend(mut socket: WebSocket, session_id: String) {
    let frames = [
        json!({"type": "status", "message": format!("Session {session_id} started")}),
        json!({"type": "status", "message": "Completed step: Search Agent", "step_name": "search_agent"}),
        json!({"type": "partial_result", "data": {"type": "perspective", "perspective": {
            "perspective_name": "Carbon pricing", "narrative": "Markets decide.",
            "rated_perspective_strength": 4.5, "supporting_evidence": ["ETS results"]
        }}}),
        json!({"type": "summary_token", "token": "Pricing "}),
        json!({"type": "summary_token", "token": "dominates."}),
        json!({"type": "final_result", "data": {
            "topic": "Climate policy",
            "summary": "Pricing dominates.",
            "perspectives": [{"perspective_name": "Carbon pricing", "narrative": "Markets decide."}]
        }}),
        json!({"type": "end_of_stream"}),
    ];
    for frame in frames {
        if socket.send(WsMessage::Text(frame.to_string())).await.is_err() {
            return;
        }
    }
    let _ = socket.send(WsMessage::Close(None)).await;
}

#[tokio::test]
async fn live_settings_drive_a_session_end_to_end() {
    let (api_base_url, ws_base_url) = spawn_backend().await;
    let settings = ClientSettings {
        api_base_url,
        ws_base_url,
        ..ClientSettings::default()
    };
    let client = Arc::new(AnalysisClient::from_settings(&settings).expect("client"));
    assert_eq!(client.mode(), ProducerMode::Live);

    client.submit_topic("Climate policy").await.expect("submit");
    let Some(Outcome::Report(report)) = outcome_of(&client).await else {
        panic!("expected report");
    };
    assert_eq!(report.overall_summary, "Pricing dominates.");
    assert_eq!(report.perspectives.len(), 1);
    assert_eq!(report.perspectives[0].title, "Carbon pricing");

    let view = client.view().await;
    assert_eq!(view.session_id, Some(SessionId("live-1".to_string())));
    assert_eq!(view.latest_status.as_deref(), Some("Completed step: Search Agent"));
}
