use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(SessionId);
id_newtype!(PerspectiveId);

/// Analysis stages in the order the backend workflow runs them.
pub const ANALYSIS_STEPS: &[&str] = &[
    "search_agent",
    "perspective_identification",
    "perspective_clustering",
    "perspective_synthesis",
    "summary_generation",
];

/// Reserved `step_name` announcing that the producer has finished without a snapshot.
pub const TERMINAL_STEP_NAME: &str = "analysis_complete";

pub const MAX_RATED_STRENGTH: f64 = 5.0;

/// `search_agent` -> `Search Agent`.
pub fn format_step_name(step_name: &str) -> String {
    step_name
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strength rating clamped into `0.0..=MAX_RATED_STRENGTH`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct RatedStrength(f64);

impl RatedStrength {
    pub fn value(self) -> f64 {
        self.0
    }
}

impl From<f64> for RatedStrength {
    fn from(raw: f64) -> Self {
        if raw.is_nan() {
            return Self(0.0);
        }
        Self(raw.clamp(0.0, MAX_RATED_STRENGTH))
    }
}

impl From<RatedStrength> for f64 {
    fn from(value: RatedStrength) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Evidence {
    Statement(String),
    Structured {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        statement: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
}

impl Evidence {
    pub fn statement(&self) -> &str {
        match self {
            Evidence::Statement(statement) => statement,
            Evidence::Structured { statement, .. } => statement,
        }
    }
}

/// One analysed viewpoint. A later arrival for the same identity replaces it whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perspective {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PerspectiveId>,
    #[serde(alias = "perspective_name")]
    pub title: String,
    #[serde(
        default,
        rename = "narrativeSummary",
        alias = "narrative",
        alias = "summary",
        alias = "narrative_summary"
    )]
    pub narrative_summary: String,
    #[serde(
        default,
        rename = "ratedStrength",
        alias = "rated_perspective_strength",
        alias = "rated_strength",
        skip_serializing_if = "Option::is_none"
    )]
    pub rated_strength: Option<RatedStrength>,
    #[serde(default, alias = "supporting_evidence")]
    pub evidence: Vec<Evidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strengths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weaknesses: Option<Vec<String>>,
}

impl Perspective {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            narrative_summary: String::new(),
            rated_strength: None,
            evidence: Vec::new(),
            strengths: None,
            weaknesses: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(PerspectiveId(id.into()));
        self
    }
}

/// Authoritative, complete analysis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub topic: String,
    #[serde(rename = "overallSummary")]
    pub overall_summary: String,
    pub perspectives: Vec<Perspective>,
    #[serde(rename = "completedAt")]
    pub completed_at: DateTime<Utc>,
}
