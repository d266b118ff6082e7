//! Pure projection from [`SessionState`] to the render model consumed by presentation.

use serde::Serialize;
use shared::domain::{format_step_name, Perspective, SessionId};

use crate::engine::{Outcome, Phase, SessionState, Slot, StageStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageView {
    pub name: String,
    pub label: String,
    pub status: StageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "perspective", rename_all = "snake_case")]
pub enum SlotView {
    Pending,
    Resolved(Perspective),
}

impl SlotView {
    pub fn perspective(&self) -> Option<&Perspective> {
        match self {
            SlotView::Pending => None,
            SlotView::Resolved(perspective) => Some(perspective),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderModel {
    pub session_id: Option<SessionId>,
    pub topic: Option<String>,
    pub phase: Phase,
    pub stages: Vec<StageView>,
    pub iteration: Option<u64>,
    pub articles_found: Option<u64>,
    pub latest_status: Option<String>,
    pub slots: Vec<SlotView>,
    pub summary: Option<String>,
    pub outcome: Option<Outcome>,
}

impl RenderModel {
    pub fn resolved_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, SlotView::Resolved(_)))
            .count()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

pub fn project(state: &SessionState) -> RenderModel {
    let steps = state.steps();
    let stages = steps
        .stages()
        .iter()
        .enumerate()
        .map(|(index, name)| StageView {
            name: name.clone(),
            label: format_step_name(name),
            status: steps.status(index),
        })
        .collect();

    let mut slots: Vec<SlotView> = state
        .slots()
        .iter()
        .map(|slot| match slot {
            Slot::Empty => SlotView::Pending,
            Slot::Filled(perspective) => SlotView::Resolved(perspective.clone()),
        })
        .collect();
    let expected = state.expected_count().unwrap_or(0);
    if slots.len() < expected {
        slots.resize(expected, SlotView::Pending);
    }

    RenderModel {
        session_id: state.session_id().cloned(),
        topic: state.topic().map(str::to_string),
        phase: state.phase(),
        stages,
        iteration: state.iteration(),
        articles_found: state.articles_found(),
        latest_status: state.latest_status().map(str::to_string),
        slots,
        summary: state.summary().map(str::to_string),
        outcome: state.outcome().cloned(),
    }
}

#[cfg(test)]
#[path = "tests/projector_tests.rs"]
mod tests;
