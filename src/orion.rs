//! Orion loop: the generate → review → regenerate cycle for a project.
//!
//! [`OrionLoop::advance`] performs exactly one transition per call. Polling
//! until the project settles belongs to the caller.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::MerseError;
use crate::clock::{Clock, SystemClock};
use crate::credits::{Document, DocumentStore, LedgerError, StoreError};
use crate::observability::Observability;
use crate::utils::http::send_checked;

pub const ORION_PROJECTS: &str = "orion_projects";
pub const ORION_EVENTS: &str = "orion_events";
pub const DEFAULT_SCORE_THRESHOLD: f64 = 8.5;
pub const DEFAULT_MAX_ITERATIONS: u64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    BlueprintPending,
    BlueprintReady,
    AssetsGenerating,
    AssetsReady,
    Reviewing,
    ReviewDone,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::BlueprintPending => "blueprint_pending",
            Self::BlueprintReady => "blueprint_ready",
            Self::AssetsGenerating => "assets_generating",
            Self::AssetsReady => "assets_ready",
            Self::Reviewing => "reviewing",
            Self::ReviewDone => "review_done",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopAction {
    None,
    GenerateAssets,
    SelfReview,
    RegenerateAssets,
    Complete,
}

impl LoopAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::GenerateAssets => "generate_assets",
            Self::SelfReview => "self_review",
            Self::RegenerateAssets => "regenerate_assets",
            Self::Complete => "complete",
        }
    }

    /// Status persisted when this action is taken.
    fn next_status(self, current: ProjectStatus) -> ProjectStatus {
        match self {
            Self::None => current,
            Self::GenerateAssets | Self::RegenerateAssets => ProjectStatus::AssetsGenerating,
            Self::SelfReview => ProjectStatus::Reviewing,
            Self::Complete => ProjectStatus::Completed,
        }
    }
}

impl fmt::Display for LoopAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum OrionError {
    #[error("orion project not found: {project_id}")]
    ProjectNotFound { project_id: String },
    #[error("orion {step} trigger failed: {source}")]
    Trigger { step: LoopAction, source: MerseError },
    #[error("orion store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopOutcome {
    pub project_id: String,
    pub status: ProjectStatus,
    pub action: LoopAction,
}

/// The fields of a project document the loop reads.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProjectState {
    pub status: ProjectStatus,
    pub final_score: Option<f64>,
    pub current_iteration: u64,
    pub max_iterations: u64,
}

impl ProjectState {
    pub fn from_document(doc: &Document) -> Self {
        let status = doc
            .get("status")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or(ProjectStatus::Unknown);
        Self {
            status,
            final_score: doc.get("finalScore").and_then(Value::as_f64),
            current_iteration: doc
                .get("currentIteration")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            max_iterations: doc
                .get("maxIterations")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_MAX_ITERATIONS),
        }
    }

    fn iterations_remain(&self) -> bool {
        self.current_iteration < self.max_iterations
    }
}

/// Picks the single action for `state`. Rules are checked in order and the
/// first match wins. A project without a score never counts as below the
/// threshold.
pub fn next_action(state: &ProjectState, score_threshold: f64) -> LoopAction {
    let below = state.final_score.is_some_and(|score| score < score_threshold);
    let meets = state.final_score.is_some_and(|score| score >= score_threshold);

    match state.status {
        ProjectStatus::Completed => LoopAction::None,
        ProjectStatus::BlueprintReady => LoopAction::GenerateAssets,
        ProjectStatus::AssetsReady | ProjectStatus::Reviewing => LoopAction::SelfReview,
        ProjectStatus::ReviewDone if below && state.iterations_remain() => {
            LoopAction::RegenerateAssets
        }
        ProjectStatus::ReviewDone => LoopAction::Complete,
        _ if meets => LoopAction::Complete,
        _ => LoopAction::None,
    }
}

/// External services that do the actual generation and review work.
#[async_trait]
pub trait LoopEndpoints: Send + Sync {
    /// Returns once the service acknowledged the request.
    async fn trigger(&self, action: LoopAction, project_id: &str) -> crate::Result<()>;
}

#[derive(Clone)]
pub struct HttpLoopEndpoints {
    http: reqwest::Client,
    base_url: String,
}

impl fmt::Debug for HttpLoopEndpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpLoopEndpoints")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpLoopEndpoints {
    pub fn new(base_url: impl Into<String>) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LoopEndpoints for HttpLoopEndpoints {
    async fn trigger(&self, action: LoopAction, project_id: &str) -> crate::Result<()> {
        let (path, body) = match action {
            LoopAction::GenerateAssets => ("assets", json!({ "projectId": project_id })),
            LoopAction::SelfReview => ("review", json!({ "projectId": project_id })),
            LoopAction::RegenerateAssets => (
                "assets",
                json!({ "projectId": project_id, "regenerate": true }),
            ),
            LoopAction::None | LoopAction::Complete => {
                return Err(MerseError::Config(format!(
                    "orion action {action} has no endpoint"
                )));
            }
        };
        let url = format!("{}/api/orion/{path}", self.base_url);
        send_checked(self.http.post(url).json(&body)).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct OrionLoop {
    store: Arc<dyn DocumentStore>,
    endpoints: Arc<dyn LoopEndpoints>,
    clock: Arc<dyn Clock>,
    observability: Arc<Observability>,
    score_threshold: f64,
}

impl fmt::Debug for OrionLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrionLoop")
            .field("score_threshold", &self.score_threshold)
            .finish_non_exhaustive()
    }
}

impl OrionLoop {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        endpoints: Arc<dyn LoopEndpoints>,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            store,
            endpoints,
            clock: Arc::new(SystemClock),
            observability,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_score_threshold(mut self, score_threshold: f64) -> Self {
        self.score_threshold = score_threshold;
        self
    }

    /// Moves the project one step. The status is read and the next status
    /// persisted in one store transaction, so concurrent calls on the same
    /// project agree on a single transition and only the winner fires the
    /// external trigger. A failed trigger leaves the persisted status in place
    /// and surfaces as [`OrionError::Trigger`].
    pub async fn advance(&self, project_id: &str) -> Result<LoopOutcome, OrionError> {
        let decided: Arc<Mutex<Option<Transition>>> = Arc::new(Mutex::new(None));
        let slot = decided.clone();
        let score_threshold = self.score_threshold;
        let now = self.clock.now_epoch_millis();

        let step = move |current: Option<&Document>| -> Result<Option<Document>, LedgerError> {
            let transition = current
                .map(|doc| Transition::plan(ProjectState::from_document(doc), score_threshold));
            let patch = transition.and_then(|transition| transition.patch(now));
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = transition;
            Ok(patch)
        };

        let committed = self
            .store
            .transact(ORION_PROJECTS, project_id, Box::new(step))
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let transition = decided
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (Some(_), Some(transition)) = (committed, transition) else {
            return Err(OrionError::ProjectNotFound {
                project_id: project_id.to_string(),
            });
        };
        let Transition {
            state,
            action,
            status,
        } = transition;

        if action == LoopAction::None {
            return Ok(LoopOutcome {
                project_id: project_id.to_string(),
                status,
                action,
            });
        }

        self.observability.record_loop_transition();
        tracing::info!(
            project_id,
            from = %state.status,
            to = %status,
            action = %action,
            "orion loop transition"
        );

        if action == LoopAction::Complete {
            let mut event = Document::new();
            event.insert("projectId".to_string(), Value::from(project_id));
            event.insert("type".to_string(), Value::from("completed"));
            event.insert("finalScore".to_string(), json!(state.final_score));
            event.insert(
                "iterations".to_string(),
                Value::from(state.current_iteration),
            );
            event.insert("createdAt".to_string(), Value::from(now));
            self.store.append(ORION_EVENTS, event).await?;
        } else {
            self.endpoints
                .trigger(action, project_id)
                .await
                .map_err(|source| OrionError::Trigger {
                    step: action,
                    source,
                })?;
        }

        Ok(LoopOutcome {
            project_id: project_id.to_string(),
            status,
            action,
        })
    }
}

/// One decided step: the state it was decided from, the action and the
/// status it leads to.
#[derive(Clone, Copy, Debug)]
struct Transition {
    state: ProjectState,
    action: LoopAction,
    status: ProjectStatus,
}

impl Transition {
    fn plan(state: ProjectState, score_threshold: f64) -> Self {
        let action = next_action(&state, score_threshold);
        Self {
            state,
            action,
            status: action.next_status(state.status),
        }
    }

    /// Fields written for this step, or `None` when nothing changes.
    fn patch(&self, now: u64) -> Option<Document> {
        if self.action == LoopAction::None {
            return None;
        }
        let mut patch = Document::new();
        patch.insert("status".to_string(), Value::from(self.status.as_str()));
        patch.insert("updatedAt".to_string(), Value::from(now));
        match self.action {
            LoopAction::RegenerateAssets => {
                patch.insert(
                    "currentIteration".to_string(),
                    Value::from(self.state.current_iteration.saturating_add(1)),
                );
            }
            LoopAction::Complete => {
                patch.insert("finalScore".to_string(), json!(self.state.final_score));
                patch.insert("completedAt".to_string(), Value::from(now));
            }
            _ => {}
        }
        Some(patch)
    }
}
