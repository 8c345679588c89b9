use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A managed game-server instance. Owned by the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerModel {
    pub uuid: Uuid,
    pub environment: String,
    pub name: String,
    /// Operator id (key of the controller's `operators` map).
    pub operator: String,
    /// Docker-style memory limit, e.g. "4g". Empty means unlimited.
    #[serde(default)]
    pub memory_limit: Option<String>,
    /// Docker-style cpu limit, e.g. "1.5". Empty means unlimited.
    #[serde(default)]
    pub cpu_limit: Option<String>,
    pub image: String,
    #[serde(default)]
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtefactModel {
    pub uuid: Uuid,
    pub identifier: String,
    pub version: semver::Version,
    pub uploaded_at: DateTime<Utc>,
    /// Lowercase hex SHA-256 of the archive bytes.
    pub hash: String,
    #[serde(default = "default_requires_restart")]
    pub requires_restart: bool,
}

pub(crate) fn default_requires_restart() -> bool {
    true
}

impl ArtefactModel {
    pub fn label(&self) -> String {
        format!("{}@{}", self.identifier, self.version)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateType {
    #[serde(rename = "TARGET")]
    Target,
    #[serde(rename = "IS")]
    Is,
    #[serde(rename = "HISTORY")]
    History,
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateType::Target => write!(f, "TARGET"),
            StateType::Is => write!(f, "IS"),
            StateType::History => write!(f, "HISTORY"),
        }
    }
}

impl std::str::FromStr for StateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TARGET" => Ok(StateType::Target),
            "IS" => Ok(StateType::Is),
            "HISTORY" => Ok(StateType::History),
            _ => Err(format!(
                "Unknown state type: {}. Must be 'TARGET', 'IS' or 'HISTORY'",
                s
            )),
        }
    }
}

/// One reconciliation record. The artefact identifier, not the artefact
/// uuid, is the stable key across versions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerArtefactState {
    pub uuid: Uuid,
    pub server: Uuid,
    pub artefact_identifier: String,
    pub artefact_uuid: Uuid,
    #[serde(rename = "type")]
    pub state_type: StateType,
    pub definition_date: DateTime<Utc>,
}

/// Difference between TARGET and IS for one artefact identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ArtefactVersionMismatch {
    Install { target: ArtefactModel },
    Uninstall { is: ArtefactModel },
    Update { is: ArtefactModel, target: ArtefactModel },
}

impl ArtefactVersionMismatch {
    pub fn identifier(&self) -> &str {
        match self {
            ArtefactVersionMismatch::Install { target } => &target.identifier,
            ArtefactVersionMismatch::Uninstall { is } => &is.identifier,
            ArtefactVersionMismatch::Update { target, .. } => &target.identifier,
        }
    }

    pub fn to_install(&self) -> Option<&ArtefactModel> {
        match self {
            ArtefactVersionMismatch::Install { target } => Some(target),
            ArtefactVersionMismatch::Update { target, .. } => Some(target),
            ArtefactVersionMismatch::Uninstall { .. } => None,
        }
    }

    pub fn to_uninstall(&self) -> Option<&ArtefactModel> {
        match self {
            ArtefactVersionMismatch::Uninstall { is } => Some(is),
            ArtefactVersionMismatch::Update { is, .. } => Some(is),
            ArtefactVersionMismatch::Install { .. } => None,
        }
    }

    /// A change needs a stopped server when any artefact it touches does.
    pub fn requires_restart(&self) -> bool {
        self.to_install().map_or(false, |a| a.requires_restart)
            || self.to_uninstall().map_or(false, |a| a.requires_restart)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleAction {
    Start,
    Stop,
    Restart,
    /// Stop if running, apply every mismatch, start again.
    Update,
    /// Apply only the restart-free mismatches against the live server.
    HotUpdate,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Restart => "restart",
            LifecycleAction::Update => "update",
            LifecycleAction::HotUpdate => "hot-update",
        }
    }
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "start" => Ok(LifecycleAction::Start),
            "stop" => Ok(LifecycleAction::Stop),
            "restart" => Ok(LifecycleAction::Restart),
            "update" => Ok(LifecycleAction::Update),
            "hot-update" | "hotupdate" => Ok(LifecycleAction::HotUpdate),
            _ => Err(format!(
                "Unknown action: {}. Must be 'start', 'stop', 'restart', 'update' or 'hot-update'",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledLifecycleAction {
    pub uuid: Uuid,
    pub server: Uuid,
    pub action: LifecycleAction,
    pub time_of_execution: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronjobExecution {
    #[serde(rename = "type")]
    pub job_type: String,
    pub next_execution: DateTime<Utc>,
}

/// What an operator answers for an executed lifecycle action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionReport {
    pub server: Uuid,
    pub action: LifecycleAction,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateReport>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub applied: Vec<AppliedMismatch>,
    pub failures: Vec<MismatchFailure>,
}

impl UpdateReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMismatch {
    pub identifier: String,
    /// Artefact now installed, `None` after an uninstall.
    pub installed: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MismatchFailure {
    pub identifier: String,
    pub error: String,
}
