//! Controller-side persistence.
//!
//! [`JsonStateStore`] keeps everything in one snapshot guarded by a mutex and
//! writes it to a JSON file after every mutation. A mutation works on a copy
//! of the snapshot and only replaces the live one after the file has been
//! written, so a failed write leaves both memory and disk unchanged.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::model::{
    ArtefactModel, CronjobExecution, LifecycleAction, ScheduledLifecycleAction,
    ServerArtefactState, ServerModel, StateType,
};

/// Data access used by the controller. Every call is atomic on its own.
pub trait StateStore: Send + Sync {
    fn upsert_server(&self, server: ServerModel) -> StoreResult<ServerModel>;
    fn get_server(&self, uuid: Uuid) -> StoreResult<ServerModel>;
    fn list_servers(&self) -> StoreResult<Vec<ServerModel>>;

    /// Fails with `Conflict` when identifier+version already exists.
    fn insert_artefact(&self, artefact: ArtefactModel) -> StoreResult<ArtefactModel>;
    fn get_artefact(&self, uuid: Uuid) -> StoreResult<ArtefactModel>;
    fn list_artefacts(&self) -> StoreResult<Vec<ArtefactModel>>;

    fn list_states(
        &self,
        server: Uuid,
        state_type: Option<StateType>,
    ) -> StoreResult<Vec<ServerArtefactState>>;
    /// Raw insert. A second TARGET or IS row for the same server+identifier
    /// is a `Conflict`.
    fn insert_state(&self, state: ServerArtefactState) -> StoreResult<ServerArtefactState>;
    /// Point the TARGET or IS row of `server`/`identifier` at `artefact`,
    /// snapshotting the superseded row as HISTORY.
    fn upsert_state(
        &self,
        server: Uuid,
        state_type: StateType,
        identifier: &str,
        artefact: Uuid,
    ) -> StoreResult<ServerArtefactState>;
    /// Delete the TARGET or IS row, snapshotting it as HISTORY.
    fn remove_state(
        &self,
        server: Uuid,
        state_type: StateType,
        identifier: &str,
    ) -> StoreResult<ServerArtefactState>;
    /// Drop HISTORY rows defined before `before`. Returns how many went.
    fn prune_history(&self, before: DateTime<Utc>) -> StoreResult<usize>;

    fn list_cronjob_executions(&self) -> StoreResult<Vec<CronjobExecution>>;
    fn upsert_cronjob_execution(&self, execution: CronjobExecution) -> StoreResult<()>;

    /// Pending actions are unique per server+action; a second request moves
    /// the existing row to the new time.
    fn upsert_scheduled_action(
        &self,
        server: Uuid,
        action: LifecycleAction,
        time_of_execution: DateTime<Utc>,
    ) -> StoreResult<ScheduledLifecycleAction>;
    fn list_scheduled_actions(&self) -> StoreResult<Vec<ScheduledLifecycleAction>>;
    /// Actions with `time_of_execution < now`, oldest first.
    fn list_due_actions(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledLifecycleAction>>;
    fn delete_scheduled_action(&self, uuid: Uuid) -> StoreResult<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    #[serde(default)]
    servers: BTreeMap<Uuid, ServerModel>,
    #[serde(default)]
    artefacts: BTreeMap<Uuid, ArtefactModel>,
    #[serde(default)]
    states: Vec<ServerArtefactState>,
    #[serde(default)]
    cronjobs: BTreeMap<String, CronjobExecution>,
    #[serde(default)]
    scheduled_actions: Vec<ScheduledLifecycleAction>,
}

impl Snapshot {
    fn current_state(
        &self,
        server: Uuid,
        state_type: StateType,
        identifier: &str,
    ) -> Option<usize> {
        self.states.iter().position(|s| {
            s.server == server && s.state_type == state_type && s.artefact_identifier == identifier
        })
    }

    fn history_of(row: &ServerArtefactState) -> ServerArtefactState {
        ServerArtefactState {
            uuid: Uuid::new_v4(),
            state_type: StateType::History,
            definition_date: Utc::now(),
            ..row.clone()
        }
    }
}

pub struct JsonStateStore {
    path: Option<PathBuf>,
    snapshot: Mutex<Snapshot>,
}

impl JsonStateStore {
    /// Open (or create on first write) the state file at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read state file {}", path.display()))?;
            let snapshot: Snapshot = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse state file {}", path.display()))?;
            info!(
                "📂 Loaded state from {}: {} server(s), {} artefact(s), {} state row(s)",
                path.display(),
                snapshot.servers.len(),
                snapshot.artefacts.len(),
                snapshot.states.len()
            );
            snapshot
        } else {
            info!("No state file at {}, starting empty", path.display());
            Snapshot::default()
        };
        Ok(Self {
            path: Some(path),
            snapshot: Mutex::new(snapshot),
        })
    }

    /// Store without a backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Snapshot>> {
        self.snapshot.lock().map_err(|_| StoreError::Storage {
            message: "state lock poisoned".to_string(),
            source: None,
        })
    }

    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.lock()?;
        f(&guard)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Snapshot) -> StoreResult<T>) -> StoreResult<T> {
        let mut guard = self.lock()?;
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        self.persist(&draft)?;
        *guard = draft;
        Ok(out)
    }

    fn persist(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StoreError::storage("serializing state", e))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| StoreError::storage(format!("creating {}", parent.display()), e))?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .map_err(|e| StoreError::storage(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, path)
            .map_err(|e| StoreError::storage(format!("replacing {}", path.display()), e))?;
        Ok(())
    }
}

impl StateStore for JsonStateStore {
    fn upsert_server(&self, server: ServerModel) -> StoreResult<ServerModel> {
        self.mutate(|s| {
            s.servers.insert(server.uuid, server.clone());
            Ok(server)
        })
    }

    fn get_server(&self, uuid: Uuid) -> StoreResult<ServerModel> {
        self.read(|s| {
            s.servers
                .get(&uuid)
                .cloned()
                .ok_or_else(|| StoreError::not_found(format!("server {}", uuid)))
        })
    }

    fn list_servers(&self) -> StoreResult<Vec<ServerModel>> {
        self.read(|s| Ok(s.servers.values().cloned().collect()))
    }

    fn insert_artefact(&self, artefact: ArtefactModel) -> StoreResult<ArtefactModel> {
        self.mutate(|s| {
            if s.artefacts.values().any(|a| {
                a.identifier == artefact.identifier && a.version == artefact.version
            }) {
                return Err(StoreError::conflict(format!(
                    "artefact {} already exists",
                    artefact.label()
                )));
            }
            if s.artefacts.contains_key(&artefact.uuid) {
                return Err(StoreError::conflict(format!("artefact {}", artefact.uuid)));
            }
            s.artefacts.insert(artefact.uuid, artefact.clone());
            Ok(artefact)
        })
    }

    fn get_artefact(&self, uuid: Uuid) -> StoreResult<ArtefactModel> {
        self.read(|s| {
            s.artefacts
                .get(&uuid)
                .cloned()
                .ok_or_else(|| StoreError::not_found(format!("artefact {}", uuid)))
        })
    }

    fn list_artefacts(&self) -> StoreResult<Vec<ArtefactModel>> {
        self.read(|s| {
            let mut artefacts: Vec<_> = s.artefacts.values().cloned().collect();
            artefacts.sort_by(|a, b| {
                a.identifier
                    .cmp(&b.identifier)
                    .then_with(|| a.version.cmp(&b.version))
            });
            Ok(artefacts)
        })
    }

    fn list_states(
        &self,
        server: Uuid,
        state_type: Option<StateType>,
    ) -> StoreResult<Vec<ServerArtefactState>> {
        self.read(|s| {
            Ok(s.states
                .iter()
                .filter(|row| row.server == server)
                .filter(|row| state_type.map_or(true, |t| row.state_type == t))
                .cloned()
                .collect())
        })
    }

    fn insert_state(&self, state: ServerArtefactState) -> StoreResult<ServerArtefactState> {
        self.mutate(|s| {
            if state.state_type != StateType::History
                && s
                    .current_state(state.server, state.state_type, &state.artefact_identifier)
                    .is_some()
            {
                return Err(StoreError::conflict(format!(
                    "server {} already has a {} row for {}",
                    state.server, state.state_type, state.artefact_identifier
                )));
            }
            s.states.push(state.clone());
            Ok(state)
        })
    }

    fn upsert_state(
        &self,
        server: Uuid,
        state_type: StateType,
        identifier: &str,
        artefact: Uuid,
    ) -> StoreResult<ServerArtefactState> {
        if state_type == StateType::History {
            return Err(StoreError::invalid("HISTORY rows cannot be written directly"));
        }
        self.mutate(|s| {
            if !s.servers.contains_key(&server) {
                return Err(StoreError::not_found(format!("server {}", server)));
            }
            let model = s
                .artefacts
                .get(&artefact)
                .ok_or_else(|| StoreError::not_found(format!("artefact {}", artefact)))?;
            if model.identifier != identifier {
                return Err(StoreError::invalid(format!(
                    "artefact {} is {}, not {}",
                    artefact, model.identifier, identifier
                )));
            }

            if let Some(idx) = s.current_state(server, state_type, identifier) {
                if s.states[idx].artefact_uuid == artefact {
                    return Ok(s.states[idx].clone());
                }
                let history = Snapshot::history_of(&s.states[idx]);
                s.states.push(history);
                let row = &mut s.states[idx];
                row.artefact_uuid = artefact;
                row.definition_date = Utc::now();
                debug!("{} {} of server {} -> {}", state_type, identifier, server, artefact);
                return Ok(row.clone());
            }

            let row = ServerArtefactState {
                uuid: Uuid::new_v4(),
                server,
                artefact_identifier: identifier.to_string(),
                artefact_uuid: artefact,
                state_type,
                definition_date: Utc::now(),
            };
            s.states.push(row.clone());
            debug!("{} {} of server {} set to {}", state_type, identifier, server, artefact);
            Ok(row)
        })
    }

    fn remove_state(
        &self,
        server: Uuid,
        state_type: StateType,
        identifier: &str,
    ) -> StoreResult<ServerArtefactState> {
        if state_type == StateType::History {
            return Err(StoreError::invalid("HISTORY rows are removed by retention only"));
        }
        self.mutate(|s| {
            let idx = s.current_state(server, state_type, identifier).ok_or_else(|| {
                StoreError::not_found(format!(
                    "{} row for {} on server {}",
                    state_type, identifier, server
                ))
            })?;
            let removed = s.states.remove(idx);
            s.states.push(Snapshot::history_of(&removed));
            Ok(removed)
        })
    }

    fn prune_history(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        self.mutate(|s| {
            let len = s.states.len();
            s.states
                .retain(|row| row.state_type != StateType::History || row.definition_date >= before);
            Ok(len - s.states.len())
        })
    }

    fn list_cronjob_executions(&self) -> StoreResult<Vec<CronjobExecution>> {
        self.read(|s| Ok(s.cronjobs.values().cloned().collect()))
    }

    fn upsert_cronjob_execution(&self, execution: CronjobExecution) -> StoreResult<()> {
        self.mutate(|s| {
            s.cronjobs.insert(execution.job_type.clone(), execution);
            Ok(())
        })
    }

    fn upsert_scheduled_action(
        &self,
        server: Uuid,
        action: LifecycleAction,
        time_of_execution: DateTime<Utc>,
    ) -> StoreResult<ScheduledLifecycleAction> {
        self.mutate(|s| {
            if !s.servers.contains_key(&server) {
                return Err(StoreError::not_found(format!("server {}", server)));
            }
            if let Some(pending) = s
                .scheduled_actions
                .iter_mut()
                .find(|a| a.server == server && a.action == action)
            {
                pending.time_of_execution = time_of_execution;
                return Ok(pending.clone());
            }
            let scheduled = ScheduledLifecycleAction {
                uuid: Uuid::new_v4(),
                server,
                action,
                time_of_execution,
            };
            s.scheduled_actions.push(scheduled.clone());
            Ok(scheduled)
        })
    }

    fn list_scheduled_actions(&self) -> StoreResult<Vec<ScheduledLifecycleAction>> {
        self.read(|s| Ok(s.scheduled_actions.clone()))
    }

    fn list_due_actions(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledLifecycleAction>> {
        self.read(|s| {
            let mut due: Vec<_> = s
                .scheduled_actions
                .iter()
                .filter(|a| a.time_of_execution < now)
                .cloned()
                .collect();
            due.sort_by_key(|a| a.time_of_execution);
            Ok(due)
        })
    }

    fn delete_scheduled_action(&self, uuid: Uuid) -> StoreResult<()> {
        self.mutate(|s| {
            let len = s.scheduled_actions.len();
            s.scheduled_actions.retain(|a| a.uuid != uuid);
            if s.scheduled_actions.len() == len {
                return Err(StoreError::not_found(format!("scheduled action {}", uuid)));
            }
            Ok(())
        })
    }
}
