use std::collections::BTreeMap;

use uuid::Uuid;

use crate::error::StoreResult;
use crate::model::{ArtefactVersionMismatch, StateType};
use crate::store::StateStore;

/// Differences between TARGET and IS rows of `server`, keyed by artefact
/// identifier and returned in identifier order.
///
/// With `requires_restart` set, only mismatches whose change does (`true`)
/// or does not (`false`) need a stopped server are returned.
pub fn compute_mismatches(
    store: &dyn StateStore,
    server: Uuid,
    requires_restart: Option<bool>,
) -> StoreResult<Vec<ArtefactVersionMismatch>> {
    store.get_server(server)?;

    let mut joined: BTreeMap<String, (Option<Uuid>, Option<Uuid>)> = BTreeMap::new();
    for row in store.list_states(server, None)? {
        let slot = joined.entry(row.artefact_identifier).or_default();
        match row.state_type {
            StateType::Target => slot.0 = Some(row.artefact_uuid),
            StateType::Is => slot.1 = Some(row.artefact_uuid),
            StateType::History => {}
        }
    }

    let mut mismatches = Vec::new();
    for (target, is) in joined.into_values() {
        let mismatch = match (target, is) {
            (Some(target), Some(is)) if target == is => continue,
            (Some(target), Some(is)) => ArtefactVersionMismatch::Update {
                is: store.get_artefact(is)?,
                target: store.get_artefact(target)?,
            },
            (Some(target), None) => ArtefactVersionMismatch::Install {
                target: store.get_artefact(target)?,
            },
            (None, Some(is)) => ArtefactVersionMismatch::Uninstall {
                is: store.get_artefact(is)?,
            },
            (None, None) => continue,
        };
        if requires_restart.map_or(true, |flag| mismatch.requires_restart() == flag) {
            mismatches.push(mismatch);
        }
    }
    Ok(mismatches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::tests::{artefact, server};
    use crate::store::JsonStateStore;

    #[test]
    fn classifies_each_identifier() {
        let store = JsonStateStore::in_memory();
        let srv = server(&store);
        let core_1 = artefact(&store, "spellcore", "1.0.0", true);
        let core_2 = artefact(&store, "spellcore", "2.0.0", true);
        let maps = artefact(&store, "maps", "1.0.0", false);
        let motd = artefact(&store, "motd", "1.0.0", false);
        let same = artefact(&store, "ranks", "3.0.0", true);

        store.upsert_state(srv, StateType::Is, "spellcore", core_1.uuid).unwrap();
        store.upsert_state(srv, StateType::Target, "spellcore", core_2.uuid).unwrap();
        store.upsert_state(srv, StateType::Target, "maps", maps.uuid).unwrap();
        store.upsert_state(srv, StateType::Is, "motd", motd.uuid).unwrap();
        store.upsert_state(srv, StateType::Is, "ranks", same.uuid).unwrap();
        store.upsert_state(srv, StateType::Target, "ranks", same.uuid).unwrap();

        let all = compute_mismatches(&store, srv, None).unwrap();
        assert_eq!(
            all,
            vec![
                ArtefactVersionMismatch::Install { target: maps.clone() },
                ArtefactVersionMismatch::Uninstall { is: motd.clone() },
                ArtefactVersionMismatch::Update {
                    is: core_1.clone(),
                    target: core_2.clone()
                },
            ]
        );

        let hot = compute_mismatches(&store, srv, Some(false)).unwrap();
        assert_eq!(hot.len(), 2);
        assert!(hot.iter().all(|m| !m.requires_restart()));
        let cold = compute_mismatches(&store, srv, Some(true)).unwrap();
        assert_eq!(cold.len(), 1);
        assert_eq!(cold[0].identifier(), "spellcore");
    }

    #[test]
    fn history_rows_do_not_count() {
        let store = JsonStateStore::in_memory();
        let srv = server(&store);
        let v1 = artefact(&store, "maps", "1.0.0", false);
        let v2 = artefact(&store, "maps", "1.1.0", false);
        store.upsert_state(srv, StateType::Target, "maps", v1.uuid).unwrap();
        store.upsert_state(srv, StateType::Is, "maps", v1.uuid).unwrap();
        store.upsert_state(srv, StateType::Target, "maps", v2.uuid).unwrap();
        store.upsert_state(srv, StateType::Is, "maps", v2.uuid).unwrap();
        assert!(compute_mismatches(&store, srv, None).unwrap().is_empty());
    }

    #[test]
    fn unknown_server_is_not_found() {
        let store = JsonStateStore::in_memory();
        let e = compute_mismatches(&store, Uuid::new_v4(), None).unwrap_err();
        assert!(matches!(e, StoreError::NotFound { .. }));
    }
}
