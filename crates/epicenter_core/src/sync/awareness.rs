//! Ephemeral presence state.
//!
//! Awareness is never persisted. Each client owns one JSON state and a
//! logical clock it bumps on every change; receivers keep only the newest
//! state per client. A `null` state marks the client as gone.
//!
//! # Payload
//!
//! ```text
//! varUint(count)
//! count × ( varUint(clientId) | varUint(clock) | varString(json) )
//! ```

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use super::protocol::{
    ProtocolError, read_var_string, read_var_uint, write_var_string, write_var_uint,
};

/// One entry of an awareness update. `state` is `None` for a removal.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<Value>,
}

/// Decoded awareness payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_var_uint(&mut buf, self.entries.len() as u64);
        for entry in &self.entries {
            write_var_uint(&mut buf, entry.client_id);
            write_var_uint(&mut buf, entry.clock);
            let json = match &entry.state {
                Some(state) => state.to_string(),
                None => "null".to_string(),
            };
            write_var_string(&mut buf, &json);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (count, mut offset) = read_var_uint(data)?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let (client_id, n) = read_var_uint(&data[offset..])?;
            offset += n;
            let (clock, n) = read_var_uint(&data[offset..])?;
            offset += n;
            let (json, n) = read_var_string(&data[offset..])?;
            offset += n;

            let state: Value = serde_json::from_str(&json)
                .map_err(|e| ProtocolError::InvalidAwareness(e.to_string()))?;
            entries.push(AwarenessEntry {
                client_id,
                clock,
                state: (!state.is_null()).then_some(state),
            });
        }
        Ok(Self { entries })
    }

    /// Client ids mentioned by this update.
    pub fn client_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|e| e.client_id)
    }
}

/// What an applied update changed, by client id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AwarenessChanges {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ClientState {
    clock: u64,
    state: Option<Value>,
}

/// Latest known awareness state of every client, including this one.
#[derive(Debug, Clone)]
pub struct Awareness {
    local: Option<u64>,
    clients: HashMap<u64, ClientState>,
}

impl Awareness {
    pub fn new(client_id: u64) -> Self {
        Self {
            local: Some(client_id),
            clients: HashMap::new(),
        }
    }

    /// Awareness for a relay: tracks every client and has no presence of its
    /// own, so no client id is reserved.
    pub fn relay() -> Self {
        Self {
            local: None,
            clients: HashMap::new(),
        }
    }

    /// The local client id, `None` for a relay.
    pub fn client_id(&self) -> Option<u64> {
        self.local
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.get(self.local?)
    }

    /// Live state of one client.
    pub fn get(&self, client_id: u64) -> Option<&Value> {
        self.clients.get(&client_id)?.state.as_ref()
    }

    /// Live states of every client, ordered by client id.
    pub fn states(&self) -> BTreeMap<u64, Value> {
        self.clients
            .iter()
            .filter_map(|(id, c)| c.state.clone().map(|s| (*id, s)))
            .collect()
    }

    /// Replace the local state. Returns the update to broadcast, empty for a
    /// relay.
    pub fn set_local_state(&mut self, state: Value) -> AwarenessUpdate {
        let Some(local) = self.local else {
            return AwarenessUpdate::default();
        };
        let state = (!state.is_null()).then_some(state);
        self.bump(local, state)
    }

    /// Mark the local client as gone. Returns the update to broadcast.
    pub fn clear_local_state(&mut self) -> AwarenessUpdate {
        match self.local {
            Some(local) => self.bump(local, None),
            None => AwarenessUpdate::default(),
        }
    }

    /// Mark other clients as gone, e.g. after their connection closed.
    /// Clients without a live state are skipped.
    pub fn remove_clients(&mut self, client_ids: &[u64]) -> AwarenessUpdate {
        let mut update = AwarenessUpdate::default();
        for &client_id in client_ids {
            if self.get(client_id).is_some() {
                update.entries.extend(self.bump(client_id, None).entries);
            }
        }
        update
    }

    fn bump(&mut self, client_id: u64, state: Option<Value>) -> AwarenessUpdate {
        let clock = self.clients.get(&client_id).map_or(0, |c| c.clock + 1);
        self.clients.insert(
            client_id,
            ClientState {
                clock,
                state: state.clone(),
            },
        );
        AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id,
                clock,
                state,
            }],
        }
    }

    /// Every live state, as answered to `QUERY_AWARENESS`.
    pub fn full_update(&self) -> AwarenessUpdate {
        let mut entries: Vec<AwarenessEntry> = self
            .clients
            .iter()
            .filter(|(_, c)| c.state.is_some())
            .map(|(id, c)| AwarenessEntry {
                client_id: *id,
                clock: c.clock,
                state: c.state.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.client_id);
        AwarenessUpdate { entries }
    }

    /// Merge a received update.
    ///
    /// An entry wins if its clock is newer than the one held, or equal and it
    /// removes the client. Entries about the local client are ignored; only
    /// this peer changes its own state.
    pub fn apply(&mut self, update: &AwarenessUpdate) -> AwarenessChanges {
        let mut changes = AwarenessChanges::default();
        for entry in &update.entries {
            if Some(entry.client_id) == self.local {
                continue;
            }
            let previous = self.clients.get(&entry.client_id);
            let newer = match previous {
                None => true,
                Some(held) => {
                    entry.clock > held.clock
                        || (entry.clock == held.clock
                            && entry.state.is_none()
                            && held.state.is_some())
                }
            };
            if !newer {
                continue;
            }

            let was_live = previous.and_then(|p| p.state.as_ref());
            match (was_live, &entry.state) {
                (None, Some(_)) => changes.added.push(entry.client_id),
                (Some(old), Some(new)) if old != new => changes.updated.push(entry.client_id),
                (Some(_), None) => changes.removed.push(entry.client_id),
                _ => {}
            }
            self.clients.insert(
                entry.client_id,
                ClientState {
                    clock: entry.clock,
                    state: entry.state.clone(),
                },
            );
        }
        changes
    }

    /// Decode and merge an encoded update.
    pub fn apply_encoded(&mut self, data: &[u8]) -> Result<AwarenessChanges, ProtocolError> {
        let update = AwarenessUpdate::decode(data)?;
        Ok(self.apply(&update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_encoding() {
        let update = AwarenessUpdate {
            entries: vec![
                AwarenessEntry {
                    client_id: 300,
                    clock: 2,
                    state: Some(json!({"cursor": 4})),
                },
                AwarenessEntry {
                    client_id: 7,
                    clock: 5,
                    state: None,
                },
            ],
        };
        let decoded = AwarenessUpdate::decode(&update.encode()).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_decode_rejects_bad_json() {
        let mut buf = Vec::new();
        write_var_uint(&mut buf, 1);
        write_var_uint(&mut buf, 1);
        write_var_uint(&mut buf, 0);
        write_var_string(&mut buf, "{not json");
        assert!(matches!(
            AwarenessUpdate::decode(&buf),
            Err(ProtocolError::InvalidAwareness(_))
        ));
        assert_eq!(AwarenessUpdate::decode(&[2, 1]), Err(ProtocolError::Truncated));
    }

    #[test]
    fn test_newer_clock_wins() {
        let mut alice = Awareness::new(1);
        let mut bob = Awareness::new(2);

        let first = alice.set_local_state(json!({"name": "alice"}));
        let second = alice.set_local_state(json!({"name": "alice", "cursor": 3}));

        assert_eq!(bob.apply(&second).added, vec![1]);
        // The older update arrives late and is ignored.
        assert!(bob.apply(&first).is_empty());
        assert_eq!(bob.get(1), Some(&json!({"name": "alice", "cursor": 3})));
    }

    #[test]
    fn test_removal_at_equal_clock_wins() {
        let mut alice = Awareness::new(1);
        let mut server = Awareness::relay();
        let mut bob = Awareness::new(2);

        let update = alice.set_local_state(json!({"name": "alice"}));
        server.apply(&update);
        bob.apply(&update);

        let removal = server.remove_clients(&[1]);
        assert_eq!(removal.entries[0].clock, 1);
        assert_eq!(bob.apply(&removal).removed, vec![1]);
        assert!(bob.states().is_empty());
    }

    #[test]
    fn test_full_update_skips_removed_clients() {
        let mut server = Awareness::relay();
        let mut alice = Awareness::new(1);
        let mut carol = Awareness::new(3);
        server.apply(&alice.set_local_state(json!("a")));
        server.apply(&carol.set_local_state(json!("c")));
        server.apply(&carol.clear_local_state());

        let full = server.full_update();
        assert_eq!(full.client_ids().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_own_state_is_not_overwritten() {
        let mut alice = Awareness::new(1);
        alice.set_local_state(json!("here"));
        let forged = AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: 1,
                clock: 99,
                state: None,
            }],
        };
        assert!(alice.apply(&forged).is_empty());
        assert_eq!(alice.local_state(), Some(&json!("here")));
    }

    #[test]
    fn test_relay_accepts_every_client_id() {
        let mut relay = Awareness::relay();
        let mut zero = Awareness::new(0);
        let update = zero.set_local_state(json!({"name": "zero"}));

        assert_eq!(relay.apply(&update).added, vec![0]);
        assert_eq!(relay.get(0), Some(&json!({"name": "zero"})));
        assert_eq!(relay.client_id(), None);
        assert!(relay.set_local_state(json!("ignored")).entries.is_empty());
        assert_eq!(relay.full_update().client_ids().collect::<Vec<_>>(), vec![0]);
    }
}
