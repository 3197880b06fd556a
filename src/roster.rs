use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::signaling::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub role: String,
}

/// Present participants, unique by id, in a display order that survives
/// updates: known entries keep their place, newcomers are appended.
#[derive(Debug, Default, Clone)]
pub struct Roster {
    entries: Vec<Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the roster with `update`. On duplicate ids within the update
    /// the last entry wins. Returns the ids that were not present before.
    pub fn apply_presence_update(&mut self, update: Vec<Participant>) -> Vec<UserId> {
        let mut order: Vec<UserId> = Vec::with_capacity(update.len());
        let mut latest: HashMap<UserId, Participant> = HashMap::with_capacity(update.len());
        for participant in update {
            if !latest.contains_key(&participant.user_id) {
                order.push(participant.user_id);
            }
            latest.insert(participant.user_id, participant);
        }

        let mut next = Vec::with_capacity(order.len());
        for existing in &self.entries {
            if let Some(updated) = latest.remove(&existing.user_id) {
                next.push(updated);
            }
        }
        let mut joined = Vec::new();
        for id in order {
            if let Some(newcomer) = latest.remove(&id) {
                joined.push(id);
                next.push(newcomer);
            }
        }

        self.entries = next;
        joined
    }

    pub fn apply_leave(&mut self, user: UserId) -> Option<Participant> {
        let index = self.entries.iter().position(|p| p.user_id == user)?;
        Some(self.entries.remove(index))
    }

    pub fn participants(&self) -> &[Participant] {
        &self.entries
    }

    pub fn ids(&self) -> impl Iterator<Item = UserId> + '_ {
        self.entries.iter().map(|p| p.user_id)
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.entries.iter().any(|p| p.user_id == user)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
