//! Group messaging: participant state machines and their registry.

pub mod machine;
pub mod participant;

use std::collections::HashMap;

use tokio::sync::Mutex;

use bitdust_shared::types::{GlobalId, QueueId};

use participant::GroupParticipantHandle;

/// Identifier-keyed registry of active participants. Subsystems pass
/// group key ids around, never participant references; only this
/// registry holds the handles.
#[derive(Default)]
pub struct GroupRegistry {
    participants: Mutex<HashMap<GlobalId, GroupParticipantHandle>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, group_key_id: GlobalId, handle: GroupParticipantHandle) {
        self.participants
            .lock()
            .await
            .insert(group_key_id, handle);
    }

    pub async fn get(&self, group_key_id: &GlobalId) -> Option<GroupParticipantHandle> {
        self.participants.lock().await.get(group_key_id).cloned()
    }

    pub async fn remove(&self, group_key_id: &GlobalId) -> Option<GroupParticipantHandle> {
        self.participants.lock().await.remove(group_key_id)
    }

    pub async fn list(&self) -> Vec<GlobalId> {
        self.participants.lock().await.keys().cloned().collect()
    }

    /// The participant consuming a queue, resolved by alias and owner.
    pub async fn for_queue(&self, queue_id: &QueueId) -> Option<GroupParticipantHandle> {
        let participants = self.participants.lock().await;
        participants
            .iter()
            .find(|(key_id, _)| {
                key_id.key_alias == queue_id.queue_alias && key_id.user == queue_id.owner
            })
            .map(|(_, handle)| handle.clone())
    }

    /// Rotation: pull every participant keyed under `old_user` out of
    /// the registry. The caller shuts them down; they respawn under the
    /// renamed key on the next join.
    pub async fn remove_user(
        &self,
        old_user: &bitdust_shared::types::GlobalUser,
    ) -> Vec<(GlobalId, GroupParticipantHandle)> {
        let mut participants = self.participants.lock().await;
        let to_remove: Vec<GlobalId> = participants
            .keys()
            .filter(|k| k.user == *old_user)
            .cloned()
            .collect();
        to_remove
            .into_iter()
            .filter_map(|key| participants.remove(&key).map(|h| (key, h)))
            .collect()
    }
}
