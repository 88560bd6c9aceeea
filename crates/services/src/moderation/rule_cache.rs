use std::sync::Arc;

use bson::oid::ObjectId;
use dashmap::DashMap;
use threadline_db::models::ModerationRule;

/// Active rules per server, in evaluation order. Entries are dropped on any
/// rule write for that server and reloaded on the next read.
#[derive(Default)]
pub struct RuleCache {
    rules: DashMap<ObjectId, Arc<Vec<ModerationRule>>>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, server_id: ObjectId) -> Option<Arc<Vec<ModerationRule>>> {
        self.rules.get(&server_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn insert(
        &self,
        server_id: ObjectId,
        rules: Vec<ModerationRule>,
    ) -> Arc<Vec<ModerationRule>> {
        let rules = Arc::new(rules);
        self.rules.insert(server_id, Arc::clone(&rules));
        rules
    }

    pub fn invalidate(&self, server_id: ObjectId) {
        self.rules.remove(&server_id);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
