use bson::oid::ObjectId;
use threadline_db::models::{
    Channel, ChannelType, Message, ModerationAction, ModerationRule,
};
use threadline_services::{CreateChannel, NewMessage, NewRule};

use super::test_env::TestEnv;

/// A channel with its owner and plain members.
pub struct SeededChannel {
    pub server_id: ObjectId,
    pub channel: Channel,
    pub owner: ObjectId,
    pub members: Vec<ObjectId>,
}

impl SeededChannel {
    pub fn id(&self) -> ObjectId {
        self.channel.id
    }

    pub fn member(&self, index: usize) -> ObjectId {
        self.members[index]
    }
}

impl TestEnv {
    /// Create a public channel owned by a fresh user, with `member_count`
    /// more fresh users joined as members.
    pub async fn seed_channel(&self, name: &str, member_count: usize) -> SeededChannel {
        self.seed_channel_in(ObjectId::new(), name, ChannelType::Public, member_count)
            .await
    }

    pub async fn seed_channel_in(
        &self,
        server_id: ObjectId,
        name: &str,
        channel_type: ChannelType,
        member_count: usize,
    ) -> SeededChannel {
        let owner = ObjectId::new();
        let members: Vec<ObjectId> = (0..member_count).map(|_| ObjectId::new()).collect();

        let channel = self
            .ledger()
            .create_channel(CreateChannel {
                server_id,
                channel_type,
                name: name.to_string(),
                description: None,
                creator_id: owner,
                participant_ids: members.clone(),
            })
            .await
            .expect("Failed to seed channel");

        SeededChannel {
            server_id,
            channel,
            owner,
            members,
        }
    }

    /// Post through the full moderated path.
    pub async fn post(&self, channel_id: ObjectId, author_id: ObjectId, content: &str) -> Message {
        self.conversation
            .submit_message(NewMessage::text(channel_id, author_id, content))
            .await
            .expect("Failed to post message")
            .message
    }

    pub async fn reply(
        &self,
        channel_id: ObjectId,
        author_id: ObjectId,
        reply_to: ObjectId,
        content: &str,
    ) -> Message {
        self.conversation
            .submit_message(NewMessage::text(channel_id, author_id, content).replying_to(reply_to))
            .await
            .expect("Failed to post reply")
            .message
    }

    pub async fn seed_rule(
        &self,
        server_id: ObjectId,
        pattern: &str,
        action: ModerationAction,
        severity: u32,
    ) -> ModerationRule {
        self.moderation()
            .create_rule(NewRule {
                server_id,
                name: format!("{action:?} {pattern}"),
                pattern: pattern.to_string(),
                action,
                severity,
                duration_secs: None,
            })
            .await
            .expect("Failed to seed rule")
    }
}
