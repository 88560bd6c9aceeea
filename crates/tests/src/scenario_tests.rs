use bson::oid::ObjectId;
use threadline_db::models::{ChannelType, MemberRole, ModerationAction, ViolationStatus};
use threadline_services::moderation::check_message;
use threadline_services::{CreateChannel, NewMessage, ReactionCount, Store};

use crate::fixtures::test_env::TestEnv;

#[tokio::test]
async fn general_channel_read_and_react() -> anyhow::Result<()> {
    let env = TestEnv::spawn().await;
    let server = ObjectId::new();
    let u1 = ObjectId::new();
    let u2 = ObjectId::new();

    let general = env
        .ledger()
        .create_channel(CreateChannel {
            server_id: server,
            channel_type: ChannelType::Public,
            name: "general".to_string(),
            description: None,
            creator_id: u1,
            participant_ids: Vec::new(),
        })
        .await?;
    assert!(env.ledger().is_owner(general.id, u1).await?);

    env.ledger()
        .add_member(general.id, u1, u2, MemberRole::Member)
        .await?;

    let hello = env
        .conversation
        .submit_message(NewMessage::text(general.id, u1, "hello"))
        .await?
        .message;
    env.reactions().add_reaction(hello.id, u2, "👍").await?;
    env.cursors().mark_read(general.id, u2, hello.id).await?;

    let status = env.cursors().get_channel_read_status(general.id, u2).await?;
    assert_eq!(status.unread_count, 0);

    let counts = env.reactions().count_reactions(hello.id, u1).await?;
    assert_eq!(
        counts,
        vec![ReactionCount {
            emoji: "👍".to_string(),
            count: 1,
            has_reacted: false,
        }]
    );
    Ok(())
}

#[tokio::test]
async fn delete_rule_scenario() -> anyhow::Result<()> {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    let rule = env
        .seed_rule(seeded.server_id, "forbidden", ModerationAction::Delete, 3)
        .await;

    let draft = env
        .messages()
        .prepare(NewMessage::text(seeded.id(), seeded.member(0), "forbidden words"))
        .await?;
    let active = env.moderation().active_rules(seeded.server_id).await?;
    let matches: Vec<_> = active
        .iter()
        .filter(|r| check_message(&draft, std::slice::from_ref(*r)).is_some())
        .collect();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].id, rule.id);

    let outcome = env
        .conversation
        .submit_message(NewMessage::text(seeded.id(), seeded.member(0), "forbidden words"))
        .await?;
    let violation = outcome.violation.expect("violation recorded");
    assert!(violation.action_taken);
    assert_eq!(violation.status, ViolationStatus::Resolved);

    let stored = env.store.get_message(outcome.message.id).await?;
    assert!(stored.is_deleted);
    Ok(())
}

#[tokio::test]
async fn conversation_lifecycle() -> anyhow::Result<()> {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("team", 2).await;
    let (alice, bob) = (seeded.member(0), seeded.member(1));
    let channel = seeded.id();

    let question = env.post(channel, alice, "who owns the release?").await;
    let answer = env.reply(channel, bob, question.id, "I do").await;
    env.reply(channel, seeded.owner, question.id, "thanks bob").await;
    env.reactions().add_reaction(answer.id, alice, "🙏").await?;

    let summary = env.messages().get_thread_summary(question.id, alice).await?;
    assert_eq!(summary.reply_count, 2);
    assert_eq!(summary.participant_count, 3);
    assert_eq!(summary.unread_count, 2);

    let status = env.cursors().get_channel_read_status(channel, alice).await?;
    assert_eq!(status.unread_count, 2);
    env.cursors().mark_all_read(channel, alice).await?;
    let summary = env.messages().get_thread_summary(question.id, alice).await?;
    assert_eq!(summary.unread_count, 0);

    env.messages().soft_delete_message(answer.id, bob).await?;
    let thread = env.messages().get_thread(question.id, alice).await?;
    assert_eq!(thread.replies.len(), 1);
    assert!(env.store.find_reactions(answer.id).await?.is_empty());
    Ok(())
}
