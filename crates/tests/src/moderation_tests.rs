use bson::{oid::ObjectId, DateTime};
use threadline_db::models::{
    ChannelType, MemberRole, ModerationAction, ServerModerationSettings, ViolationStatus,
};
use threadline_services::moderation::check_message;
use threadline_services::{
    ErrorKind, EventKind, InvalidState, NewMessage, NewRule, Removal, ServiceError, Store,
};
use tokio_test::assert_err;

use crate::fixtures::test_env::TestEnv;

#[tokio::test]
async fn delete_rule_erases_the_message() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    let author = seeded.member(0);
    let rule = env
        .seed_rule(seeded.server_id, "forbidden", ModerationAction::Delete, 1)
        .await;
    env.seed_rule(seeded.server_id, "unrelated", ModerationAction::Ban, 0)
        .await;

    let message = env
        .messages()
        .post_message(NewMessage::text(seeded.id(), author, "this is Forbidden talk"))
        .await
        .unwrap();

    let rules = env.moderation().active_rules(seeded.server_id).await.unwrap();
    let matched = check_message(&message, &rules).unwrap();
    assert_eq!(matched.id, rule.id);

    let violation = env
        .moderation()
        .record_violation(matched, &message)
        .await
        .unwrap();
    assert_eq!(violation.status, ViolationStatus::Pending);
    assert!(!violation.action_taken);

    let violation = env.moderation().enforce(violation.id).await.unwrap();
    assert_eq!(violation.status, ViolationStatus::Resolved);
    assert!(violation.action_taken);
    assert!(violation.resolved_at.is_some());

    let stored = env.store.get_message(message.id).await.unwrap();
    assert!(stored.is_deleted);
    assert_eq!(stored.content, "");

    let all = env
        .moderation()
        .list_violations(seeded.server_id, None)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn submit_enforces_a_matching_delete_rule() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    env.seed_rule(seeded.server_id, "buy*now", ModerationAction::Delete, 1)
        .await;

    let outcome = env
        .conversation
        .submit_message(NewMessage::text(seeded.id(), seeded.member(0), "BUY gold NOW"))
        .await
        .unwrap();
    assert!(outcome.message.is_deleted);
    let violation = outcome.violation.unwrap();
    assert!(violation.action_taken);
    assert_eq!(violation.message_id, outcome.message.id);

    let clean = env
        .conversation
        .submit_message(NewMessage::text(seeded.id(), seeded.member(0), "hello"))
        .await
        .unwrap();
    assert!(clean.violation.is_none());
    assert!(!clean.message.is_deleted);
}

#[tokio::test]
async fn lowest_severity_rule_alone_is_applied() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    let author = seeded.member(0);
    env.seed_rule(seeded.server_id, "spam", ModerationAction::Delete, 5)
        .await;
    let warn = env
        .seed_rule(seeded.server_id, "spa*", ModerationAction::Warn, 1)
        .await;

    let outcome = env
        .conversation
        .submit_message(NewMessage::text(seeded.id(), author, "spam spam spam"))
        .await
        .unwrap();
    let violation = outcome.violation.unwrap();
    assert_eq!(violation.rule_id, warn.id);
    assert_eq!(violation.action, ModerationAction::Warn);
    assert!(!outcome.message.is_deleted);

    let all = env
        .moderation()
        .list_violations(seeded.server_id, None)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(
        env.moderation()
            .get_warning_count(seeded.server_id, author)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn warnings_are_counted_not_escalated() {
    let env = TestEnv::spawn_with_settings(|s| s.moderation.max_warnings = 2).await;
    let seeded = env.seed_channel("general", 1).await;
    let author = seeded.member(0);
    env.seed_rule(seeded.server_id, "darn", ModerationAction::Warn, 1)
        .await;

    for _ in 0..2 {
        env.post(seeded.id(), author, "darn it").await;
    }
    let status = env
        .moderation()
        .warning_status(seeded.server_id, author)
        .await
        .unwrap();
    assert_eq!(status.count, 2);
    assert_eq!(status.max_warnings, 2);
    assert!(!status.exceeded);

    env.post(seeded.id(), author, "darn again").await;
    let status = env
        .moderation()
        .warning_status(seeded.server_id, author)
        .await
        .unwrap();
    assert_eq!(status.count, 3);
    assert!(status.exceeded);
    // Reporting only: nobody muted or banned the author.
    assert!(!env.ledger().is_restricted(seeded.id(), author).await.unwrap());
}

#[tokio::test]
async fn warnings_expire_with_the_server_window() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    let author = seeded.member(0);
    env.moderation()
        .set_server_settings(ServerModerationSettings {
            server_id: seeded.server_id,
            max_warnings: 5,
            warning_expiry_secs: 0,
            default_mute_secs: 60,
            updated_at: DateTime::now(),
        })
        .await
        .unwrap();
    env.seed_rule(seeded.server_id, "oops", ModerationAction::Warn, 1)
        .await;

    let outcome = env
        .conversation
        .submit_message(NewMessage::text(seeded.id(), author, "oops"))
        .await
        .unwrap();
    assert!(outcome.violation.unwrap().action_taken);

    let status = env
        .moderation()
        .warning_status(seeded.server_id, author)
        .await
        .unwrap();
    assert_eq!(status.count, 0);
    assert_eq!(status.max_warnings, 5);
}

#[tokio::test]
async fn mute_rule_restricts_the_author() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    let author = seeded.member(0);
    env.moderation()
        .create_rule(NewRule {
            server_id: seeded.server_id,
            name: "shouting".to_string(),
            pattern: "!!!".to_string(),
            action: ModerationAction::Mute,
            severity: 1,
            duration_secs: Some(600),
        })
        .await
        .unwrap();

    let before = DateTime::now().timestamp_millis();
    let outcome = env
        .conversation
        .submit_message(NewMessage::text(seeded.id(), author, "LISTEN!!!"))
        .await
        .unwrap();
    assert!(outcome.violation.unwrap().action_taken);

    let member = env.ledger().get_member(seeded.id(), author).await.unwrap();
    assert!(member.is_muted);
    let until = member.muted_until.unwrap().timestamp_millis();
    assert!(until >= before + 600_000);

    let err = assert_err!(
        env.conversation
            .submit_message(NewMessage::text(seeded.id(), author, "sorry"))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Restricted);
}

#[tokio::test]
async fn ban_removes_the_author_server_wide() {
    let env = TestEnv::spawn().await;
    let server = ObjectId::new();
    let seeded = env
        .seed_channel_in(server, "general", ChannelType::Public, 1)
        .await;
    let other = env
        .seed_channel_in(server, "random", ChannelType::Public, 0)
        .await;
    let author = seeded.member(0);
    env.ledger()
        .add_member(other.id(), author, author, MemberRole::Member)
        .await
        .unwrap();
    env.seed_rule(server, "scam", ModerationAction::Ban, 1).await;

    let outcome = env
        .conversation
        .submit_message(NewMessage::text(seeded.id(), author, "totally not a scam"))
        .await
        .unwrap();
    assert_eq!(outcome.violation.unwrap().status, ViolationStatus::Resolved);

    assert!(!env.ledger().is_member(seeded.id(), author).await.unwrap());
    assert!(env.ledger().active_ban(server, author).await.unwrap().is_some());
    assert!(env.ledger().is_restricted(other.id(), author).await.unwrap());

    let err = assert_err!(
        env.ledger()
            .add_member(seeded.id(), author, author, MemberRole::Member)
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Restricted);
}

#[tokio::test]
async fn failed_enforcement_keeps_message_and_violation() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;
    env.seed_rule(seeded.server_id, "boom", ModerationAction::Ban, 1)
        .await;

    // The owner cannot be expelled, so the ban cannot land.
    let outcome = env
        .conversation
        .submit_message(NewMessage::text(seeded.id(), seeded.owner, "boom"))
        .await
        .unwrap();
    assert!(!outcome.message.is_deleted);
    let violation = outcome.violation.unwrap();
    assert_eq!(violation.status, ViolationStatus::Failed);
    assert!(!violation.action_taken);
    assert_eq!(violation.attempts, 1);
    assert!(violation.failure_reason.is_some());
    assert!(env.ledger().active_ban(seeded.server_id, seeded.owner).await.unwrap().is_none());

    let err = assert_err!(env.moderation().enforce(violation.id).await);
    assert!(matches!(
        err,
        ServiceError::EnforcementFailed { violation_id, .. } if violation_id == violation.id
    ));
    let stored = env.store.get_violation(violation.id).await.unwrap();
    assert_eq!(stored.attempts, 2);
    assert_eq!(stored.status, ViolationStatus::Failed);
}

#[tokio::test]
async fn failed_violations_can_be_retried() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    let author = seeded.member(0);
    let rule = env
        .seed_rule(seeded.server_id, "flood", ModerationAction::Mute, 1)
        .await;

    let message = env.post(seeded.id(), seeded.owner, "warm up").await;
    let message = env
        .messages()
        .post_message(NewMessage::text(seeded.id(), author, "flood").replying_to(message.id))
        .await
        .unwrap();
    let violation = env
        .moderation()
        .record_violation(&rule, &message)
        .await
        .unwrap();

    // Without a membership there is nothing to mute.
    env.ledger()
        .remove_member(seeded.id(), author, author, Removal::Leave)
        .await
        .unwrap();
    let err = assert_err!(env.moderation().enforce(violation.id).await);
    assert_eq!(err.kind(), ErrorKind::EnforcementFailed);

    env.ledger()
        .add_member(seeded.id(), author, author, MemberRole::Member)
        .await
        .unwrap();
    let retried = env
        .moderation()
        .retry_failed(seeded.server_id)
        .await
        .unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].status, ViolationStatus::Resolved);
    assert!(retried[0].action_taken);
    assert_eq!(retried[0].attempts, 2);
    assert!(env.ledger().is_restricted(seeded.id(), author).await.unwrap());

    // Resolved violations are left alone.
    let again = env.moderation().enforce(violation.id).await.unwrap();
    assert_eq!(again.attempts, 2);
    assert!(
        env.moderation()
            .retry_failed(seeded.server_id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn transient_failures_propagate_unchanged() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    let rule = env
        .seed_rule(seeded.server_id, "x", ModerationAction::Warn, 1)
        .await;
    let message = env
        .messages()
        .post_message(NewMessage::text(seeded.id(), seeded.member(0), "x"))
        .await
        .unwrap();
    let violation = env
        .moderation()
        .record_violation(&rule, &message)
        .await
        .unwrap();

    env.store.set_unavailable(true);
    let err = assert_err!(env.moderation().enforce(violation.id).await);
    assert_eq!(err.kind(), ErrorKind::Transient);
    env.store.set_unavailable(false);

    let resolved = env.moderation().enforce(violation.id).await.unwrap();
    assert_eq!(resolved.status, ViolationStatus::Resolved);
}

#[tokio::test]
async fn rule_writes_refresh_the_cache() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;
    let message = env
        .messages()
        .post_message(NewMessage::text(seeded.id(), seeded.owner, "heck"))
        .await
        .unwrap();
    let moderation = env.moderation();

    assert!(moderation.evaluate(seeded.server_id, &message).await.unwrap().is_none());

    let rule = env
        .seed_rule(seeded.server_id, "HECK", ModerationAction::Warn, 1)
        .await;
    let hit = moderation.evaluate(seeded.server_id, &message).await.unwrap();
    assert_eq!(hit.map(|r| r.id), Some(rule.id));

    moderation.set_rule_active(rule.id, false).await.unwrap();
    assert!(moderation.evaluate(seeded.server_id, &message).await.unwrap().is_none());
    assert_eq!(moderation.list_rules(seeded.server_id).await.unwrap().len(), 1);

    // Other servers are unaffected.
    assert!(moderation.evaluate(ObjectId::new(), &message).await.unwrap().is_none());
}

#[tokio::test]
async fn patterns_need_literal_text() {
    let env = TestEnv::spawn().await;
    let err = assert_err!(
        env.moderation()
            .create_rule(NewRule {
                server_id: ObjectId::new(),
                name: "everything".to_string(),
                pattern: "**".to_string(),
                action: ModerationAction::Delete,
                severity: 1,
                duration_secs: None,
            })
            .await
    );
    assert!(matches!(
        err,
        ServiceError::InvalidState(InvalidState::InvalidRulePattern)
    ));
}

#[tokio::test]
async fn enforcement_is_published() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    env.seed_rule(seeded.server_id, "nope", ModerationAction::Delete, 1)
        .await;
    let mut rx = env.hub.subscribe(seeded.id());

    env.post(seeded.id(), seeded.member(0), "nope").await;

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::MessageCreated));
    assert!(kinds.contains(&EventKind::MessageDeleted));
    assert_eq!(kinds.last(), Some(&EventKind::ModerationAction));
}
