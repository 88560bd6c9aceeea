use bson::oid::ObjectId;
use threadline_db::models::MessageType;
use threadline_services::{
    ErrorKind, EventKind, InvalidState, NewAttachment, NewMessage, PaginationParams,
    ServiceError, Store,
};
use threadline_services::store::MessageFilter;
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::test_env::TestEnv;

fn attachment(name: &str) -> NewAttachment {
    NewAttachment {
        filename: name.to_string(),
        size: 1024,
        content_type: "image/png".to_string(),
        url: format!("https://files.example.test/{name}"),
        thumbnail_url: None,
    }
}

#[tokio::test]
async fn post_requires_membership() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;

    let err = assert_err!(
        env.messages()
            .post_message(NewMessage::text(seeded.id(), ObjectId::new(), "hi"))
            .await
    );
    assert!(matches!(err, ServiceError::NotAMember));

    let err = assert_err!(
        env.messages()
            .post_message(NewMessage::text(ObjectId::new(), seeded.owner, "hi"))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn empty_messages_are_rejected() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;

    for content in ["", "   \n\t"] {
        let err = assert_err!(
            env.messages()
                .post_message(NewMessage::text(seeded.id(), seeded.owner, content))
                .await
        );
        assert!(matches!(
            err,
            ServiceError::InvalidState(InvalidState::EmptyMessage)
        ));
    }
}

#[tokio::test]
async fn attachment_only_message_becomes_file() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;

    let message = env
        .messages()
        .post_message(
            NewMessage::text(seeded.id(), seeded.owner, "")
                .with_attachment(attachment("cat.png"))
                .with_attachment(attachment("dog.png")),
        )
        .await
        .unwrap();

    assert_eq!(message.message_type, MessageType::File);
    assert_eq!(message.attachments.len(), 2);
    assert!(message.attachments.iter().all(|a| a.message_id == message.id));
    let stored = env.store.find_attachments(message.id).await.unwrap();
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn content_length_is_capped() {
    let env = TestEnv::spawn_with_settings(|s| s.messaging.max_content_length = 5).await;
    let seeded = env.seed_channel("general", 0).await;

    assert_ok!(
        env.messages()
            .post_message(NewMessage::text(seeded.id(), seeded.owner, "héllo"))
            .await
    );
    let err = assert_err!(
        env.messages()
            .post_message(NewMessage::text(seeded.id(), seeded.owner, "hello!"))
            .await
    );
    assert!(matches!(
        err,
        ServiceError::InvalidState(InvalidState::ContentTooLong)
    ));
}

#[tokio::test]
async fn reply_target_must_be_live_and_local() {
    let env = TestEnv::spawn().await;
    let server = ObjectId::new();
    let here = env
        .seed_channel_in(server, "here", Default::default(), 0)
        .await;
    let there = env
        .seed_channel_in(server, "there", Default::default(), 0)
        .await;
    let elsewhere = env.post(there.id(), there.owner, "over here").await;
    let doomed = env.post(here.id(), here.owner, "soon gone").await;
    env.messages()
        .soft_delete_message(doomed.id, here.owner)
        .await
        .unwrap();

    for target in [elsewhere.id, doomed.id, ObjectId::new()] {
        let err = assert_err!(
            env.messages()
                .post_message(
                    NewMessage::text(here.id(), here.owner, "re").replying_to(target)
                )
                .await
        );
        assert!(matches!(
            err,
            ServiceError::InvalidState(InvalidState::InvalidReplyTarget)
        ));
    }
}

#[tokio::test]
async fn only_the_author_edits() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    let message = env.post(seeded.id(), seeded.member(0), "first draft").await;

    let err = assert_err!(
        env.messages()
            .edit_message(message.id, seeded.owner, "hijacked", None)
            .await
    );
    assert_eq!(err.kind(), ErrorKind::InsufficientRole);

    let mentioned = ObjectId::new();
    let edited = env
        .messages()
        .edit_message(message.id, seeded.member(0), "second draft", Some(vec![mentioned]))
        .await
        .unwrap();
    assert_eq!(edited.content, "second draft");
    assert_eq!(edited.mentions, vec![mentioned]);
    assert!(edited.edited_at.is_some());
    assert_eq!(edited.created_at, message.created_at);
}

#[tokio::test]
async fn deleted_and_system_messages_are_immutable() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;

    let system = env
        .conversation
        .post_system_message(seeded.id(), "channel created")
        .await
        .unwrap();
    assert!(system.author_id.is_none());
    let err = assert_err!(
        env.messages()
            .edit_message(system.id, seeded.owner, "tampered", None)
            .await
    );
    assert!(matches!(
        err,
        ServiceError::InvalidState(InvalidState::SystemMessageImmutable)
    ));

    let message = env.post(seeded.id(), seeded.owner, "regret").await;
    env.messages()
        .soft_delete_message(message.id, seeded.owner)
        .await
        .unwrap();
    let err = assert_err!(
        env.messages()
            .edit_message(message.id, seeded.owner, "undo", None)
            .await
    );
    assert!(matches!(
        err,
        ServiceError::InvalidState(InvalidState::MessageDeleted)
    ));
}

#[tokio::test]
async fn soft_delete_clears_content_but_keeps_identity() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    let message = env
        .messages()
        .post_message(
            NewMessage::text(seeded.id(), seeded.owner, "secret").with_attachment(attachment("a.png")),
        )
        .await
        .unwrap();
    env.reactions()
        .add_reaction(message.id, seeded.member(0), "👍")
        .await
        .unwrap();

    let deleted = env
        .messages()
        .soft_delete_message(message.id, seeded.owner)
        .await
        .unwrap();
    assert!(deleted.is_deleted);
    assert_eq!(deleted.id, message.id);
    assert_eq!(deleted.created_at, message.created_at);
    assert_eq!(deleted.content, "");
    assert!(deleted.attachments.is_empty());
    assert!(deleted.reaction_summary.is_empty());

    let fetched = env
        .messages()
        .get_message(message.id, seeded.member(0))
        .await
        .unwrap();
    assert!(fetched.is_deleted);
    assert!(env.store.find_reactions(message.id).await.unwrap().is_empty());
    // Attachment records outlive a soft delete.
    assert_eq!(env.store.find_attachments(message.id).await.unwrap().len(), 1);

    // Second delete is a quiet no-op.
    let again = env
        .messages()
        .soft_delete_message(message.id, seeded.owner)
        .await
        .unwrap();
    assert_eq!(again.deleted_at, deleted.deleted_at);
}

#[tokio::test]
async fn delete_requires_author_or_admin() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 2).await;
    let message = env.post(seeded.id(), seeded.member(0), "mine").await;

    let err = assert_err!(
        env.messages()
            .soft_delete_message(message.id, seeded.member(1))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::InsufficientRole);

    let deleted = env
        .messages()
        .soft_delete_message(message.id, seeded.owner)
        .await
        .unwrap();
    assert!(deleted.is_deleted);
}

#[tokio::test]
async fn purge_removes_message_and_dependents() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    let message = env
        .messages()
        .post_message(
            NewMessage::text(seeded.id(), seeded.member(0), "x").with_attachment(attachment("x.png")),
        )
        .await
        .unwrap();
    env.reactions()
        .add_reaction(message.id, seeded.owner, "🔥")
        .await
        .unwrap();

    let err = assert_err!(
        env.messages()
            .purge_message(message.id, seeded.member(0))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::InsufficientRole);

    env.messages()
        .purge_message(message.id, seeded.owner)
        .await
        .unwrap();
    let err = assert_err!(env.messages().get_message(message.id, seeded.owner).await);
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(env.store.find_attachments(message.id).await.unwrap().is_empty());
    assert!(env.store.find_reactions(message.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn channel_listing_is_top_level_newest_first() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;
    let first = env.post(seeded.id(), seeded.owner, "one").await;
    let second = env.post(seeded.id(), seeded.owner, "two").await;
    env.reply(seeded.id(), seeded.owner, first.id, "re: one").await;

    let page = env
        .messages()
        .list_channel_messages(seeded.id(), seeded.owner, &PaginationParams::default())
        .await
        .unwrap();
    let ids: Vec<ObjectId> = page.items.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);

    let channel = env.ledger().get_channel(seeded.id()).await.unwrap();
    assert_eq!(channel.message_count, 3);
    assert!(channel.last_activity_at.is_some());
}

#[tokio::test]
async fn post_is_published_to_the_channel() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;
    let mut rx = env.hub.subscribe(seeded.id());

    let message = env.post(seeded.id(), seeded.owner, "ping").await;
    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind, EventKind::MessageCreated);
    assert_eq!(event.data["id"], message.id.to_hex());
    assert_eq!(event.data["content"], "ping");
}

#[tokio::test]
async fn store_outage_surfaces_as_transient() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;

    env.store.set_unavailable(true);
    let err = assert_err!(
        env.messages()
            .post_message(NewMessage::text(seeded.id(), seeded.owner, "hello?"))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(err.is_transient());

    env.store.set_unavailable(false);
    assert_ok!(
        env.messages()
            .post_message(NewMessage::text(seeded.id(), seeded.owner, "hello!"))
            .await
    );
}

#[tokio::test]
async fn failed_attachment_write_discards_the_message() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;
    let post = || {
        NewMessage::text(seeded.id(), seeded.owner, "photo").with_attachment(attachment("cat.png"))
    };

    env.store.fail_next("insert_attachments", 1);
    let err = assert_err!(env.messages().post_message(post()).await);
    assert_eq!(err.kind(), ErrorKind::Transient);
    let stored = env
        .store
        .find_messages(&MessageFilter::channel(seeded.id()))
        .await
        .unwrap();
    assert!(stored.is_empty());

    // A retry posts exactly once.
    let message = assert_ok!(env.messages().post_message(post()).await);
    let stored = env
        .store
        .find_messages(&MessageFilter::channel(seeded.id()))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, message.id);
    assert_eq!(env.store.find_attachments(message.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn channel_activity_failure_keeps_the_post() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;

    env.store.fail_next("record_channel_activity", 1);
    let message = assert_ok!(
        env.messages()
            .post_message(NewMessage::text(seeded.id(), seeded.owner, "still here"))
            .await
    );
    let stored = env.store.get_message(message.id).await.unwrap();
    assert_eq!(stored.content, "still here");
}

#[tokio::test]
async fn cursor_failure_after_submit_keeps_one_message() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;

    env.store.fail_next("insert_receipt", 1);
    let outcome = assert_ok!(
        env.conversation
            .submit_message(NewMessage::text(seeded.id(), seeded.owner, "hello"))
            .await
    );
    assert!(outcome.violation.is_none());
    let stored = env
        .store
        .find_messages(&MessageFilter::channel(seeded.id()))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);

    let status = env
        .cursors()
        .get_channel_read_status(seeded.id(), seeded.member(0))
        .await
        .unwrap();
    assert_eq!(status.unread_count, 1);
}

#[test]
fn pagination_skip_saturates() {
    let params = PaginationParams {
        page: u64::MAX,
        per_page: 100,
    };
    assert_eq!(params.skip(), u64::MAX);
    assert_eq!(PaginationParams::new(3, 25).skip(), 50);
}
