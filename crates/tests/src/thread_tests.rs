use bson::oid::ObjectId;
use threadline_services::ErrorKind;
use tokio_test::assert_err;

use crate::fixtures::test_env::TestEnv;

#[tokio::test]
async fn threads_are_one_level_deep() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 1).await;
    let channel = seeded.id();

    let a = env.post(channel, seeded.owner, "A").await;
    let b = env.reply(channel, seeded.member(0), a.id, "B").await;
    let c = env.reply(channel, seeded.owner, b.id, "C").await;

    let thread_a = env.messages().get_thread(a.id, seeded.owner).await.unwrap();
    let ids: Vec<ObjectId> = thread_a.replies.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![b.id]);

    // C replies to a reply: its root is B, never A.
    assert_eq!(c.thread_root_id(), b.id);
    assert_ne!(c.thread_root_id(), a.id);
    assert_eq!(b.thread_root_id(), a.id);
    assert_eq!(a.thread_root_id(), a.id);

    let thread_b = env.messages().get_thread(b.id, seeded.owner).await.unwrap();
    assert_eq!(thread_b.root.id, b.id);
    assert_eq!(thread_b.replies.len(), 1);
    assert_eq!(thread_b.replies[0].id, c.id);
}

#[tokio::test]
async fn replies_are_listed_oldest_first_without_deleted() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;
    let channel = seeded.id();
    let root = env.post(channel, seeded.owner, "root").await;
    let first = env.reply(channel, seeded.owner, root.id, "1").await;
    let second = env.reply(channel, seeded.owner, root.id, "2").await;
    let third = env.reply(channel, seeded.owner, root.id, "3").await;
    env.messages()
        .soft_delete_message(second.id, seeded.owner)
        .await
        .unwrap();

    let thread = env.messages().get_thread(root.id, seeded.owner).await.unwrap();
    let ids: Vec<ObjectId> = thread.replies.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![first.id, third.id]);
}

#[tokio::test]
async fn thread_summary_counts_replies_participants_and_unread() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 2).await;
    let channel = seeded.id();
    let (alice, bob) = (seeded.member(0), seeded.member(1));

    let root = env.post(channel, seeded.owner, "topic").await;
    let r1 = env.reply(channel, alice, root.id, "me too").await;
    env.reply(channel, alice, root.id, "and another thing").await;
    let last = env.reply(channel, bob, root.id, "agreed").await;

    let summary = env
        .messages()
        .get_thread_summary(root.id, seeded.owner)
        .await
        .unwrap();
    assert_eq!(summary.root_id, root.id);
    assert_eq!(summary.reply_count, 3);
    assert_eq!(summary.participant_count, 3);
    assert_eq!(summary.latest_reply_id, Some(last.id));
    assert_eq!(summary.latest_reply_at, Some(last.created_at));
    // The owner's cursor sits on the root, which they posted.
    assert_eq!(summary.unread_count, 3);

    env.cursors().mark_read(channel, seeded.owner, r1.id).await.unwrap();
    let summary = env
        .messages()
        .get_thread_summary(root.id, seeded.owner)
        .await
        .unwrap();
    assert_eq!(summary.unread_count, 2);

    // Bob wrote the latest reply, so the whole thread is read for him.
    let summary = env.messages().get_thread_summary(root.id, bob).await.unwrap();
    assert_eq!(summary.unread_count, 0);
}

#[tokio::test]
async fn system_authors_are_not_participants() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;
    let system = env
        .conversation
        .post_system_message(seeded.id(), "welcome")
        .await
        .unwrap();
    env.reply(seeded.id(), seeded.owner, system.id, "thanks").await;

    let summary = env
        .messages()
        .get_thread_summary(system.id, seeded.owner)
        .await
        .unwrap();
    assert_eq!(summary.reply_count, 1);
    assert_eq!(summary.participant_count, 1);
}

#[tokio::test]
async fn empty_thread_summary() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;
    let root = env.post(seeded.id(), seeded.owner, "anyone?").await;

    let summary = env
        .messages()
        .get_thread_summary(root.id, seeded.owner)
        .await
        .unwrap();
    assert_eq!(summary.reply_count, 0);
    assert_eq!(summary.participant_count, 1);
    assert_eq!(summary.latest_reply_id, None);
    assert_eq!(summary.unread_count, 0);
}

#[tokio::test]
async fn outsiders_cannot_read_threads() {
    let env = TestEnv::spawn().await;
    let seeded = env.seed_channel("general", 0).await;
    let root = env.post(seeded.id(), seeded.owner, "members only").await;

    let err = assert_err!(env.messages().get_thread(root.id, ObjectId::new()).await);
    assert_eq!(err.kind(), ErrorKind::NotAMember);
    let err = assert_err!(env.messages().get_thread(ObjectId::new(), seeded.owner).await);
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
