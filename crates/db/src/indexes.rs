use bson::{Document, doc};
use mongodb::{Database, IndexModel, options::IndexOptions};
use tracing::info;

use crate::models::{
    Attachment, Channel, ChannelMember, ChannelReadStatus, Message, ModerationRule,
    ModerationViolation, Reaction, ReadReceipt, ServerBan, Warning,
};

/// Every collection with the index set its query paths rely on.
fn index_plan() -> Vec<(&'static str, Vec<IndexModel>)> {
    vec![
        (
            Channel::COLLECTION,
            vec![
                plain(doc! { "server_id": 1, "channel_type": 1 }),
                // one direct channel per participant pair
                unique_when(
                    doc! { "server_id": 1, "name": 1 },
                    doc! { "channel_type": "direct" },
                ),
            ],
        ),
        (
            ChannelMember::COLLECTION,
            vec![
                unique(doc! { "channel_id": 1, "user_id": 1 }),
                plain(doc! { "user_id": 1 }),
            ],
        ),
        (
            Message::COLLECTION,
            vec![
                // (created_at, _id) is the channel ordering key
                plain(doc! { "channel_id": 1, "created_at": -1, "_id": -1 }),
                plain(doc! { "reply_to": 1, "created_at": 1 }),
                plain(doc! { "author_id": 1, "created_at": -1 }),
                plain(doc! { "mentions": 1 }),
            ],
        ),
        (Attachment::COLLECTION, vec![plain(doc! { "message_id": 1 })]),
        (
            Reaction::COLLECTION,
            vec![unique(doc! { "message_id": 1, "emoji": 1, "user_id": 1 })],
        ),
        (
            ReadReceipt::COLLECTION,
            vec![plain(doc! {
                "channel_id": 1,
                "user_id": 1,
                "message_created_at": -1,
                "message_id": -1,
            })],
        ),
        (
            ChannelReadStatus::COLLECTION,
            vec![unique(doc! { "channel_id": 1, "user_id": 1 })],
        ),
        (
            ModerationRule::COLLECTION,
            vec![plain(doc! {
                "server_id": 1,
                "is_active": 1,
                "severity": 1,
                "created_at": 1,
            })],
        ),
        (
            ModerationViolation::COLLECTION,
            vec![
                plain(doc! { "server_id": 1, "status": 1 }),
                plain(doc! { "message_id": 1 }),
            ],
        ),
        (
            Warning::COLLECTION,
            vec![
                plain(doc! { "server_id": 1, "user_id": 1, "expires_at": 1 }),
                // one warning per enforced violation
                unique(doc! { "violation_id": 1 }),
            ],
        ),
        (
            ServerBan::COLLECTION,
            vec![
                plain(doc! { "server_id": 1, "user_id": 1 }),
                // manual bans carry no violation id
                unique_when(
                    doc! { "violation_id": 1 },
                    doc! { "violation_id": { "$type": "objectId" } },
                ),
            ],
        ),
    ]
}

pub async fn ensure_indexes(db: &Database) -> Result<(), mongodb::error::Error> {
    for (collection, models) in index_plan() {
        let count = models.len();
        db.collection::<Document>(collection)
            .create_indexes(models)
            .await?;
        info!(collection, count, "Indexes ensured");
    }
    Ok(())
}

fn plain(keys: Document) -> IndexModel {
    IndexModel::builder().keys(keys).build()
}

fn unique(keys: Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).build())
        .build()
}

fn unique_when(keys: Document, filter: Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(
            IndexOptions::builder()
                .unique(true)
                .partial_filter_expression(filter)
                .build(),
        )
        .build()
}
