use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::{
    error::{ErrorKind, WriteFailure, RETRYABLE_WRITE_ERROR, TRANSIENT_TRANSACTION_ERROR},
    Collection, Database,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{PaginatedResult, PaginationParams, StoreError, StoreResult};

const DUPLICATE_KEY_CODE: i32 = 11000;

/// Maps a driver error onto the store taxonomy. Connectivity problems are
/// transient; a unique-index violation is reported as a duplicate of
/// `entity`.
pub fn classify(err: mongodb::error::Error, entity: &'static str) -> StoreError {
    if err.contains_label(TRANSIENT_TRANSACTION_ERROR) || err.contains_label(RETRYABLE_WRITE_ERROR)
    {
        return StoreError::Transient(err.to_string());
    }
    match *err.kind {
        ErrorKind::Write(WriteFailure::WriteError(ref write_error))
            if write_error.code == DUPLICATE_KEY_CODE =>
        {
            StoreError::DuplicateKey(entity)
        }
        ErrorKind::Command(ref command_error) if command_error.code == DUPLICATE_KEY_CODE => {
            StoreError::DuplicateKey(entity)
        }
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => StoreError::Transient(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

/// Typed access to one collection; `entity` names the record in errors.
pub struct BaseDao<T: Send + Sync> {
    collection: Collection<T>,
    entity: &'static str,
}

impl<T> BaseDao<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Unpin + Send + Sync,
{
    pub fn new(db: &Database, collection_name: &str, entity: &'static str) -> Self {
        Self {
            collection: db.collection::<T>(collection_name),
            entity,
        }
    }

    pub fn collection(&self) -> &Collection<T> {
        &self.collection
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn err(&self, err: mongodb::error::Error) -> StoreError {
        classify(err, self.entity)
    }

    pub async fn find_by_id<I: Into<bson::Bson>>(&self, id: I) -> StoreResult<T> {
        self.find_one(doc! { "_id": id.into() })
            .await?
            .ok_or(StoreError::NotFound(self.entity))
    }

    pub async fn find_one(&self, filter: Document) -> StoreResult<Option<T>> {
        self.collection
            .find_one(filter)
            .await
            .map_err(|e| self.err(e))
    }

    pub async fn find_one_sorted(&self, filter: Document, sort: Document) -> StoreResult<Option<T>> {
        self.collection
            .find_one(filter)
            .sort(sort)
            .await
            .map_err(|e| self.err(e))
    }

    pub async fn find_many(&self, filter: Document, sort: Option<Document>) -> StoreResult<Vec<T>> {
        let cursor = match sort {
            Some(sort) => self.collection.find(filter).sort(sort).await,
            None => self.collection.find(filter).await,
        }
        .map_err(|e| self.err(e))?;

        cursor.try_collect().await.map_err(|e| self.err(e))
    }

    pub async fn find_paginated(
        &self,
        filter: Document,
        sort: Document,
        params: &PaginationParams,
    ) -> StoreResult<PaginatedResult<T>> {
        let total = self
            .collection
            .count_documents(filter.clone())
            .await
            .map_err(|e| self.err(e))?;

        let cursor = self
            .collection
            .find(filter)
            .sort(sort)
            .skip(params.skip())
            .limit(params.per_page as i64)
            .await
            .map_err(|e| self.err(e))?;
        let items = cursor.try_collect().await.map_err(|e| self.err(e))?;

        Ok(PaginatedResult::new(items, total, params))
    }

    pub async fn insert_one(&self, record: &T) -> StoreResult<()> {
        self.collection
            .insert_one(record)
            .await
            .map_err(|e| self.err(e))?;
        debug!(entity = self.entity, "Inserted document");
        Ok(())
    }

    pub async fn insert_many(&self, records: &[T]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.collection
            .insert_many(records)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    /// Returns whether a document matched the filter.
    pub async fn update_one(&self, filter: Document, update: Document) -> StoreResult<bool> {
        let result = self
            .collection
            .update_one(filter, update)
            .await
            .map_err(|e| self.err(e))?;
        Ok(result.matched_count > 0)
    }

    pub async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
    ) -> StoreResult<Option<T>> {
        self.collection
            .find_one_and_update(filter, update)
            .return_document(mongodb::options::ReturnDocument::After)
            .await
            .map_err(|e| self.err(e))
    }

    pub async fn upsert_one(&self, filter: Document, update: Document) -> StoreResult<()> {
        self.collection
            .update_one(filter, update)
            .upsert(true)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    pub async fn replace_one(&self, filter: Document, record: &T) -> StoreResult<bool> {
        let result = self
            .collection
            .replace_one(filter, record)
            .await
            .map_err(|e| self.err(e))?;
        Ok(result.matched_count > 0)
    }

    pub async fn hard_delete(&self, filter: Document) -> StoreResult<u64> {
        let result = self
            .collection
            .delete_many(filter)
            .await
            .map_err(|e| self.err(e))?;
        Ok(result.deleted_count)
    }

    pub async fn count(&self, filter: Document) -> StoreResult<u64> {
        self.collection
            .count_documents(filter)
            .await
            .map_err(|e| self.err(e))
    }
}
