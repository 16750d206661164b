//! src/services/link_promotion.rs
//!
//! Keeps the canonical/link invariant when a canonical object is deleted.
//!
//! The earliest-indexed dependent link receives a copy of the canonical
//! bytes and loses its `original-key`, making it the new canonical record.
//! Every other dependent is moved onto the promoted object, in the catalog
//! and in the blob store's own link pointer. No link is left pointing at the
//! object being removed.

use crate::{
    models::file_record::ORIGINAL_KEY,
    services::{
        blob_store::BlobError,
        dedup_engine::{
            DedupStorageEngine, EngineResult, FIELD_ORIGINAL_KEY, StoredRecord, blob_error,
        },
    },
};
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PromotionOutcome {
    pub promoted: Option<String>,
    pub repointed: usize,
}

impl DedupStorageEngine {
    /// Promote a dependent of `canonical` before `canonical` goes away.
    ///
    /// Does nothing when no record links to it.
    pub(crate) async fn promote_dependents(
        &self,
        canonical: &StoredRecord,
    ) -> EngineResult<PromotionOutcome> {
        let key = canonical.record.object_key.as_str();
        let dependents: Vec<StoredRecord> = self
            .search(FIELD_ORIGINAL_KEY, key)
            .await?
            .into_iter()
            .filter(|dependent| dependent.id != canonical.id)
            .collect();

        let Some((heir, rest)) = dependents.split_first() else {
            debug!(object_key = key, "no dependent links");
            return Ok(PromotionOutcome::default());
        };
        let heir_key = heir.record.object_key.clone();

        let body = self
            .blobs
            .get_body(key)
            .await
            .map_err(blob_error("read canonical body", key))?;
        self.blobs
            .put_body(&heir_key, body)
            .await
            .map_err(blob_error("copy canonical body", heir_key.as_str()))?;
        self.update_metadata_field(&heir.id, ORIGINAL_KEY, Value::Null)
            .await?;
        info!(from = key, to = %heir_key, "promoted link to canonical");

        for link in rest {
            let link_key = link.record.object_key.as_str();
            self.update_metadata_field(&link.id, ORIGINAL_KEY, Value::String(heir_key.clone()))
                .await?;

            match self.blobs.repoint_link(link_key, &heir_key).await {
                Ok(()) => {}
                Err(err @ (BlobError::ObjectNotFound { .. } | BlobError::NotALink(_))) => {
                    warn!(link = link_key, "blob pointer not updated: {}", err);
                }
                Err(err) => return Err(blob_error("repoint link", link_key)(err)),
            }
            info!(link = link_key, to = %heir_key, "re-pointed link");
        }

        Ok(PromotionOutcome {
            promoted: Some(heir_key),
            repointed: rest.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::services::{
        blob_store::BlobStore,
        dedup_engine::EngineError,
        test_support::{FaultyBlobStore, TestEnv, env},
    };
    use futures::TryStreamExt;

    async fn download(env: &TestEnv, bucket: &str, name: &str) -> Vec<u8> {
        let download = env.engine.download(name, bucket).await.unwrap();
        let bytes = tokio::fs::read(&download.path).await.unwrap();
        tokio::fs::remove_file(&download.path).await.unwrap();
        bytes
    }

    #[tokio::test]
    async fn single_link_is_promoted() {
        let env = env().await;
        let a = env.stage("a.txt", b"survivor").await;
        let b = env.stage("b.txt", b"survivor").await;
        env.engine.upload(&a, "alice", None).await.unwrap();
        env.engine.upload(&b, "bob", None).await.unwrap();

        let receipt = env.engine.delete("a.txt", "alice").await.unwrap();
        assert_eq!(receipt.to_string(), "File 'alice/a.txt' deleted.");
        assert_eq!(receipt.promoted.as_deref(), Some("bob/b.txt"));
        assert_eq!(receipt.repointed, 0);

        let promoted = env.engine.find_record("bob", "b.txt").await.unwrap().unwrap();
        assert!(promoted.record.is_canonical());
        assert_eq!(env.blobs.resolve_link("bob", "b.txt").await.unwrap(), None);
        assert_eq!(download(&env, "bob", "b.txt").await, b"survivor");

        assert!(env.engine.find_record("alice", "a.txt").await.unwrap().is_none());
        assert!(!env.blobs.exists("alice", "a.txt").await.unwrap());
        assert_eq!(env.payload_files().await, 1);
    }

    #[tokio::test]
    async fn many_links_promote_first_and_repoint_rest() {
        let env = env().await;
        let original = env.stage("a.txt", b"fan out").await;
        env.engine.upload(&original, "alice", None).await.unwrap();
        for (bucket, name) in [("bob", "b1.txt"), ("alice", "b2.txt"), ("bob", "b3.txt")] {
            let src = env.stage(name, b"fan out").await;
            env.engine.upload(&src, bucket, None).await.unwrap();
        }

        let receipt = env.engine.delete("a.txt", "alice").await.unwrap();
        assert_eq!(receipt.promoted.as_deref(), Some("bob/b1.txt"));
        assert_eq!(receipt.repointed, 2);

        let heir = env.engine.find_record("bob", "b1.txt").await.unwrap().unwrap();
        assert!(heir.record.is_canonical());
        for (bucket, name) in [("alice", "b2.txt"), ("bob", "b3.txt")] {
            let link = env.engine.find_record(bucket, name).await.unwrap().unwrap();
            assert_eq!(link.record.original_key(), Some("bob/b1.txt"));
            assert_eq!(
                env.blobs.resolve_link(bucket, name).await.unwrap().as_deref(),
                Some("bob/b1.txt")
            );
        }

        for (bucket, name) in [("bob", "b1.txt"), ("alice", "b2.txt"), ("bob", "b3.txt")] {
            assert_eq!(download(&env, bucket, name).await, b"fan out");
        }

        let listing: Vec<_> = env
            .engine
            .list("alice", None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].size_bytes, 7);
    }

    #[tokio::test]
    async fn promoted_copy_can_itself_be_deleted() {
        let env = env().await;
        for (bucket, name) in [("alice", "a.txt"), ("bob", "b.txt"), ("bob", "c.txt")] {
            let src = env.stage(name, b"chain").await;
            env.engine.upload(&src, bucket, None).await.unwrap();
        }

        env.engine.delete("a.txt", "alice").await.unwrap();
        let receipt = env.engine.delete("b.txt", "bob").await.unwrap();
        assert_eq!(receipt.promoted.as_deref(), Some("bob/c.txt"));
        assert_eq!(receipt.repointed, 0);

        let last = env.engine.find_record("bob", "c.txt").await.unwrap().unwrap();
        assert!(last.record.is_canonical());
        assert_eq!(download(&env, "bob", "c.txt").await, b"chain");

        let again = env.stage("d.txt", b"chain").await;
        let outcome = env.engine.upload(&again, "alice", None).await.unwrap();
        assert_eq!(outcome.object_key, "bob/c.txt");
    }

    #[tokio::test]
    async fn failed_promotion_copy_aborts_delete() {
        let env = env().await;
        let a = env.stage("a.txt", b"keep me").await;
        let b = env.stage("b.txt", b"keep me").await;
        env.engine.upload(&a, "alice", None).await.unwrap();
        env.engine.upload(&b, "bob", None).await.unwrap();

        let mut blobs = FaultyBlobStore::new(env.blobs.clone());
        blobs.fail_put_body = true;
        let engine = env.engine_with(blobs);

        let err = engine.delete("a.txt", "alice").await.unwrap_err();
        assert!(matches!(err, EngineError::Blob { .. }));
        assert!(!err.is_not_found());

        let canonical = env.engine.find_record("alice", "a.txt").await.unwrap().unwrap();
        assert!(canonical.record.is_canonical());
        let link = env.engine.find_record("bob", "b.txt").await.unwrap().unwrap();
        assert_eq!(link.record.original_key(), Some("alice/a.txt"));

        assert!(env.blobs.exists("alice", "a.txt").await.unwrap());
        assert_eq!(
            env.blobs.resolve_link("bob", "b.txt").await.unwrap().as_deref(),
            Some("alice/a.txt")
        );
        assert_eq!(env.payload_files().await, 1);
        assert_eq!(download(&env, "bob", "b.txt").await, b"keep me");
    }
}
