//! Test utilities for `BlockServer` implementations.
//!
//! # Usage
//!
//! In your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! tlf_core = { workspace = true, features = ["testutil"] }
//! ```
//!
//! In your test file:
//!
//! ```ignore
//! use tlf_core::testutil::BlockServerTests;
//!
//! #[tokio::test]
//! async fn test_my_block_server() {
//!     let server = MyBlockServer::new(...);
//!     BlockServerTests::new(&server).run_all().await.unwrap();
//! }
//! ```

use crate::block::{BlockContext, BlockId, KeyServerHalf};
use crate::error::{TlfError, classify};
use crate::ids::{TlfId, UserId};
use crate::server::BlockServer;
use crate::TlfResult;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Conformance suite for `BlockServer` implementations.
pub struct BlockServerTests<'a, S> {
    server: &'a S,
    tlf: TlfId,
    uid: UserId,
}

impl<'a, S: BlockServer> BlockServerTests<'a, S> {
    /// Each suite uses a fresh random folder to avoid clashing with other data.
    pub fn new(server: &'a S) -> Self {
        Self {
            server,
            tlf: TlfId::random(),
            uid: UserId::random(),
        }
    }

    /// Run all tests.
    pub async fn run_all(&self) -> TlfResult<()> {
        self.test_put_get().await?;
        self.test_get_missing().await?;
        self.test_hash_mismatch().await?;
        self.test_reference_counting().await?;
        self.test_archive().await?;
        Ok(())
    }

    fn block(&self, payload: &'static [u8]) -> (BlockId, BlockContext, Bytes, KeyServerHalf) {
        let buf = Bytes::from_static(payload);
        (
            BlockId::from_payload(&buf),
            BlockContext::first(self.uid),
            buf,
            KeyServerHalf::random(),
        )
    }

    /// A put block is readable with the same payload and server half.
    pub async fn test_put_get(&self) -> TlfResult<()> {
        let (id, ctx, buf, half) = self.block(b"put-get payload");
        self.server
            .put(self.tlf, id, ctx, buf.clone(), half)
            .await?;

        let (got, got_half) = self.server.get(self.tlf, id, ctx).await?;
        assert_eq!(got, buf, "payload should match");
        assert_eq!(got_half, half, "server half should match");

        // An identical second put is accepted.
        self.server.put(self.tlf, id, ctx, buf, half).await?;
        Ok(())
    }

    /// A missing block is reported as non-existent, not as a storage error.
    pub async fn test_get_missing(&self) -> TlfResult<()> {
        let (id, ctx, _, _) = self.block(b"never stored");
        let err = self
            .server
            .get(self.tlf, id, ctx)
            .await
            .expect_err("missing block must not be returned");
        assert!(
            matches!(classify(&err), Some(TlfError::BlockNonExistent(_))),
            "unexpected error: {err:#}"
        );
        Ok(())
    }

    /// Payloads that don't hash to their ID are rejected.
    pub async fn test_hash_mismatch(&self) -> TlfResult<()> {
        let (id, ctx, _, half) = self.block(b"claimed payload");
        let result = self
            .server
            .put(self.tlf, id, ctx, Bytes::from_static(b"other payload"), half)
            .await;
        assert!(result.is_err(), "hash mismatch must be rejected");
        Ok(())
    }

    /// Extra references keep a block alive until all are removed.
    pub async fn test_reference_counting(&self) -> TlfResult<()> {
        let (id, ctx, buf, half) = self.block(b"refcounted payload");
        self.server.put(self.tlf, id, ctx, buf, half).await?;

        let second = ctx.new_reference(self.uid);
        self.server.add_block_reference(self.tlf, id, second).await?;
        self.server.get(self.tlf, id, second).await?;

        let live = self
            .server
            .remove_block_references(self.tlf, BTreeMap::from([(id, vec![ctx])]))
            .await?;
        assert_eq!(live.get(&id), Some(&1), "one reference should remain");

        let live = self
            .server
            .remove_block_references(self.tlf, BTreeMap::from([(id, vec![second])]))
            .await?;
        assert_eq!(live.get(&id), Some(&0), "no reference should remain");
        Ok(())
    }

    /// Archived references no longer count as live.
    pub async fn test_archive(&self) -> TlfResult<()> {
        let (id, ctx, buf, half) = self.block(b"archived payload");
        self.server.put(self.tlf, id, ctx, buf, half).await?;
        self.server
            .archive_block_references(self.tlf, BTreeMap::from([(id, vec![ctx])]))
            .await?;

        let live = self
            .server
            .remove_block_references(self.tlf, BTreeMap::from([(id, Vec::new())]))
            .await?;
        assert_eq!(live.get(&id), Some(&0), "archived reference is not live");
        Ok(())
    }
}
