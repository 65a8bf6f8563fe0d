//! Everything a folder engine needs from the outside, injected once.

use crate::resolver::{ConflictResolver, ReplayResolver};
use std::sync::Arc;
use tlf_core::{BlockServer, KeyService, MdServer, Session, TlfConfig};
use tlf_md::MdOps;

/// The collaborators and tunables shared by the engines of one device.
///
/// `md_ops` is what engines read and write revisions through (possibly a
/// journal overlay); `md_server` is only used to subscribe to updates.
#[derive(Clone, Debug)]
pub struct FolderContext {
    pub config: TlfConfig,
    pub session: Session,
    pub md_ops: Arc<dyn MdOps>,
    pub md_server: Arc<dyn MdServer>,
    pub block_server: Arc<dyn BlockServer>,
    pub keys: Arc<dyn KeyService>,
    pub resolver: Arc<dyn ConflictResolver>,
    /// Whether engines run their flusher, resolver and update subscriber.
    pub background_tasks: bool,
}

impl FolderContext {
    pub fn new(
        config: TlfConfig,
        session: Session,
        md_ops: Arc<dyn MdOps>,
        md_server: Arc<dyn MdServer>,
        block_server: Arc<dyn BlockServer>,
        keys: Arc<dyn KeyService>,
    ) -> Self {
        Self {
            config,
            session,
            md_ops,
            md_server,
            block_server,
            keys,
            resolver: Arc::new(ReplayResolver),
            background_tasks: true,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn without_background_tasks(mut self) -> Self {
        self.background_tasks = false;
        self
    }
}
