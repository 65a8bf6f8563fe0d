#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use tlf_core::{EntryKind, KeyService, MdServer, NodeChange, Session, TlfConfig, TlfHandle, WriteRange};
use tlf_folder::{FolderBranchOps, FolderContext, Folders, Node, Observer, OpContext};
use tlf_journal::{JournalBlockServer, JournalManager, JournalMdOps};
use tlf_md::{MdCache, MdOps, MdOpsStandard};
use tlf_server_memory::{
    KeyDirectory, MemoryBlockServer, MemoryKeyService, MemoryMdBackend, MemoryMdServer,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// No background tasks or automatic resolution; tests drive every step.
pub fn manual_config() -> TlfConfig {
    TlfConfig {
        cr_enabled: false,
        flush_interval_ms: 60_000,
        ..TlfConfig::default()
    }
}

pub fn ctx() -> OpContext {
    OpContext::background()
}

/// Several devices sharing one metadata authority and block store.
pub struct World {
    pub backend: Arc<MemoryMdBackend>,
    pub directory: Arc<KeyDirectory>,
    pub blocks: Arc<MemoryBlockServer>,
    pub alice: Session,
}

impl World {
    pub fn new() -> Self {
        init_tracing();
        let directory = KeyDirectory::new();
        let alice = directory.add_user("alice");
        Self {
            backend: MemoryMdBackend::new(),
            directory,
            blocks: Arc::new(MemoryBlockServer::new()),
            alice,
        }
    }

    /// A second device of alice.
    pub fn phone(&self) -> Session {
        self.directory.add_device(self.alice.uid).unwrap()
    }

    pub fn handle(&self) -> TlfHandle {
        TlfHandle::private(self.alice.uid)
    }

    pub fn context(&self, session: &Session, config: TlfConfig) -> FolderContext {
        let md_server: Arc<dyn MdServer> =
            Arc::new(MemoryMdServer::new(self.backend.clone(), session.clone()));
        let keys: Arc<dyn KeyService> =
            Arc::new(MemoryKeyService::new(self.directory.clone(), session.clone()));
        let md_ops = Arc::new(MdOpsStandard::new(
            md_server.clone(),
            keys.clone(),
            Arc::new(MdCache::new(config.md_cache_capacity)),
            config.clone(),
        ));
        FolderContext::new(
            config,
            session.clone(),
            md_ops,
            md_server,
            self.blocks.clone(),
            keys,
        )
    }

    pub fn device(&self, session: &Session) -> Folders {
        Folders::new(self.context(session, manual_config()).without_background_tasks())
    }

    /// A device whose revisions and blocks go through a journal first.
    pub fn journaled(&self, session: &Session) -> JournaledDevice {
        let dir = tempfile::tempdir().unwrap();
        let config = manual_config();
        let md_server: Arc<dyn MdServer> =
            Arc::new(MemoryMdServer::new(self.backend.clone(), session.clone()));
        let keys: Arc<dyn KeyService> =
            Arc::new(MemoryKeyService::new(self.directory.clone(), session.clone()));
        let cache = Arc::new(MdCache::new(config.md_cache_capacity));
        let remote: Arc<dyn MdOps> = Arc::new(MdOpsStandard::new(
            md_server.clone(),
            keys.clone(),
            cache.clone(),
            config.clone(),
        ));
        let manager = JournalManager::new(
            dir.path(),
            session.clone(),
            keys.clone(),
            md_server.clone(),
            self.blocks.clone(),
            cache,
            config.clone(),
        );
        let ctx = FolderContext::new(
            config,
            session.clone(),
            Arc::new(JournalMdOps::new(remote, manager.clone())),
            md_server,
            Arc::new(JournalBlockServer::new(manager.clone())),
            keys,
        )
        .without_background_tasks();
        JournaledDevice {
            _dir: dir,
            manager,
            folders: Arc::new(Folders::new(ctx)),
        }
    }

    pub async fn open(&self, folders: &Folders) -> (Arc<FolderBranchOps>, Node) {
        folders.get_or_create_root(&self.handle()).await.unwrap()
    }
}

pub struct JournaledDevice {
    _dir: tempfile::TempDir,
    pub manager: Arc<JournalManager>,
    pub folders: Arc<Folders>,
}

/// Creates `name` under the root, writes `data` and leaves it staged.
pub async fn write_file(engine: &FolderBranchOps, name: &str, data: &[u8]) -> Node {
    let root = engine.root_node();
    let file = engine
        .create_entry(&ctx(), &root, name, EntryKind::File, false)
        .await
        .unwrap();
    engine.write(&ctx(), &file, 0, data).await.unwrap();
    engine.forget(root);
    file
}

pub async fn read_file(engine: &FolderBranchOps, name: &str) -> Vec<u8> {
    let root = engine.root_node();
    let (file, entry) = engine.lookup(&root, name).await.unwrap();
    let data = engine.read(&file, 0, entry.size as usize).await.unwrap();
    engine.forget(file);
    engine.forget(root);
    data
}

pub async fn names(engine: &FolderBranchOps) -> Vec<String> {
    let root = engine.root_node();
    let names = engine.list_dir(&root).await.unwrap().into_keys().collect();
    engine.forget(root);
    names
}

#[derive(Default)]
pub struct RecordingObserver {
    pub batches: Mutex<Vec<Vec<NodeChange>>>,
    pub local: Mutex<Vec<(NodeChange, WriteRange)>>,
    pub handles: Mutex<Vec<TlfHandle>>,
}

impl RecordingObserver {
    pub fn batches(&self) -> Vec<Vec<NodeChange>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn saw(&self, dir: &str, name: Option<&str>) -> bool {
        let want = NodeChange {
            dir: dir.to_string(),
            name: name.map(str::to_string),
        };
        self.batches().iter().flatten().any(|c| *c == want)
    }
}

#[async_trait::async_trait]
impl Observer for RecordingObserver {
    async fn local_change(&self, change: &NodeChange, write: WriteRange) {
        self.local.lock().unwrap().push((change.clone(), write));
    }

    async fn batch_changes(&self, changes: &[NodeChange]) {
        self.batches.lock().unwrap().push(changes.to_vec());
    }

    async fn tlf_handle_change(&self, handle: &TlfHandle) {
        self.handles.lock().unwrap().push(handle.clone());
    }
}
