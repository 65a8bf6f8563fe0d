use dashmap::DashMap;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tlf_core::{
    KeyGen, KeyService, KeyStatus, Session, TlfCryptKey, TlfError, TlfId, TlfResult, UserId,
};

#[derive(Debug, Default)]
struct UserRecord {
    name: String,
    /// Device keys and, for revoked ones, when they were revoked.
    keys: HashMap<[u8; 32], Option<SystemTime>>,
}

/// Users, devices, social assertions and folder keys shared by every
/// device of a test.
#[derive(Debug, Default)]
pub struct KeyDirectory {
    users: DashMap<UserId, UserRecord>,
    assertions: DashMap<String, UserId>,
    tlf_keys: DashMap<(TlfId, KeyGen), [u8; 32]>,
    latest_key_gens: DashMap<TlfId, KeyGen>,
}

impl KeyDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a user with one device and returns that device's session.
    pub fn add_user(&self, name: &str) -> Session {
        let uid = UserId::random();
        self.users.insert(
            uid,
            UserRecord {
                name: name.to_string(),
                keys: HashMap::new(),
            },
        );
        self.add_device_for(uid, name)
    }

    /// Adds another device to an existing user.
    pub fn add_device(&self, uid: UserId) -> TlfResult<Session> {
        let name = self
            .users
            .get(&uid)
            .map(|u| u.name.clone())
            .ok_or_else(|| TlfError::NotFound(format!("user {uid}")))?;
        Ok(self.add_device_for(uid, &name))
    }

    fn add_device_for(&self, uid: UserId, name: &str) -> Session {
        let mut seed = [0u8; 32];
        rand::rng().fill(&mut seed[..]);
        let signing_key = SigningKey::from_bytes(&seed);
        if let Some(mut user) = self.users.get_mut(&uid) {
            user.keys
                .insert(signing_key.verifying_key().to_bytes(), None);
        }
        Session {
            uid,
            name: name.to_string(),
            signing_key,
        }
    }

    pub fn revoke_device(&self, uid: UserId, key: &VerifyingKey, at: SystemTime) {
        if let Some(mut user) = self.users.get_mut(&uid) {
            user.keys.insert(key.to_bytes(), Some(at));
        }
    }

    /// Makes `assertion` resolve to `uid` from now on.
    pub fn prove_assertion(&self, assertion: &str, uid: UserId) {
        self.assertions.insert(assertion.to_string(), uid);
    }

    /// Starts a new key generation for `tlf`.
    pub fn rekey(&self, tlf: TlfId) -> KeyGen {
        let mut latest = self.latest_key_gens.entry(tlf).or_insert(KeyGen::FIRST);
        latest.0 += 1;
        *latest
    }

    fn crypt_key(&self, tlf: TlfId, key_gen: KeyGen) -> TlfResult<TlfCryptKey> {
        let latest = self
            .latest_key_gens
            .get(&tlf)
            .map_or(KeyGen::FIRST, |k| *k);
        if key_gen == KeyGen::PUBLIC || key_gen > latest {
            return Err(anyhow::anyhow!("no key generation {} for {tlf}", key_gen.0));
        }
        let bytes = *self.tlf_keys.entry((tlf, key_gen)).or_insert_with(|| {
            let mut bytes = [0u8; 32];
            rand::rng().fill(&mut bytes[..]);
            bytes
        });
        Ok(TlfCryptKey::from_bytes(bytes))
    }
}

/// One device's view of a [`KeyDirectory`].
#[derive(Debug, Clone)]
pub struct MemoryKeyService {
    directory: Arc<KeyDirectory>,
    session: Session,
}

impl MemoryKeyService {
    pub fn new(directory: Arc<KeyDirectory>, session: Session) -> Self {
        Self { directory, session }
    }

    pub fn directory(&self) -> &Arc<KeyDirectory> {
        &self.directory
    }
}

#[async_trait::async_trait]
impl KeyService for MemoryKeyService {
    async fn current_session(&self) -> TlfResult<Session> {
        Ok(self.session.clone())
    }

    async fn latest_key_gen(&self, tlf: TlfId) -> TlfResult<KeyGen> {
        Ok(self
            .directory
            .latest_key_gens
            .get(&tlf)
            .map_or(KeyGen::FIRST, |k| *k))
    }

    async fn tlf_crypt_key(&self, tlf: TlfId, key_gen: KeyGen) -> TlfResult<TlfCryptKey> {
        self.directory.crypt_key(tlf, key_gen)
    }

    async fn verifying_key_status(
        &self,
        uid: UserId,
        key: &VerifyingKey,
        _at: SystemTime,
    ) -> TlfResult<KeyStatus> {
        let Some(user) = self.directory.users.get(&uid) else {
            return Ok(KeyStatus::NotFound);
        };
        Ok(match user.keys.get(&key.to_bytes()) {
            Some(None) => KeyStatus::Valid,
            Some(Some(at)) => KeyStatus::Revoked { at: *at },
            None => KeyStatus::NotFound,
        })
    }

    async fn normalized_username(&self, uid: UserId) -> TlfResult<String> {
        self.directory
            .users
            .get(&uid)
            .map(|u| u.name.clone())
            .ok_or_else(|| TlfError::NotFound(format!("user {uid}")).into())
    }

    async fn resolve_assertion(&self, assertion: &str) -> TlfResult<Option<UserId>> {
        Ok(self.directory.assertions.get(assertion).map(|u| *u))
    }
}
