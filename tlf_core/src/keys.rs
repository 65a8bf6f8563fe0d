//! The key/identity service consumed by the metadata layer.

use crate::TlfResult;
use crate::ids::{KeyGen, TlfId, UserId};
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;
use std::time::SystemTime;
use zeroize::Zeroize;

/// The logged-in user and the device key it signs with.
#[derive(Clone)]
pub struct Session {
    pub uid: UserId,
    pub name: String,
    pub signing_key: SigningKey,
}

impl Session {
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A folder's symmetric key for one key generation.
#[derive(Clone)]
pub struct TlfCryptKey([u8; 32]);

impl TlfCryptKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for TlfCryptKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for TlfCryptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TlfCryptKey(..)")
    }
}

/// Validity of a device key for a user at a given time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStatus {
    Valid,
    /// The key was valid until it was revoked at `at`.
    Revoked { at: SystemTime },
    NotFound,
}

#[async_trait::async_trait]
pub trait KeyService: fmt::Debug + Send + Sync + 'static {
    async fn current_session(&self) -> TlfResult<Session>;

    async fn latest_key_gen(&self, tlf: TlfId) -> TlfResult<KeyGen>;

    async fn tlf_crypt_key(&self, tlf: TlfId, key_gen: KeyGen) -> TlfResult<TlfCryptKey>;

    async fn verifying_key_status(
        &self,
        uid: UserId,
        key: &VerifyingKey,
        at: SystemTime,
    ) -> TlfResult<KeyStatus>;

    async fn normalized_username(&self, uid: UserId) -> TlfResult<String>;

    /// Resolves a social assertion to a user, if it has been proven.
    async fn resolve_assertion(&self, assertion: &str) -> TlfResult<Option<UserId>>;
}
