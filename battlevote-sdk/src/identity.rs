//! Stable anonymous user identity.
//!
//! Outgoing votes must be attributable, so the channel resolves an identity
//! before it connects. The default provider derives a device fingerprint once
//! and caches it in the [`BattleStore`], so every tab and every restart on the
//! device reports the same id.

use futures::FutureExt;
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};

use crate::error::IdentityError;
use crate::store::BattleStore;

/// Resolves the id this client votes under.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self) -> BoxFuture<'_, Result<String, IdentityError>>;
}

/// Fingerprint-based identity cached in the durable store.
pub struct FingerprintIdentity {
    store: BattleStore,
}

impl FingerprintIdentity {
    pub fn new(store: BattleStore) -> Self {
        Self { store }
    }
}

impl IdentityProvider for FingerprintIdentity {
    fn resolve(&self) -> BoxFuture<'_, Result<String, IdentityError>> {
        async move {
            if let Some(id) = self.store.user_id() {
                return Ok(id);
            }
            let traits = DeviceTraits::probe();
            let id = traits.fingerprint()?;
            tracing::debug!(user_id = %id, "Generated device identity");
            self.store.set_user_id(&id);
            Ok(id)
        }
        .boxed()
    }
}

/// A fixed identity, for bots, tests, and explicit `--user-id` overrides.
pub struct StaticIdentity(pub String);

impl IdentityProvider for StaticIdentity {
    fn resolve(&self) -> BoxFuture<'_, Result<String, IdentityError>> {
        let id = self.0.clone();
        async move {
            if id.is_empty() {
                Err(IdentityError::Unavailable("empty static identity".to_string()))
            } else {
                Ok(id)
            }
        }
        .boxed()
    }
}

/// Machine properties that feed the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceTraits {
    username: String,
    hostname: String,
    distro: String,
    arch: String,
}

impl DeviceTraits {
    fn probe() -> Self {
        Self {
            username: whoami::username(),
            hostname: whoami::fallible::hostname().unwrap_or_default(),
            distro: whoami::distro(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// 32 hex chars of SHA-256 over the traits.
    fn fingerprint(&self) -> Result<String, IdentityError> {
        if self.username.is_empty() && self.hostname.is_empty() {
            return Err(IdentityError::Unavailable(
                "neither username nor hostname is available".to_string(),
            ));
        }
        let mut hasher = Sha256::new();
        for part in [&self.username, &self.hostname, &self.distro, &self.arch] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        Ok(hex::encode(&digest[..16]))
    }
}
