use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::RwLock;

type HmacSha256 = Hmac<Sha256>;

fn keyed(secret: &[u8]) -> HmacSha256 {
    match <HmacSha256 as Mac>::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => unreachable!("hmac accepts keys of any length"),
    }
}

/// HMAC-SHA256 of `payload` under `secret`.
pub fn sign(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = keyed(secret);
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Runtime-mutable `uid -> shared secret` table.
///
/// Lookups take the read lock; `add`/`remove` take the write lock, so a
/// verification sees the table either before or after a mutation.
#[derive(Debug, Default)]
pub struct Credentials {
    users: RwLock<HashMap<u64, Vec<u8>>>,
}

impl Credentials {
    pub fn new(users: HashMap<u64, Vec<u8>>) -> Self {
        Self {
            users: RwLock::new(users),
        }
    }

    pub async fn add(&self, uid: u64, secret: Vec<u8>) {
        self.users.write().await.insert(uid, secret);
    }

    pub async fn remove(&self, uid: u64) -> bool {
        self.users.write().await.remove(&uid).is_some()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    /// Constant-time MAC check. Unknown uids and bad MACs are both just `false`.
    pub async fn verify(&self, uid: u64, payload: &[u8], tag: &[u8]) -> bool {
        let users = self.users.read().await;
        let Some(secret) = users.get(&uid) else {
            return false;
        };
        let mut mac = keyed(secret);
        mac.update(payload);
        mac.verify_slice(tag).is_ok()
    }
}
