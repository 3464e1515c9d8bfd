// Copyright 2024 SAP SE
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

use anyhow::{anyhow, Context};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

const HMAC_KEY_LEN: usize = 128;

type BuildClient<C> = Box<dyn Fn(&str) -> anyhow::Result<C> + Send + Sync>;

struct Credentials<C> {
    client: C,
    token_hash: Vec<u8>,
}

/// Holds an API client together with a keyed hash of the token it was built from.
///
/// Calls go through [`CredentialRotator::read`] and keep the guard for the whole request,
/// [`CredentialRotator::reauthenticate`] swaps the client under the write lock.
pub struct CredentialRotator<C> {
    hmac_key: Vec<u8>,
    build: BuildClient<C>,
    state: RwLock<Credentials<C>>,
}

impl<C> fmt::Debug for CredentialRotator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRotator").finish_non_exhaustive()
    }
}

impl<C> CredentialRotator<C> {
    pub fn new(
        token: &str,
        build: impl Fn(&str) -> anyhow::Result<C> + Send + Sync + 'static,
    ) -> Result<Self, anyhow::Error> {
        let mut hmac_key = vec![0_u8; HMAC_KEY_LEN];
        OsRng.fill_bytes(&mut hmac_key);

        let client = build(token).context("failed to build client")?;
        let token_hash = hash_token(&hmac_key, token)?;
        Ok(Self {
            hmac_key,
            build: Box::new(build),
            state: RwLock::new(Credentials { client, token_hash }),
        })
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, C> {
        RwLockReadGuard::map(self.state.read().await, |state| &state.client)
    }

    /// Rebuilds the client when `token` differs from the one in use.
    ///
    /// Returns whether a new client was built.
    pub async fn reauthenticate(&self, token: &str) -> Result<bool, anyhow::Error> {
        let mut state = self.state.write().await;

        let mut mac = HmacSha256::new_from_slice(&self.hmac_key).map_err(|e| anyhow!("HMAC key error: {e}"))?;
        mac.update(token.as_bytes());
        if mac.verify_slice(&state.token_hash).is_ok() {
            return Ok(false);
        }

        let client = (self.build)(token).context("failed to build client for the new token")?;
        *state = Credentials {
            client,
            token_hash: hash_token(&self.hmac_key, token)?,
        };
        info!("rotated API credentials");
        Ok(true)
    }
}

fn hash_token(key: &[u8], token: &str) -> Result<Vec<u8>, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| anyhow!("HMAC key error: {e}"))?;
    mac.update(token.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn counting_rotator(token: &str) -> (Arc<AtomicUsize>, CredentialRotator<String>) {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let rotator = CredentialRotator::new(token, move |token| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("client for {token}"))
        })
        .unwrap();
        (builds, rotator)
    }

    #[tokio::test]
    async fn same_token_is_a_no_op() {
        let (builds, rotator) = counting_rotator("token-1");
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        assert!(!rotator.reauthenticate("token-1").await.unwrap());
        assert!(!rotator.reauthenticate("token-1").await.unwrap());
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(*rotator.read().await, "client for token-1");
    }

    #[tokio::test]
    async fn new_token_rebuilds_client() {
        let (builds, rotator) = counting_rotator("token-1");

        assert!(rotator.reauthenticate("token-2").await.unwrap());
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(*rotator.read().await, "client for token-2");

        assert!(!rotator.reauthenticate("token-2").await.unwrap());
        assert!(rotator.reauthenticate("token-1").await.unwrap());
        assert_eq!(builds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failing_build_keeps_old_client() {
        let rotator = CredentialRotator::new("good", |token| {
            if token == "bad" {
                Err(anyhow!("rejected"))
            } else {
                Ok(token.to_string())
            }
        })
        .unwrap();

        assert!(rotator.reauthenticate("bad").await.is_err());
        assert_eq!(*rotator.read().await, "good");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_rotation_happens_once() {
        let (builds, rotator) = counting_rotator("token-1");
        let rotator = Arc::new(rotator);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let rotator = rotator.clone();
            handles.push(tokio::spawn(async move {
                drop(rotator.read().await);
                rotator.reauthenticate("token-2").await.unwrap()
            }));
        }

        let mut rotations = 0;
        for handle in handles {
            if handle.await.unwrap() {
                rotations += 1;
            }
        }
        assert_eq!(rotations, 1);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(*rotator.read().await, "client for token-2");
    }
}
