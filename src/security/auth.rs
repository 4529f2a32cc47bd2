//! Authorization
//!
//! HMAC-SHA1 over `command ‖ key ‖ requester`, checked against every
//! candidate secret in constant time.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::secrets::SecretStore;

type HmacSha1 = Hmac<Sha1>;

/// HMAC accepts keys of any length, so this is `None` only in theory
fn mac(secret: &[u8], command: &str, key: &[u8], requester: &str) -> Option<HmacSha1> {
    let mut mac = HmacSha1::new_from_slice(secret).ok()?;
    mac.update(command.as_bytes());
    mac.update(key);
    mac.update(requester.as_bytes());
    Some(mac)
}

/// Digest a client must send to be authorized with `secret`
pub fn sign(secret: &[u8], command: &str, key: &[u8], requester: &str) -> Bytes {
    mac(secret, command, key, requester)
        .map(|m| Bytes::copy_from_slice(&m.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Constant-time check of `digest` against one secret
pub fn verify(secret: &[u8], command: &str, key: &[u8], requester: &str, digest: &[u8]) -> bool {
    mac(secret, command, key, requester)
        .map(|m| m.verify_slice(digest).is_ok())
        .unwrap_or(false)
}

/// Gate for modifying and admin commands
#[derive(Debug, Clone)]
pub struct Authorizer {
    secrets: Arc<SecretStore>,
}

impl Authorizer {
    pub fn new(secrets: Arc<SecretStore>) -> Self {
        Self { secrets }
    }

    pub fn secrets(&self) -> &Arc<SecretStore> {
        &self.secrets
    }

    /// Authorized iff any global or key-scoped secret produces `digest`
    pub fn authorize(&self, command: &str, key: &Bytes, requester: &str, digest: Option<&[u8]>) -> Result<()> {
        let digest = digest.ok_or(Error::AuthenticationFailure)?;
        let matched = self
            .secrets
            .candidates(key)
            .iter()
            .any(|secret| verify(secret, command, key, requester, digest));
        if matched {
            Ok(())
        } else {
            Err(Error::AuthenticationFailure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(global: &[&'static str]) -> Arc<SecretStore> {
        Arc::new(SecretStore::new(
            global.iter().map(|s| Bytes::from_static(s.as_bytes())).collect(),
        ))
    }

    #[test]
    fn test_second_global_secret_authorizes() {
        let auth = Authorizer::new(store(&["s1", "s2"]));
        let key = Bytes::from_static(b"foo");

        let good = sign(b"s2", "SET", &key, "bob");
        assert!(auth.authorize("SET", &key, "bob", Some(&good)).is_ok());

        let bad = sign(b"s3", "SET", &key, "bob");
        assert_eq!(
            auth.authorize("SET", &key, "bob", Some(&bad)),
            Err(Error::AuthenticationFailure)
        );
    }

    #[test]
    fn test_digest_binds_every_field() {
        let auth = Authorizer::new(store(&["s1"]));
        let key = Bytes::from_static(b"foo");
        let digest = sign(b"s1", "SET", &key, "bob");

        assert!(auth.authorize("DEL", &key, "bob", Some(&digest)).is_err());
        assert!(auth.authorize("SET", &Bytes::from_static(b"bar"), "bob", Some(&digest)).is_err());
        assert!(auth.authorize("SET", &key, "alice", Some(&digest)).is_err());
    }

    #[test]
    fn test_key_scoped_secret() {
        let secrets = store(&[]);
        let key = Bytes::from_static(b"foo");
        secrets.add_key_secret(key.clone(), Bytes::from_static(b"only-foo"));
        let auth = Authorizer::new(secrets);

        let digest = sign(b"only-foo", "SET", &key, "bob");
        assert!(auth.authorize("SET", &key, "bob", Some(&digest)).is_ok());

        let other = Bytes::from_static(b"other");
        let digest = sign(b"only-foo", "SET", &other, "bob");
        assert!(auth.authorize("SET", &other, "bob", Some(&digest)).is_err());
    }

    #[test]
    fn test_missing_or_truncated_digest() {
        let auth = Authorizer::new(store(&["s1"]));
        let key = Bytes::from_static(b"foo");
        assert!(auth.authorize("SET", &key, "bob", None).is_err());

        let digest = sign(b"s1", "SET", &key, "bob");
        assert!(auth.authorize("SET", &key, "bob", Some(&digest[..10])).is_err());
        assert_eq!(digest.len(), 20);
    }
}
