use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::api::v1alpha::ArangoDeployment;
use crate::platform::PlatformClient;
use crate::util::errors::StdError;

/// Key length required by RocksDB encryption at rest.
pub const ENCRYPTION_KEY_LENGTH: usize = 32;

/// Name of the entry holding the raw key bytes within the secret payload.
pub const ENCRYPTION_KEY_FIELD: &str = "key";

/// Marks secrets the operator created on behalf of a deployment.
pub const OWNED_SECRET_LABEL: &str = "arango_deployment_secret";

/// 32 bytes from the operating system's CSPRNG.
pub fn generate_encryption_key() -> Vec<u8> {
    let mut key = vec![0u8; ENCRYPTION_KEY_LENGTH];
    OsRng.fill_bytes(&mut key);
    key
}

/// `prefix` followed by a random lower-case suffix, for callers that need a fresh name.
pub fn unique_secret_name(prefix: &str) -> String {
    let suffix: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}-{}", prefix.trim_end_matches('-'), suffix)
}

fn check_key_length(key: &[u8]) -> Result<(), StdError> {
    if key.len() != ENCRYPTION_KEY_LENGTH {
        return Err(StdError::InvalidArgument(format!(
            "encryption key must be {} bytes, got {}",
            ENCRYPTION_KEY_LENGTH,
            key.len()
        )));
    }
    Ok(())
}

fn encryption_key_secret(name: &str, namespace: &str, key: &[u8]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            ENCRYPTION_KEY_FIELD.to_string(),
            ByteString(key.to_vec()),
        )])),
        immutable: Some(true),
        ..Default::default()
    }
}

/// Persists `key` verbatim as secret `name`.
///
/// Fails with `AlreadyExists` when the name is taken; the existing secret is left untouched.
pub async fn create_encryption_key_secret<P: PlatformClient + ?Sized>(
    platform: &P,
    name: &str,
    namespace: &str,
    key: &[u8],
) -> Result<(), StdError> {
    check_key_length(key)?;
    platform
        .create_secret(namespace, &encryption_key_secret(name, namespace, key))
        .await?;
    info!(secret = name, namespace, "Created encryption key secret");
    Ok(())
}

/// Reads the key stored in secret `name`.
pub async fn get_encryption_key<P: PlatformClient + ?Sized>(
    platform: &P,
    name: &str,
    namespace: &str,
) -> Result<Vec<u8>, StdError> {
    let secret = platform.get_secret(namespace, name).await?;
    let key = secret
        .data
        .as_ref()
        .and_then(|data| data.get(ENCRYPTION_KEY_FIELD))
        .ok_or_else(|| {
            StdError::MetadataMissing(format!(
                "secret '{}' has no '{}' entry",
                name, ENCRYPTION_KEY_FIELD
            ))
        })?;
    check_key_length(&key.0)?;
    Ok(key.0.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretProvisioning {
    Existing,
    Created,
}

/// Makes sure the deployment's encryption key secret exists, generating a key when it does not.
///
/// A secret created here is labelled and owned by the deployment so teardown can remove it.
/// Losing a creation race to another writer counts as success.
pub async fn ensure_encryption_key_secret<P: PlatformClient + ?Sized>(
    platform: &P,
    deployment: &ArangoDeployment,
    name: &str,
    owner: &OwnerReference,
) -> Result<SecretProvisioning, StdError> {
    let namespace = deployment
        .namespace()
        .ok_or_else(|| StdError::MetadataMissing("ArangoDeployment has no namespace".to_string()))?;

    match get_encryption_key(platform, name, &namespace).await {
        Ok(_) => return Ok(SecretProvisioning::Existing),
        Err(e) if e.is_not_found() => {
            info!(secret = name, deployment = %deployment.name_any(), "Generating encryption key");
        }
        Err(e) => return Err(e),
    }

    let key = generate_encryption_key();
    let mut secret = encryption_key_secret(name, &namespace, &key);
    secret.metadata.owner_references = Some(vec![owner.clone()]);
    secret.metadata.labels = Some(BTreeMap::from([
        ("app".to_string(), "arangodb".to_string()),
        (OWNED_SECRET_LABEL.to_string(), deployment.name_any()),
    ]));

    match platform.create_secret(&namespace, &secret).await {
        Ok(_) => {
            info!(secret = name, namespace = %namespace, "Created encryption key secret");
            Ok(SecretProvisioning::Created)
        }
        Err(e) if e.is_already_exists() => {
            warn!(secret = name, "Encryption key secret appeared concurrently, keeping it");
            get_encryption_key(platform, name, &namespace).await?;
            Ok(SecretProvisioning::Existing)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{new_deployment, FakePlatform};

    #[tokio::test]
    async fn creates_secret_with_raw_key_bytes() {
        let platform = FakePlatform::default();
        let key = generate_encryption_key();

        create_encryption_key_secret(&platform, "k1", "ns", &key).await.unwrap();

        assert_eq!(get_encryption_key(&platform, "k1", "ns").await.unwrap(), key);
        let stored = platform.secret("ns", "k1").unwrap();
        assert_eq!(stored.data.unwrap()["key"].0, key);
    }

    #[tokio::test]
    async fn existing_secret_is_never_overwritten() {
        let platform = FakePlatform::default();
        let original = generate_encryption_key();
        create_encryption_key_secret(&platform, "k1", "ns", &original).await.unwrap();

        let err = create_encryption_key_secret(&platform, "k1", "ns", &generate_encryption_key())
            .await
            .unwrap_err();

        assert!(err.is_already_exists());
        assert_eq!(get_encryption_key(&platform, "k1", "ns").await.unwrap(), original);
    }

    #[tokio::test]
    async fn rejects_keys_of_the_wrong_length() {
        let platform = FakePlatform::default();
        let err = create_encryption_key_secret(&platform, "k1", "ns", &[0u8; 16])
            .await
            .unwrap_err();
        assert!(matches!(err, StdError::InvalidArgument(_)));
        assert!(platform.secret("ns", "k1").is_none());
    }

    #[tokio::test]
    async fn forbidden_create_is_surfaced() {
        let platform = FakePlatform::default();
        platform.forbid_secret_creation();
        let err = create_encryption_key_secret(&platform, "k1", "ns", &generate_encryption_key())
            .await
            .unwrap_err();
        assert!(matches!(err, StdError::Forbidden(_)));
    }

    #[tokio::test]
    async fn ensure_generates_owned_secret_once() {
        let platform = FakePlatform::default();
        let deployment = platform.insert_deployment(new_deployment("db", "ns"));
        let owner = crate::controllers::members::owner_reference(&deployment).unwrap();

        let first = ensure_encryption_key_secret(&platform, &deployment, "k1", &owner).await.unwrap();
        let key = get_encryption_key(&platform, "k1", "ns").await.unwrap();
        let second = ensure_encryption_key_secret(&platform, &deployment, "k1", &owner).await.unwrap();

        assert_eq!(first, SecretProvisioning::Created);
        assert_eq!(second, SecretProvisioning::Existing);
        assert_eq!(get_encryption_key(&platform, "k1", "ns").await.unwrap(), key);
        let labels = platform.secret("ns", "k1").unwrap().metadata.labels.unwrap();
        assert_eq!(labels[OWNED_SECRET_LABEL], "db");
    }

    #[test]
    fn unique_names_are_lowercase_and_distinct() {
        let a = unique_secret_name("test-rocksdb-enc-");
        let b = unique_secret_name("test-rocksdb-enc-");
        assert!(a.starts_with("test-rocksdb-enc-"));
        assert_eq!(a.len(), "test-rocksdb-enc-".len() + 8);
        assert_eq!(a, a.to_lowercase());
        assert_ne!(a, b);
    }
}
