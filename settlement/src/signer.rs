//! Transaction signing strategies
//!
//! A [`TransactionSigner`] turns message bytes into an ed25519 signature.
//! [`LocalSigner`] holds the key in process; [`RemoteSigner`] forwards to a
//! [`SigningService`] and verifies every returned signature against the
//! service's public key before it can reach the ledger.

use crate::config::SignerConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use vault_ledger::tx::{Message, Transaction};
use vault_ledger::{Pubkey, Signature};

/// Length of an ed25519 public key
const PUBLIC_KEY_LEN: usize = 32;

/// Signs ledger transaction messages
#[async_trait]
pub trait TransactionSigner: Send + Sync + std::fmt::Debug {
    /// Key the signatures verify against
    fn pubkey(&self) -> Pubkey;

    /// Sign the exact serialized message bytes
    async fn sign_message(&self, message: &[u8]) -> Result<Signature>;
}

/// Build a transaction from `message` carrying the signer's signature
pub async fn sign_transaction(signer: &dyn TransactionSigner, message: Message) -> Result<Transaction> {
    let mut transaction = Transaction::new_unsigned(message);
    let data = transaction.message_data()?;
    let signature = signer.sign_message(&data).await?;
    transaction.add_signature(&signer.pubkey(), signature)?;
    Ok(transaction)
}

/// In-process ed25519 key
pub struct LocalSigner {
    signing_key: SigningKey,
    pubkey: Pubkey,
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("pubkey", &self.pubkey)
            .finish()
    }
}

impl LocalSigner {
    /// Generate a new random key
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let pubkey = Pubkey::new(signing_key.verifying_key().to_bytes());
        Self { signing_key, pubkey }
    }

    /// From a 64-byte keypair (secret half then public half)
    pub fn from_keypair_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            return Err(Error::Signer(format!("keypair must be 64 bytes, got {}", bytes.len())));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes[..32]);
        let signer = Self::from_seed(&seed);
        if signer.pubkey.as_bytes()[..] != bytes[32..] {
            return Err(Error::Signer("keypair public half does not match secret".to_string()));
        }
        Ok(signer)
    }

    /// From a JSON array of keypair bytes
    pub fn from_keypair_json(json: &str) -> Result<Self> {
        let bytes: Vec<u8> = serde_json::from_str(json)?;
        Self::from_keypair_bytes(&bytes)
    }

    /// Load a keypair file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let signer = Self::from_keypair_json(&content)?;
        tracing::info!(pubkey = %signer.pubkey, "Loaded local signing key");
        Ok(signer)
    }

    /// Keypair bytes as written to a keypair file
    pub fn to_keypair_bytes(&self) -> [u8; 64] {
        self.signing_key.to_keypair_bytes()
    }
}

#[async_trait]
impl TransactionSigner for LocalSigner {
    fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Signature> {
        Ok(Signature::from_bytes(self.signing_key.sign(message).to_bytes()))
    }
}

/// Managed service that holds a private key
#[async_trait]
pub trait SigningService: Send + Sync + std::fmt::Debug {
    /// Public key, raw or DER-encoded
    async fn public_key(&self) -> Result<Vec<u8>>;

    /// Raw ed25519 signature of `message`
    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Ed25519 key from a raw or DER (SubjectPublicKeyInfo) encoding; the key is
/// the trailing 32 bytes
pub fn ed25519_key_from_der(der: &[u8]) -> Result<Pubkey> {
    if der.len() < PUBLIC_KEY_LEN {
        return Err(Error::Signer(format!(
            "public key too short: {} bytes",
            der.len()
        )));
    }
    Ok(Pubkey::try_from_slice(&der[der.len() - PUBLIC_KEY_LEN..])?)
}

/// Signer backed by a [`SigningService`]
#[derive(Debug, Clone)]
pub struct RemoteSigner {
    service: Arc<dyn SigningService>,
    pubkey: Pubkey,
}

impl RemoteSigner {
    /// Fetch the service's public key once and keep it for verification
    pub async fn connect(service: Arc<dyn SigningService>) -> Result<Self> {
        let der = service.public_key().await?;
        let pubkey = ed25519_key_from_der(&der)?;
        tracing::info!(pubkey = %pubkey, "Remote signer initialized");
        Ok(Self { service, pubkey })
    }
}

#[async_trait]
impl TransactionSigner for RemoteSigner {
    fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Signature> {
        let bytes = self.service.sign(message).await?;
        let signature = Signature::try_from_slice(&bytes)?;
        if !signature.verify(message, &self.pubkey) {
            tracing::error!(pubkey = %self.pubkey, "Remote signature failed verification");
            return Err(Error::RemoteSignatureInvalid);
        }
        Ok(signature)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyResponse {
    public_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest<'a> {
    message: String,
    message_type: &'a str,
    signing_algorithm: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignResponse {
    signature: String,
}

/// JSON-over-HTTP signing service
///
/// - `GET {endpoint}/keys/{key_id}/public-key` → `{"publicKey": base64}`
/// - `POST {endpoint}/keys/{key_id}/sign` with
///   `{"message": base64, "messageType": "RAW", "signingAlgorithm": "ED25519"}`
///   → `{"signature": base64}`
#[derive(Debug, Clone)]
pub struct HttpSigningService {
    client: reqwest::Client,
    endpoint: String,
    key_id: String,
}

impl HttpSigningService {
    /// Create client
    pub fn new(endpoint: impl Into<String>, key_id: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            key_id: key_id.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/keys/{}/{}", self.endpoint, self.key_id, path)
    }
}

#[async_trait]
impl SigningService for HttpSigningService {
    async fn public_key(&self) -> Result<Vec<u8>> {
        let response: PublicKeyResponse = self
            .client
            .get(self.url("public-key"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        BASE64
            .decode(response.public_key)
            .map_err(|e| Error::Signer(format!("public key is not base64: {}", e)))
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let request = SignRequest {
            message: BASE64.encode(message),
            message_type: "RAW",
            signing_algorithm: "ED25519",
        };
        let response: SignResponse = self
            .client
            .post(self.url("sign"))
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        BASE64
            .decode(response.signature)
            .map_err(|e| Error::Signer(format!("signature is not base64: {}", e)))
    }
}

/// Build the signer a configuration asks for
pub async fn resolve_signer(config: &SignerConfig) -> Result<Arc<dyn TransactionSigner>> {
    match config {
        SignerConfig::Local { keypair_path } => Ok(Arc::new(LocalSigner::from_file(keypair_path)?)),
        SignerConfig::Remote {
            endpoint,
            key_id,
            timeout_secs,
        } => {
            let service = HttpSigningService::new(endpoint.clone(), key_id.clone(), Duration::from_secs(*timeout_secs))?;
            Ok(Arc::new(RemoteSigner::connect(Arc::new(service)).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Service signing with a local key, optionally returning garbage
    #[derive(Debug)]
    struct FakeService {
        key: SigningKey,
        der_prefix: Vec<u8>,
        corrupt: bool,
    }

    #[async_trait]
    impl SigningService for FakeService {
        async fn public_key(&self) -> Result<Vec<u8>> {
            let mut der = self.der_prefix.clone();
            der.extend_from_slice(&self.key.verifying_key().to_bytes());
            Ok(der)
        }

        async fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
            let mut signature = self.key.sign(message).to_bytes().to_vec();
            if self.corrupt {
                signature[0] ^= 0xff;
            }
            Ok(signature)
        }
    }

    fn fake(corrupt: bool) -> Arc<FakeService> {
        Arc::new(FakeService {
            key: SigningKey::from_bytes(&[4u8; 32]),
            // SubjectPublicKeyInfo header for Ed25519
            der_prefix: vec![0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00],
            corrupt,
        })
    }

    #[tokio::test]
    async fn test_local_signer_round_trip() {
        let signer = LocalSigner::from_seed(&[1u8; 32]);
        let signature = signer.sign_message(b"message").await.unwrap();
        assert!(signature.verify(b"message", &signer.pubkey()));
        assert!(!signature.verify(b"other", &signer.pubkey()));
    }

    #[test]
    fn test_keypair_file() {
        let signer = LocalSigner::generate();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id.json");
        let json = serde_json::to_string(&signer.to_keypair_bytes().to_vec()).unwrap();
        std::fs::write(&path, json).unwrap();

        let loaded = LocalSigner::from_file(&path).unwrap();
        assert_eq!(loaded.pubkey(), signer.pubkey());
    }

    #[test]
    fn test_keypair_mismatch_rejected() {
        let mut bytes = LocalSigner::from_seed(&[1u8; 32]).to_keypair_bytes();
        bytes[40] ^= 1;
        assert!(matches!(LocalSigner::from_keypair_bytes(&bytes), Err(Error::Signer(_))));
        assert!(LocalSigner::from_keypair_bytes(&bytes[..32]).is_err());
    }

    #[test]
    fn test_der_reduction() {
        let raw = [9u8; 32];
        assert_eq!(ed25519_key_from_der(&raw).unwrap(), Pubkey::new(raw));

        let mut der = vec![0x30, 0x2a];
        der.extend_from_slice(&raw);
        assert_eq!(ed25519_key_from_der(&der).unwrap(), Pubkey::new(raw));
        assert!(ed25519_key_from_der(&raw[..31]).is_err());
    }

    #[tokio::test]
    async fn test_remote_signer_verifies() {
        let service = fake(false);
        let signer = RemoteSigner::connect(service.clone()).await.unwrap();
        assert_eq!(signer.pubkey(), Pubkey::new(service.key.verifying_key().to_bytes()));

        let signature = signer.sign_message(b"tx bytes").await.unwrap();
        assert!(signature.verify(b"tx bytes", &signer.pubkey()));
    }

    #[tokio::test]
    async fn test_remote_signer_rejects_bad_signature() {
        let signer = RemoteSigner::connect(fake(true)).await.unwrap();
        let err = signer.sign_message(b"tx bytes").await.unwrap_err();
        assert!(matches!(err, Error::RemoteSignatureInvalid));
    }
}
