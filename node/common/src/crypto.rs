use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use ethers::types::H256;
use hkdf::Hkdf;
use k256::{
    ecdh::{diffie_hellman, EphemeralSecret},
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey, SecretKey,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

const ENVELOPE_MAGIC: &[u8; 4] = b"IOSE";
const ENVELOPE_VERSION: u8 = 1;
const EPHEMERAL_LEN: usize = 33;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const HEADER_LEN: usize = ENVELOPE_MAGIC.len() + 1 + EPHEMERAL_LEN + SALT_LEN + NONCE_LEN;
const KDF_INFO: &[u8] = b"invoice-oracle:don-secrets:v1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("invalid envelope format")]
    InvalidFormat,
    #[error("invalid public key")]
    InvalidKey,
    #[error("key derivation failed")]
    Kdf,
    #[error("encryption failed")]
    Encrypt,
    #[error("authentication failure")]
    Authentication,
}

/// Compute SHA256 hash
pub fn sha256(data: &[u8]) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    H256::from_slice(&hasher.finalize())
}

/// Fingerprint of a secret value, safe to keep in memory for leak checks
pub fn secret_fingerprint(value: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"secret-fingerprint");
    hasher.update(value.as_bytes());
    hasher.finalize().into()
}

/// Encrypt `plaintext` so only the holder of the DON secret key can open it.
///
/// Layout: magic | version | ephemeral pubkey (SEC1 compressed) | salt | nonce | ciphertext
pub fn seal_for_don(plaintext: &[u8], don_key: &PublicKey) -> Result<Vec<u8>, SealError> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let shared = ephemeral.diffie_hellman(don_key);

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(shared.raw_secret_bytes().as_slice(), &salt)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| SealError::Encrypt)?;

    let ephemeral_pub = ephemeral.public_key().to_encoded_point(true);

    let mut envelope = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    envelope.extend_from_slice(ENVELOPE_MAGIC);
    envelope.push(ENVELOPE_VERSION);
    envelope.extend_from_slice(ephemeral_pub.as_bytes());
    envelope.extend_from_slice(&salt);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Open an envelope produced by [`seal_for_don`]
pub fn open_sealed(envelope: &[u8], don_secret: &SecretKey) -> Result<Vec<u8>, SealError> {
    if envelope.len() <= HEADER_LEN
        || &envelope[..4] != ENVELOPE_MAGIC
        || envelope[4] != ENVELOPE_VERSION
    {
        return Err(SealError::InvalidFormat);
    }

    let mut offset = 5;
    let ephemeral_pub = PublicKey::from_sec1_bytes(&envelope[offset..offset + EPHEMERAL_LEN])
        .map_err(|_| SealError::InvalidKey)?;
    offset += EPHEMERAL_LEN;
    let salt = &envelope[offset..offset + SALT_LEN];
    offset += SALT_LEN;
    let nonce = &envelope[offset..offset + NONCE_LEN];
    offset += NONCE_LEN;

    let shared = diffie_hellman(don_secret.to_nonzero_scalar(), ephemeral_pub.as_affine());
    let key = derive_key(shared.raw_secret_bytes().as_slice(), salt)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));

    cipher
        .decrypt(XNonce::from_slice(nonce), &envelope[offset..])
        .map_err(|_| SealError::Authentication)
}

fn derive_key(shared: &[u8], salt: &[u8]) -> Result<[u8; 32], SealError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut okm = [0u8; 32];
    hk.expand(KDF_INFO, &mut okm).map_err(|_| SealError::Kdf)?;
    Ok(okm)
}
