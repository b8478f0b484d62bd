//! Session and handshake cryptography
//!
//! Two primitives cover the whole wire surface:
//!
//! * [`Symmetric`] — XChaCha20-Poly1305 with a fresh random nonce per
//!   message. Output layout is `ciphertext || mac || nonce`: the nonce
//!   trails the sealed payload so framers can treat it as the last public
//!   bytes before the obfuscation tail.
//! * [`Asymmetric`] — X25519 sealed-box variant. The ephemeral public key is
//!   transmitted as an Elligator2 representative, indistinguishable from
//!   random bytes, and Blake2b-256 turns the shared secret into the session
//!   key that outlives the handshake.
//!
//! Both seal and open in place inside pooled [`Buffer`]s; callers pre-reserve
//! the forward capacity for MAC, nonce and representative.

use crate::buffer::{Buffer, BufferError};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chacha20poly1305::aead::{AeadCore, AeadInPlace, OsRng};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use curve25519_elligator2::{MapToPointVariant, MontgomeryPoint, Randomized};
use rand::{Rng, RngCore};
use thiserror::Error;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const MAC_SIZE: usize = 16;
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Bytes a symmetric seal adds: trailing MAC plus trailing nonce.
pub const SYMMETRIC_OVERHEAD: usize = MAC_SIZE + NONCE_SIZE;

/// Bytes an asymmetric seal adds: symmetric overhead plus the hidden key.
pub const ASYMMETRIC_OVERHEAD: usize = SYMMETRIC_OVERHEAD + PUBLIC_KEY_SIZE;

pub type SymmetricKey = [u8; KEY_SIZE];

type Blake2b256 = Blake2b<U32>;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("ciphertext too short: {0} bytes")]
    ShortCiphertext(usize),

    #[error("AEAD open failed")]
    AeadOpenError,

    #[error("AEAD seal failed")]
    AeadSealError,

    #[error("invalid key material length: {0} bytes")]
    InvalidKeyLength(usize),

    #[error("no private key available for decryption")]
    NoPrivateKey,

    #[error("hidden public key does not map to a curve point")]
    HiddenKeyMapping,

    #[error(transparent)]
    Capacity(#[from] BufferError),
}

// =============================================================================
// SYMMETRIC
// =============================================================================

/// Per-session XChaCha20-Poly1305 cipher.
#[derive(Clone)]
pub struct Symmetric {
    aead: XChaCha20Poly1305,
}

impl Symmetric {
    pub fn new(key: &SymmetricKey) -> Self {
        Self { aead: XChaCha20Poly1305::new(Key::from_slice(key)) }
    }

    /// A cipher under a freshly sampled random key.
    pub fn generate() -> (SymmetricKey, Self) {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        (key, Self::new(&key))
    }

    /// Seal the buffer in place; result is `ciphertext || mac || nonce`,
    /// `length = plaintext + 40`. Requires 40 bytes of forward capacity.
    pub fn encrypt(&self, buf: Buffer, ad: Option<&[u8]>) -> Result<Buffer, CryptoError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let mut buf = buf;
        self.aead
            .encrypt_in_place(&nonce, ad.unwrap_or(&[]), &mut buf)
            .map_err(|_| CryptoError::AeadSealError)?;
        Ok(buf.append(nonce.as_slice())?)
    }

    /// Open `ciphertext || mac || nonce` in place, yielding the plaintext
    /// view over the same arena.
    pub fn decrypt(&self, buf: Buffer, ad: Option<&[u8]>) -> Result<Buffer, CryptoError> {
        if buf.len() < SYMMETRIC_OVERHEAD {
            return Err(CryptoError::ShortCiphertext(buf.len()));
        }
        let sealed_len = buf.len() - NONCE_SIZE;
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(buf.reslice(sealed_len, buf.len()));

        let mut buf = buf.rebuffer(0, sealed_len);
        self.aead
            .decrypt_in_place(XNonce::from_slice(&nonce), ad.unwrap_or(&[]), &mut buf)
            .map_err(|_| CryptoError::AeadOpenError)?;
        Ok(buf)
    }
}

// =============================================================================
// ASYMMETRIC
// =============================================================================

/// X25519 key, public point always present, private scalar optional.
#[derive(Clone)]
pub struct Asymmetric {
    public: [u8; PUBLIC_KEY_SIZE],
    private: Option<[u8; PRIVATE_KEY_SIZE]>,
}

impl Asymmetric {
    /// Fresh keypair.
    pub fn generate() -> Self {
        let mut private = [0u8; PRIVATE_KEY_SIZE];
        OsRng.fill_bytes(&mut private);
        let public = MontgomeryPoint::mul_base_clamped(private).to_bytes();
        Self { public, private: Some(private) }
    }

    /// Parse key material: `priv || pub` (64 bytes) as a full keypair, or a
    /// bare public key (32 bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        match bytes.len() {
            n if n == PRIVATE_KEY_SIZE + PUBLIC_KEY_SIZE => {
                let mut private = [0u8; PRIVATE_KEY_SIZE];
                let mut public = [0u8; PUBLIC_KEY_SIZE];
                private.copy_from_slice(&bytes[..PRIVATE_KEY_SIZE]);
                public.copy_from_slice(&bytes[PRIVATE_KEY_SIZE..]);
                Ok(Self { public, private: Some(private) })
            }
            n if n == PUBLIC_KEY_SIZE => {
                let mut public = [0u8; PUBLIC_KEY_SIZE];
                public.copy_from_slice(bytes);
                Ok(Self { public, private: None })
            }
            n => Err(CryptoError::InvalidKeyLength(n)),
        }
    }

    /// Public-only view of this key, for handing to client-side callers.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public
    }

    /// Serialized `priv || pub`, available when the private scalar is held.
    pub fn to_bytes(&self) -> Result<[u8; PRIVATE_KEY_SIZE + PUBLIC_KEY_SIZE], CryptoError> {
        let private = self.private.ok_or(CryptoError::NoPrivateKey)?;
        let mut out = [0u8; PRIVATE_KEY_SIZE + PUBLIC_KEY_SIZE];
        out[..PRIVATE_KEY_SIZE].copy_from_slice(&private);
        out[PRIVATE_KEY_SIZE..].copy_from_slice(&self.public);
        Ok(out)
    }

    /// Seal to this public key.
    ///
    /// Output is `ciphertext || mac || nonce || hidden_pub`, adding 72 bytes
    /// of forward capacity use. The derived session key is returned so the
    /// caller can keep the session cipher after the handshake.
    pub fn encrypt(&self, buf: Buffer) -> Result<(SymmetricKey, Buffer), CryptoError> {
        let (hidden, ephemeral) = generate_hidden_keypair();
        let shared = MontgomeryPoint(self.public).mul_clamped(ephemeral);

        let session_key = derive_session_key(shared.as_bytes(), &hidden, &self.public);
        let sealed = Symmetric::new(&session_key).encrypt(buf, Some(&hidden))?;
        Ok((session_key, sealed.append(&hidden)?))
    }

    /// Open a message sealed to this key; requires the private scalar.
    pub fn decrypt(&self, buf: Buffer) -> Result<(SymmetricKey, Buffer), CryptoError> {
        let private = self.private.ok_or(CryptoError::NoPrivateKey)?;
        if buf.len() < ASYMMETRIC_OVERHEAD {
            return Err(CryptoError::ShortCiphertext(buf.len()));
        }

        let sealed_len = buf.len() - PUBLIC_KEY_SIZE;
        let mut hidden = [0u8; PUBLIC_KEY_SIZE];
        hidden.copy_from_slice(buf.reslice(sealed_len, buf.len()));
        let buf = buf.rebuffer(0, sealed_len);

        let ephemeral_point = MontgomeryPoint::from_representative::<Randomized>(&hidden)
            .ok_or(CryptoError::HiddenKeyMapping)?;
        let shared = ephemeral_point.mul_clamped(private);

        let session_key = derive_session_key(shared.as_bytes(), &hidden, &self.public);
        let opened = Symmetric::new(&session_key).decrypt(buf, Some(&hidden))?;
        Ok((session_key, opened))
    }
}

/// Ephemeral X25519 private key together with the Elligator2 representative
/// of its public point. Roughly half of all keys have no representative, so
/// sampling retries until one does.
fn generate_hidden_keypair() -> ([u8; PUBLIC_KEY_SIZE], [u8; PRIVATE_KEY_SIZE]) {
    loop {
        let mut private = [0u8; PRIVATE_KEY_SIZE];
        OsRng.fill_bytes(&mut private);
        let tweak: u8 = rand::thread_rng().gen();
        if let Some(hidden) = Option::<[u8; 32]>::from(Randomized::to_representative(&private, tweak)) {
            return (hidden, private);
        }
    }
}

/// `Blake2b-256(shared || hidden_pub || recipient_pub)` — both handshake
/// sides hash identical bytes, so the session keys agree.
fn derive_session_key(shared: &[u8; 32], hidden: &[u8; PUBLIC_KEY_SIZE], recipient: &[u8; PUBLIC_KEY_SIZE]) -> SymmetricKey {
    let mut hasher = Blake2b256::new();
    hasher.update(shared);
    hasher.update(hidden);
    hasher.update(recipient);
    hasher.finalize().into()
}
