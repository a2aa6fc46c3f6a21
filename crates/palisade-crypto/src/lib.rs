//! X25519 key exchange and ChaCha20-Poly1305 AEAD for connection sessions.
//!
//! A [`SecurityManager`] owns one X25519 keypair and, once a peer's public
//! key is known, exactly one derived session key. The key is derived once
//! per connection ([`SecurityManager::derive_session_key`] rejects a second
//! call) and is zeroized when the manager is dropped.
//!
//! Wire format for sealed messages is `nonce(12) || ciphertext || tag(16)`,
//! with a fresh random nonce generated per call to
//! [`SecurityManager::encrypt`].

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod error;

pub use error::{CryptoError, Result};

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const PUBLIC_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// This connection's X25519 keypair.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh keypair from the system RNG.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// This side's public key, to be sent to the peer.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }
}

/// Owns key material and session state for one connection.
///
/// Not `Clone`: a session key is derived at most once, and cloning would
/// make "derived" ambiguous across copies.
pub struct SecurityManager {
    keys: KeyPair,
    session_key: Option<Zeroizing<[u8; 32]>>,
}

impl SecurityManager {
    /// Create a manager with a freshly generated keypair and no session key.
    #[must_use]
    pub fn new() -> Self {
        Self { keys: KeyPair::generate(), session_key: None }
    }

    /// This side's public key, to be sent to the peer during handshake.
    #[must_use]
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.keys.public_bytes()
    }

    /// `true` once [`Self::derive_session_key`] has succeeded.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.session_key.is_some()
    }

    /// Derive the session key from the peer's public key via X25519 ECDH
    /// followed by a SHA-256 KDF over the shared secret.
    ///
    /// # Errors
    ///
    /// - `InvalidPublicKeyLength` if `peer_public` is not 32 bytes.
    /// - `KeyAlreadyDerived` if a session key was already derived for this
    ///   manager.
    pub fn derive_session_key(&mut self, peer_public: &[u8]) -> Result<()> {
        if self.session_key.is_some() {
            return Err(CryptoError::KeyAlreadyDerived);
        }

        let key = derive_shared_key(&self.keys.secret, peer_public)?;
        self.session_key = Some(Zeroizing::new(key));

        Ok(())
    }

    /// Re-derive the shared key from this side's (still-retained) secret and
    /// `peer_public`, and compare it to the already-derived session key.
    ///
    /// Used by a handshake confirmation step: the peer echoes back a public
    /// key a second time, and the responder checks that re-running the ECDH
    /// still agrees with the session key it already committed to, without
    /// exposing the session key itself or allowing a second
    /// [`Self::derive_session_key`] call.
    ///
    /// # Errors
    ///
    /// - `KeyNotReady` if no session key has been derived yet.
    /// - `InvalidPublicKeyLength` if `peer_public` is not 32 bytes.
    pub fn confirm_session_key(&self, peer_public: &[u8]) -> Result<bool> {
        let session_key = self.session_key.as_ref().ok_or(CryptoError::KeyNotReady)?;
        let candidate = derive_shared_key(&self.keys.secret, peer_public)?;
        Ok(candidate == **session_key)
    }

    /// Seal `plaintext` under the derived session key.
    ///
    /// Returns `nonce(12) || ciphertext || tag(16)`.
    ///
    /// # Errors
    ///
    /// `KeyNotReady` if [`Self::derive_session_key`] has not succeeded yet.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let session_key = self.session_key.as_ref().ok_or(CryptoError::KeyNotReady)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(session_key.as_slice()));

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a message produced by [`Self::encrypt`] (on either side of the
    /// session, since the key is symmetric).
    ///
    /// # Errors
    ///
    /// - `KeyNotReady` if no session key has been derived.
    /// - `Malformed` if `sealed` is shorter than `nonce(12) + tag(16)`.
    /// - `AuthenticationFailed` if the AEAD tag does not verify.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let session_key = self.session_key.as_ref().ok_or(CryptoError::KeyNotReady)?;

        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Malformed(sealed.len()));
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(session_key.as_slice()));
        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);

        cipher
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::new()
    }
}

fn derive_shared_key(secret: &StaticSecret, peer_public: &[u8]) -> Result<[u8; 32]> {
    if peer_public.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::InvalidPublicKeyLength(peer_public.len()));
    }

    let mut peer_bytes = [0u8; PUBLIC_KEY_LEN];
    peer_bytes.copy_from_slice(peer_public);
    let peer_public = PublicKey::from(peer_bytes);

    let shared_secret = secret.diffie_hellman(&peer_public);

    let mut hasher = Sha256::new();
    hasher.update(shared_secret.as_bytes());
    let digest = hasher.finalize();

    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ready_pair() -> (SecurityManager, SecurityManager) {
        let mut a = SecurityManager::new();
        let mut b = SecurityManager::new();
        a.derive_session_key(&b.public_key()).expect("derive");
        b.derive_session_key(&a.public_key()).expect("derive");
        (a, b)
    }

    #[test]
    fn derived_keys_agree_and_allow_round_trip() {
        let (a, b) = ready_pair();
        let sealed = a.encrypt(b"hello").expect("encrypt");
        let opened = b.decrypt(&sealed).expect("decrypt");
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn encrypt_before_derive_is_rejected() {
        let manager = SecurityManager::new();
        assert_eq!(manager.encrypt(b"x"), Err(CryptoError::KeyNotReady));
    }

    #[test]
    fn second_derive_is_rejected() {
        let mut manager = SecurityManager::new();
        let other = SecurityManager::new();
        manager.derive_session_key(&other.public_key()).expect("first derive");
        assert_eq!(
            manager.derive_session_key(&other.public_key()),
            Err(CryptoError::KeyAlreadyDerived)
        );
    }

    #[test]
    fn wrong_length_public_key_is_rejected() {
        let mut manager = SecurityManager::new();
        assert_eq!(
            manager.derive_session_key(&[0u8; 31]),
            Err(CryptoError::InvalidPublicKeyLength(31))
        );
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let (a, b) = ready_pair();
        let mut sealed = a.encrypt(b"hello").expect("encrypt");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert_eq!(b.decrypt(&sealed), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn mismatched_session_keys_cannot_decrypt_each_other() {
        let mut a = SecurityManager::new();
        let mut b = SecurityManager::new();
        let mut eve = SecurityManager::new();
        a.derive_session_key(&b.public_key()).expect("derive");
        eve.derive_session_key(&b.public_key()).expect("derive");

        let sealed = a.encrypt(b"hello").expect("encrypt");
        assert_eq!(eve.decrypt(&sealed), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn short_ciphertext_is_malformed() {
        let (_, b) = ready_pair();
        assert_eq!(b.decrypt(&[0u8; 10]), Err(CryptoError::Malformed(10)));
    }

    #[test]
    fn confirm_session_key_accepts_matching_peer() {
        let mut a = SecurityManager::new();
        let b = SecurityManager::new();
        a.derive_session_key(&b.public_key()).expect("derive");
        assert_eq!(a.confirm_session_key(&b.public_key()), Ok(true));
    }

    #[test]
    fn confirm_session_key_rejects_different_peer() {
        let mut a = SecurityManager::new();
        let b = SecurityManager::new();
        let impostor = SecurityManager::new();
        a.derive_session_key(&b.public_key()).expect("derive");
        assert_eq!(a.confirm_session_key(&impostor.public_key()), Ok(false));
    }

    proptest! {
        #[test]
        fn encrypt_produces_unique_nonces(plaintext in prop::collection::vec(any::<u8>(), 0..256)) {
            let (a, _b) = ready_pair();
            let first = a.encrypt(&plaintext).expect("encrypt");
            let second = a.encrypt(&plaintext).expect("encrypt");
            prop_assert_ne!(&first[..12], &second[..12]);
        }

        #[test]
        fn round_trips_arbitrary_plaintext(plaintext in prop::collection::vec(any::<u8>(), 0..4096)) {
            let (a, b) = ready_pair();
            let sealed = a.encrypt(&plaintext).expect("encrypt");
            let opened = b.decrypt(&sealed).expect("decrypt");
            prop_assert_eq!(opened, plaintext);
        }
    }
}
