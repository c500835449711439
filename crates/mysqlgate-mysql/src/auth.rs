//! Password scrambles and scramble (salt) generation.
//!
//! Both sides of the gateway use these: the server role recomputes the
//! expected scramble for a configured account and compares it with what the
//! client sent; the client role computes the response it sends to a backend.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password (fast path)
//!
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))
//! ```
//!
//! Full authentication without TLS encrypts the password with the backend's
//! RSA public key, see [`sha256_password_rsa`].

use rand::Rng;
use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use mysqlgate_core::{ConnectionError, ConnectionErrorKind, Error, Result};

/// Length of the salt sent in the initial handshake.
pub const SCRAMBLE_LENGTH: usize = 20;

pub const NATIVE_SCRAMBLE_LENGTH: usize = 20;
pub const SHA2_SCRAMBLE_LENGTH: usize = 32;

pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
}

/// Status bytes following `0x01` in caching_sha2_password exchanges.
pub mod caching_sha2 {
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// The seed proper: at most 20 bytes, without the trailing NUL some servers add.
fn seed(auth_data: &[u8]) -> &[u8] {
    let data = auth_data.strip_suffix(&[0]).unwrap_or(auth_data);
    &data[..data.len().min(SCRAMBLE_LENGTH)]
}

fn xor<const N: usize>(a: [u8; N], b: [u8; N]) -> [u8; N] {
    let mut out = [0u8; N];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// 20-byte mysql_native_password scramble of `password` under `auth_data`.
pub fn native_password_scramble(password: &[u8], auth_data: &[u8]) -> [u8; NATIVE_SCRAMBLE_LENGTH] {
    let stage1: [u8; 20] = Sha1::digest(password).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let mut hasher = Sha1::new();
    hasher.update(seed(auth_data));
    hasher.update(stage2);
    xor(stage1, hasher.finalize().into())
}

/// 32-byte caching_sha2_password scramble of `password` under `auth_data`.
pub fn caching_sha2_scramble(password: &[u8], auth_data: &[u8]) -> [u8; SHA2_SCRAMBLE_LENGTH] {
    let hash: [u8; 32] = Sha256::digest(password).into();
    let hash_hash: [u8; 32] = Sha256::digest(hash).into();
    let mut hasher = Sha256::new();
    hasher.update(hash_hash);
    hasher.update(seed(auth_data));
    xor(hash, hasher.finalize().into())
}

/// Client auth response for mysql_native_password; empty for an empty password.
pub fn mysql_native_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    native_password_scramble(password.as_bytes(), auth_data).to_vec()
}

/// Client auth response for caching_sha2_password; empty for an empty password.
pub fn caching_sha2_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    caching_sha2_scramble(password.as_bytes(), auth_data).to_vec()
}

/// Compare without short-circuiting on the first differing byte.
pub fn scramble_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Fresh handshake salt.
///
/// Bytes are printable ASCII: clients read the second salt part as a
/// NUL-terminated string, so a NUL inside the salt would truncate it.
pub fn generate_scramble() -> [u8; SCRAMBLE_LENGTH] {
    let mut rng = OsRng;
    let mut salt = [0u8; SCRAMBLE_LENGTH];
    for b in &mut salt {
        *b = rng.gen_range(0x21..=0x7e);
    }
    salt
}

/// RSA-encrypt `password` for full caching_sha2/sha256 authentication.
///
/// The NUL-terminated password is XORed with the rotating seed first, then
/// encrypted with the server's PEM public key (PKCS#8 or PKCS#1).
pub fn sha256_password_rsa(
    password: &str,
    auth_data: &[u8],
    public_key_pem: &[u8],
    use_oaep: bool,
) -> Result<Vec<u8>> {
    let seed = seed(auth_data);
    if seed.is_empty() {
        return Err(auth_failure("empty auth seed"));
    }
    let mut pw = password.as_bytes().to_vec();
    pw.push(0);
    for (i, b) in pw.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_failure(format!("public key is not valid UTF-8 PEM: {e}")))?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_failure(format!("failed to parse RSA public key: {e}")))?;

    let encrypted = if use_oaep {
        key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &pw)
    } else {
        key.encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, &pw)
    };
    encrypted.map_err(|e| auth_failure(format!("RSA encryption failed: {e}")))
}

fn auth_failure(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: message.into(),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: [u8; 20] = [
        0x3d, 0x4c, 0x5e, 0x2f, 0x1a, 0x0b, 0x7c, 0x8d, 0x9e, 0xaf, 0x10, 0x21, 0x32, 0x43, 0x54,
        0x65, 0x76, 0x87, 0x98, 0xa9,
    ];

    #[test]
    fn empty_password_sends_empty_response() {
        assert!(mysql_native_password("", &SALT).is_empty());
        assert!(caching_sha2_password("", &SALT).is_empty());
    }

    #[test]
    fn scrambles_are_deterministic_and_sized() {
        let a = native_password_scramble(b"root", &SALT);
        assert_eq!(a, native_password_scramble(b"root", &SALT));
        assert_ne!(a, native_password_scramble(b"other", &SALT));

        let b = caching_sha2_scramble(b"root", &SALT);
        assert_eq!(b, caching_sha2_scramble(b"root", &SALT));
        assert_eq!(b.len(), 32);
        assert_eq!(a.len(), 20);
    }

    #[test]
    fn native_scramble_known_vector() {
        // SHA1("password") xor SHA1(salt + SHA1(SHA1("password"))), salt = 20 x 0x00
        let stage1: [u8; 20] = Sha1::digest(b"password").into();
        let stage2: [u8; 20] = Sha1::digest(stage1).into();
        let mut h = Sha1::new();
        h.update([0u8; 20]);
        h.update(stage2);
        let stage3: [u8; 20] = h.finalize().into();
        let expected: Vec<u8> = stage1.iter().zip(stage3).map(|(a, b)| a ^ b).collect();
        assert_eq!(native_password_scramble(b"password", &[0u8; 20]).to_vec(), expected);
    }

    #[test]
    fn trailing_nul_in_seed_is_ignored() {
        let mut with_nul = SALT.to_vec();
        with_nul.push(0);
        assert_eq!(
            caching_sha2_password("secret", &with_nul),
            caching_sha2_password("secret", &SALT)
        );
        assert_eq!(
            mysql_native_password("secret", &with_nul),
            mysql_native_password("secret", &SALT)
        );
    }

    #[test]
    fn wrong_length_never_matches() {
        let native = native_password_scramble(b"root", &SALT);
        let sha2 = caching_sha2_scramble(b"root", &SALT);
        assert!(scramble_eq(&native, &native));
        assert!(!scramble_eq(&native, &sha2));
        assert!(!scramble_eq(&native, &sha2[..20]));
        assert!(!scramble_eq(&native[..19], &native));
    }

    #[test]
    fn generated_scramble_is_printable() {
        let a = generate_scramble();
        let b = generate_scramble();
        assert!(a.iter().all(|&c| (0x21..=0x7e).contains(&c)));
        assert_ne!(a, b);
    }

    #[test]
    fn rsa_rejects_garbage_key() {
        let err = sha256_password_rsa("pw", &SALT, b"not a key", true).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref e) if e.kind == ConnectionErrorKind::Authentication
        ));
    }
}
