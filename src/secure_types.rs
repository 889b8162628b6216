//! Secure Types Module
//!
//! Scrubbed storage for gMSA password material. The decoded
//! `msDS-ManagedPassword` blob and its extracted 256-byte current password
//! live in a [`SecretBuffer`], which zeroes its memory before deallocation
//! so password bytes never linger in freed allocations. User passwords are
//! short-lived `zeroize::Zeroizing<String>` values held directly at their
//! call sites; only the blob needs a named type, because it alone carries
//! the decode-from-base64 and redaction contract.

use base64::{engine::general_purpose, Engine as _};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::errors::{CredError, Result};

/// A move-only byte region that is zeroed before deallocation.
///
/// Owns decoded managed-password material. There is deliberately no
/// `Clone` impl: exactly one owner scrubs the bytes on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct SecretBuffer {
    inner: Vec<u8>,
}

impl SecretBuffer {
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { inner: bytes }
    }

    /// Base64-decodes `encoded` into a fresh secret buffer.
    ///
    /// ASCII whitespace is stripped first, so LDIF-wrapped values decode
    /// the same way they did under glib's tolerant decoder. The stripped
    /// intermediate copy is scrubbed as well.
    pub(crate) fn decode_base64(encoded: &str) -> Result<Self> {
        let compact: Zeroizing<String> = Zeroizing::new(
            encoded
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect(),
        );
        if compact.is_empty() {
            return Err(CredError::DecodeError("empty base64 input".to_string()));
        }
        let decoded = general_purpose::STANDARD
            .decode(compact.as_bytes())
            .map_err(|err| CredError::DecodeError(format!("base64 decode: {}", err)))?;
        Ok(Self { inner: decoded })
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuffer([REDACTED; {}])", self.inner.len())
    }
}

impl fmt::Display for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}
