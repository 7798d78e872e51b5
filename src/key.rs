use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::Zeroizing;

/// Key material sealed in the TPM and used as the LUKS keyslot passphrase.
/// The buffer is wiped when the key (or any clone of it) is dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(Zeroizing<Vec<u8>>);

impl SecretKey {
    /// Draws `length` bytes from the operating system CSPRNG.
    pub fn generate(length: usize) -> Self {
        let mut bytes = Zeroizing::new(vec![0u8; length]);
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(<{} bytes redacted>)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_requested_length() {
        let key = SecretKey::generate(64);
        assert_eq!(key.len(), 64);
        assert_ne!(key, SecretKey::generate(64));
    }

    #[test]
    fn zeroize_clears_the_buffer() {
        use zeroize::Zeroize;

        let mut key = SecretKey::from_bytes(b"hunter2".to_vec());
        // Same routine Zeroizing runs from its Drop impl
        key.0.zeroize();
        assert!(key.is_empty());
    }

    #[test]
    fn debug_does_not_leak() {
        let key = SecretKey::from_bytes(b"hunter2".to_vec());
        let shown = format!("{:?}", key);
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("7 bytes"));
    }
}
