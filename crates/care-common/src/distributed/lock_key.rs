use std::fmt;

/// Advisory lock key for one funding-history bucket.
///
/// PostgreSQL advisory locks take a single `i64`; the key is the first eight
/// bytes of a blake3 digest over `(funding_version_id, period_key)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketLockKey(i64);

impl BucketLockKey {
    pub fn for_bucket(funding_version_id: &str, period_key: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"funding-history\0");
        hasher.update(funding_version_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(period_key.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        Self(i64::from_be_bytes(bytes))
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for BucketLockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}
