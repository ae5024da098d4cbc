//! String objects: byte buffer plus a lazily computed hash.

use super::InstanceCore;
use xxhash_rust::xxh3::xxh3_64;

/// A heap string. Guest strings are byte strings; no Unicode semantics.
#[derive(Debug, Default)]
pub struct StringObj {
    pub core: InstanceCore,
    pub bytes: Vec<u8>,
    /// Cached content hash; computed on first use.
    pub hash: Option<u64>,
}

impl StringObj {
    pub fn new(core: InstanceCore, bytes: Vec<u8>) -> Self {
        Self {
            core,
            bytes,
            hash: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the content hash, computing and caching it if needed.
    pub fn hash_mut(&mut self) -> u64 {
        match self.hash {
            Some(h) => h,
            None => {
                let h = hash_bytes(&self.bytes);
                self.hash = Some(h);
                h
            }
        }
    }

    /// Returns the content hash without caching.
    pub fn hash_ref(&self) -> u64 {
        self.hash.unwrap_or_else(|| hash_bytes(&self.bytes))
    }

    /// Lossy view for traces and messages.
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Appends bytes, invalidating the cached hash.
    ///
    /// Callers must not mutate a string that is a live map key; the
    /// hash changes and the table cannot find it afterwards.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
        self.hash = None;
    }
}

/// Content hash used for strings and value hashing throughout the VM.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_cached() {
        let mut s = StringObj::new(InstanceCore::default(), b"greet".to_vec());
        assert!(s.hash.is_none());
        let h = s.hash_mut();
        assert_eq!(s.hash, Some(h));
        assert_eq!(s.hash_ref(), h);
    }

    #[test]
    fn test_push_invalidates_hash() {
        let mut s = StringObj::new(InstanceCore::default(), b"a".to_vec());
        let before = s.hash_mut();
        s.push_bytes(b"b");
        assert!(s.hash.is_none());
        assert_ne!(s.hash_mut(), before);
    }

    #[test]
    fn test_content_hash_matches_for_equal_content() {
        let a = StringObj::new(InstanceCore::default(), b"same".to_vec());
        let b = StringObj::new(InstanceCore::default(), b"same".to_vec());
        assert_eq!(a.hash_ref(), b.hash_ref());
    }
}
