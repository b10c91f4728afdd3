use std::hash::Hasher;

/// Default hashmap for the streamer. Opts-out of more expensive secure hash.
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
/// Default hashset for the streamer. Opts-out of more expensive secure hash.
pub type HashSet<T> = std::collections::HashSet<T, ahash::RandomState>;

/// Stable hash of a path string. Unlike the ahash maps above this produces the same value in every
/// process, so it can be logged and compared across runs. The values 0 and u64::MAX are never
/// returned, they are reserved by [`RequestPath`](crate::RequestPath) for empty and invalid paths.
pub fn hash_path(path: &str) -> u64 {
    let mut hasher = siphasher::sip::SipHasher::default();
    hasher.write(path.as_bytes());
    hasher.finish().clamp(1, u64::MAX - 1)
}
