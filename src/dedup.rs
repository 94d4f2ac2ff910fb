use std::collections::HashSet;

/// Remembers the digest of every message it has been shown.
///
/// One filter lives for a whole generation run so that the same message
/// replayed across capture files is only emitted once. Each message is
/// hashed on its own; digests never depend on earlier input.
#[derive(Debug, Default)]
pub struct DuplicateFilter {
    seen: HashSet<[u8; 16]>,
}

impl DuplicateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `message` was seen before; otherwise records it and returns false.
    pub fn seen_before(&mut self, message: &str) -> bool {
        let digest = md5::compute(message.as_bytes()).0;
        !self.seen.insert(digest)
    }

    /// Number of distinct messages recorded.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
