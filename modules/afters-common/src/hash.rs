use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::Platform;

/// Hex SHA-256 identifying a piece of media independent of where it was seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wrap an already-computed hex digest (e.g. a persisted row).
    /// Returns `None` unless it looks like a SHA-256 hex string.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(hex.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash a post by platform, its stable post key and the locator path.
///
/// The query string is dropped: CDN image URLs carry signatures that rotate
/// between fetches of the same media.
pub fn content_hash(platform: Platform, post_key: &str, media_locator: &str) -> ContentHash {
    let locator_path = match url::Url::parse(media_locator) {
        Ok(parsed) => format!(
            "{}{}",
            parsed.host_str().unwrap_or_default(),
            parsed.path()
        ),
        Err(_) => media_locator
            .split('?')
            .next()
            .unwrap_or(media_locator)
            .to_string(),
    };

    let mut hasher = Sha256::new();
    hasher.update(platform.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(post_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(locator_path.as_bytes());

    let digest = hasher.finalize();
    ContentHash(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotating_cdn_signature_does_not_change_hash() {
        let a = content_hash(
            Platform::Instagram,
            "C1abc",
            "https://scontent.cdninstagram.com/v/t51/123_n.jpg?stp=dst&oh=aaa&oe=111",
        );
        let b = content_hash(
            Platform::Instagram,
            "C1abc",
            "https://scontent.cdninstagram.com/v/t51/123_n.jpg?stp=dst&oh=bbb&oe=222",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn different_posts_hash_differently() {
        let a = content_hash(Platform::Instagram, "C1abc", "https://cdn.example/a.jpg");
        let b = content_hash(Platform::Instagram, "C2xyz", "https://cdn.example/a.jpg");
        assert_ne!(a, b);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        let real = content_hash(Platform::Instagram, "k", "https://cdn.example/x.jpg");
        assert_eq!(ContentHash::from_hex(real.as_str()), Some(real.clone()));
        assert_eq!(ContentHash::from_hex("not-a-hash"), None);
        assert_eq!(ContentHash::from_hex(&"z".repeat(64)), None);
    }
}
