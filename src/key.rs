//! Keys identifying a resource at a target size.
//!
//! Keys are immutable once built and always own their identifier, so a key stored in a map can never be changed
//! underneath it.  Lookups build a fresh key; the identifier is behind an `Arc<str>` so cloning a stored key for the
//! in-flight set and the listener map is cheap.
use std::fmt;
use std::sync::Arc;

/// A target size for a scaled artifact.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Size {
        Size { width, height }
    }
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum KeyError {
    #[error("resource identifier must not be empty")]
    EmptyIdentifier,
    #[error("target size {width}x{height} has a zero dimension")]
    ZeroDimension { width: u32, height: u32 },
}

/// `(identifier, size)`, where a size of `None` means the raw, unscaled resource.
///
/// Equality and hashing cover every field.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct CacheKey {
    identifier: Arc<str>,
    size: Option<Size>,
}

impl CacheKey {
    /// Key for the unscaled resource.
    pub fn raw(identifier: &str) -> Result<CacheKey, KeyError> {
        if identifier.is_empty() {
            return Err(KeyError::EmptyIdentifier);
        }

        Ok(CacheKey {
            identifier: identifier.into(),
            size: None,
        })
    }

    /// Key for the resource scaled to `width` x `height`.
    pub fn scaled(identifier: &str, width: u32, height: u32) -> Result<CacheKey, KeyError> {
        if width == 0 || height == 0 {
            return Err(KeyError::ZeroDimension { width, height });
        }

        let mut key = CacheKey::raw(identifier)?;
        key.size = Some(Size::new(width, height));
        Ok(key)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn size(&self) -> Option<Size> {
        self.size
    }

    /// Width reported to listeners; zero for raw keys.
    pub fn width(&self) -> u32 {
        self.size.map_or(0, |s| s.width)
    }

    /// Height reported to listeners; zero for raw keys.
    pub fn height(&self) -> u32 {
        self.size.map_or(0, |s| s.height)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.size {
            Some(s) => write!(f, "{}@{}x{}", self.identifier, s.width, s.height),
            None => write!(f, "{}@raw", self.identifier),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn equality_covers_every_field() {
        let a = CacheKey::scaled("x.jpg", 100, 100).unwrap();
        assert_eq!(a, CacheKey::scaled("x.jpg", 100, 100).unwrap());
        assert_ne!(a, CacheKey::scaled("x.jpg", 100, 101).unwrap());
        assert_ne!(a, CacheKey::scaled("x.jpg", 101, 100).unwrap());
        assert_ne!(a, CacheKey::scaled("y.jpg", 100, 100).unwrap());
        assert_ne!(a, CacheKey::raw("x.jpg").unwrap());
    }

    // Dimension pairs which a naive `31 * h + w` style hash would fold together must stay distinct keys.
    #[test]
    fn transposed_sizes_are_distinct() {
        let mut set = HashSet::new();
        set.insert(CacheKey::scaled("a", 1, 32).unwrap());
        set.insert(CacheKey::scaled("a", 32, 1).unwrap());
        set.insert(CacheKey::scaled("a", 2, 1).unwrap());
        set.insert(CacheKey::scaled("a", 1, 2).unwrap());
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn invalid_keys() {
        assert_eq!(CacheKey::raw(""), Err(KeyError::EmptyIdentifier));
        assert_eq!(CacheKey::scaled("", 10, 10), Err(KeyError::EmptyIdentifier));
        assert_eq!(
            CacheKey::scaled("a", 0, 10),
            Err(KeyError::ZeroDimension {
                width: 0,
                height: 10
            })
        );
    }

    #[test]
    fn raw_keys_report_zero_size() {
        let key = CacheKey::raw("a").unwrap();
        assert_eq!(key.size(), None);
        assert_eq!((key.width(), key.height()), (0, 0));
        assert_eq!(format!("{:?}", key), "a@raw");
    }
}
