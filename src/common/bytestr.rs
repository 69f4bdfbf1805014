use bytes::Bytes;

/// A cheaply cloneable and sliceable UTF-8 string.
///
/// Avoids the allocation `String::from_utf8` would require when the bytes
/// already live in a reference-counted [`Bytes`] buffer.
#[derive(Clone, Default)]
pub struct ByteStr {
    bytes: Bytes,
}

impl ByteStr {
    /// Converts `Bytes` to a `ByteStr`, validating UTF-8.
    pub fn from_utf8(bytes: Bytes) -> Result<Self, std::str::Utf8Error> {
        std::str::from_utf8(&bytes)?;
        Ok(Self { bytes })
    }

    /// Creates a `ByteStr` by copying a `&str`.
    pub fn copy_from_str(string: &str) -> Self {
        Self { bytes: Bytes::copy_from_slice(string.as_bytes()) }
    }

    /// Returns the string slice.
    pub fn as_str(&self) -> &str {
        // SAFETY: only constructed from validated UTF-8 bytes.
        unsafe { std::str::from_utf8_unchecked(&self.bytes) }
    }

    /// Slices `self` by a `subset` that is known to point inside `self`'s buffer.
    ///
    /// This is `O(1)`; see [`Bytes::slice_ref`].
    pub fn slice_ref(&self, subset: &str) -> Self {
        Self { bytes: Bytes::slice_ref(&self.bytes, subset.as_bytes()) }
    }
}

impl AsRef<str> for ByteStr {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::ops::Deref for ByteStr {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl std::fmt::Display for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.as_str(), f)
    }
}

impl PartialEq for ByteStr {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl PartialEq<str> for ByteStr {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for ByteStr {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl From<&str> for ByteStr {
    fn from(value: &str) -> Self {
        Self::copy_from_str(value)
    }
}

impl From<String> for ByteStr {
    fn from(value: String) -> Self {
        Self { bytes: Bytes::from(value.into_bytes()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_ref_is_zero_copy_view() {
        let whole = ByteStr::copy_from_str("user:pass@host");
        let sliced = whole.slice_ref(&whole["user".len() + 1..whole.find('@').unwrap()]);
        assert_eq!(sliced, *"pass");
    }
}
