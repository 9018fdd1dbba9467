//! Reference-counted payload carriers.
//!
//! The engine never interprets message contents; a payload is one or
//! more refcounted slices. Cloning a [`Slice`] or a [`ByteBuffer`]
//! bumps refcounts, it does not copy bytes. All byte copies are
//! explicit constructors.

use bytes::Bytes;
use std::fmt;

/// One refcounted run of bytes.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Slice(Bytes);

impl Slice {
    /// Copies `data` into a freshly allocated slice.
    #[inline]
    pub fn from_copied(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }

    /// Borrows a static run without copying.
    #[inline]
    pub fn from_static(data: &'static [u8]) -> Self {
        Self(Bytes::from_static(data))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Slice {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Slice {
    #[inline]
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<Bytes> for Slice {
    #[inline]
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl From<&str> for Slice {
    #[inline]
    fn from(s: &str) -> Self {
        Self::from_copied(s.as_bytes())
    }
}

impl fmt::Debug for Slice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "slice[{}]", self.0.len())
    }
}

/// An opaque message payload built from 1..N slices.
///
/// Sending transfers an owned reference; the bytes underneath must not
/// be mutated while a batch referencing them is in flight. A received
/// buffer belongs to the caller and is released by dropping it.
#[derive(Clone, Default)]
pub struct ByteBuffer {
    slices: Vec<Slice>,
}

impl ByteBuffer {
    #[inline]
    pub fn from_slice(s: Slice) -> Self {
        Self { slices: vec![s] }
    }

    #[inline]
    pub fn from_slices(slices: Vec<Slice>) -> Self {
        Self { slices }
    }

    /// Copies `data` into a single-slice buffer.
    #[inline]
    pub fn from_copied(data: &[u8]) -> Self {
        Self::from_slice(Slice::from_copied(data))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slices.iter().map(|s| s.len()).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    /// Flattens the payload into one owned vector. This is the explicit
    /// copy; nothing else in the engine copies payload bytes.
    pub fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for s in &self.slices {
            out.extend_from_slice(s.as_ref());
        }
        out
    }
}

impl From<&str> for ByteBuffer {
    #[inline]
    fn from(s: &str) -> Self {
        Self::from_copied(s.as_bytes())
    }
}

impl PartialEq for ByteBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.concat() == other.concat()
    }
}

impl PartialEq<[u8]> for ByteBuffer {
    fn eq(&self, other: &[u8]) -> bool {
        self.concat() == other
    }
}

impl PartialEq<&str> for ByteBuffer {
    fn eq(&self, other: &&str) -> bool {
        self.concat() == other.as_bytes()
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bytes[{}x{}]", self.slices.len(), self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_slice_concat() {
        let b = ByteBuffer::from_slices(vec![
            Slice::from_copied(b"hello "),
            Slice::from_copied(b"world"),
        ]);
        assert_eq!(b.len(), 11);
        assert_eq!(b, "hello world");
    }

    #[test]
    fn test_clone_shares_bytes() {
        let s = Slice::from_copied(&[0u8, 0xFF, 0x7F]);
        let b = ByteBuffer::from_slice(s.clone());
        let b2 = b.clone();
        drop(b);
        assert_eq!(b2.concat(), vec![0u8, 0xFF, 0x7F]);
    }
}
