//! Digest model for the content-addressable store.
//!
//! A blob is addressed by `(instance name, hash algorithm, hash, size)`. Two
//! digests are only interchangeable when they agree on the instance name and
//! the algorithm, so both are carried inside every [`Digest`].

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("instance name {0:?} contains an invalid component")]
    InvalidInstanceName(String),

    #[error("digest function was not set or is not supported")]
    UnknownDigestFunction,

    #[error("hash {hash:?} is not a valid lowercase hex string of {expected} characters")]
    InvalidHash { hash: String, expected: usize },

    #[error("blob size {0} is negative")]
    NegativeSize(i64),
}

/// Name of a logical CAS namespace. May be empty; otherwise a slash-separated
/// sequence of non-empty components that are not `.` or `..`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceName(String);

impl InstanceName {
    pub fn new(name: impl Into<String>) -> Result<Self, DigestError> {
        let name = name.into();
        if !name.is_empty() {
            for part in name.split('/') {
                if part.is_empty() || part == "." || part == ".." {
                    return Err(DigestError::InvalidInstanceName(name));
                }
            }
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-hash algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestKind {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestKind {
    /// Length of the lowercase hex encoding of a hash.
    pub fn hash_len(self) -> usize {
        match self {
            DigestKind::Sha256 => 64,
            DigestKind::Sha384 => 96,
            DigestKind::Sha512 => 128,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DigestKind::Sha256 => "sha256",
            DigestKind::Sha384 => "sha384",
            DigestKind::Sha512 => "sha512",
        }
    }
}

/// The `(instance name, hash algorithm)` pair a build operates under. All
/// digests created through it inherit the pair, which makes compatibility a
/// field comparison instead of a convention.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DigestFunction {
    instance: InstanceName,
    kind: DigestKind,
}

impl DigestFunction {
    pub fn new(instance: InstanceName, kind: DigestKind) -> Self {
        Self { instance, kind }
    }

    pub fn instance(&self) -> &InstanceName {
        &self.instance
    }

    pub fn kind(&self) -> DigestKind {
        self.kind
    }

    /// Validate a raw `(hash, size)` pair against this function.
    pub fn new_digest(&self, hash: &str, size_bytes: u64) -> Result<Digest, DigestError> {
        let expected = self.kind.hash_len();
        if hash.len() != expected || !hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(DigestError::InvalidHash {
                hash: hash.to_string(),
                expected,
            });
        }
        Ok(Digest {
            instance: self.instance.clone(),
            kind: self.kind,
            hash: hash.to_string(),
            size_bytes,
        })
    }
}

impl fmt::Display for DigestFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance, self.kind.as_str())
    }
}

/// Address of a single blob.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    instance: InstanceName,
    kind: DigestKind,
    hash: String,
    size_bytes: u64,
}

impl Digest {
    pub fn instance(&self) -> &InstanceName {
        &self.instance
    }

    pub fn kind(&self) -> DigestKind {
        self.kind
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// The digest function this blob was addressed under.
    pub fn function(&self) -> DigestFunction {
        DigestFunction::new(self.instance.clone(), self.kind)
    }

    /// Whether this digest can be used by a build running under `function`.
    pub fn uses_function(&self, function: &DigestFunction) -> bool {
        self.instance == *function.instance() && self.kind == function.kind()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.instance.is_empty() {
            write!(f, "{}/{}-{}", self.kind.as_str(), self.hash, self.size_bytes)
        } else {
            write!(
                f,
                "{}/{}/{}-{}",
                self.instance,
                self.kind.as_str(),
                self.hash,
                self.size_bytes
            )
        }
    }
}

/// Ordered set of digests, deduplicated by full address.
pub type DigestSet = BTreeSet<Digest>;
