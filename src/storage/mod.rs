//! Content-addressed storage boundary.
//!
//! Blobs are file maps (`file name -> bytes`) addressed by a sha2-256
//! digest. A [`ContentHash`] renders as a base16 CIDv1 string for the
//! side channel and as a raw multihash for on-chain reporting.

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::StorageError;

pub use memory::{CallTracker, InMemoryContentStore};

/// A stored blob: file name to contents.
pub type Files = BTreeMap<String, Vec<u8>>;

/// Multihash code for sha2-256.
const SHA2_256: u8 = 0x12;
/// Digest length of sha2-256.
const DIGEST_LEN: u8 = 0x20;
/// CID version byte.
const CID_V1: u8 = 0x01;
/// dag-pb multicodec.
const DAG_PB: u8 = 0x70;
/// Multibase prefix for lowercase base16.
const BASE16_PREFIX: char = 'f';
/// Length of a base16 CIDv1 string: prefix plus 36 hex-encoded bytes.
const CID_STR_LEN: usize = 1 + 2 * 36;

/// Address of a blob in the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash {
    digest: [u8; 32],
}

impl ContentHash {
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self { digest }
    }

    /// Hash of a single byte string.
    pub fn of(bytes: &[u8]) -> Self {
        Self::from_digest(Sha256::digest(bytes).into())
    }

    /// Hash of a file map. Names and contents are length-prefixed so that
    /// different layouts never collide.
    pub fn of_files(files: &Files) -> Self {
        let mut hasher = Sha256::new();
        for (name, contents) in files {
            hasher.update((name.len() as u64).to_be_bytes());
            hasher.update(name.as_bytes());
            hasher.update((contents.len() as u64).to_be_bytes());
            hasher.update(contents);
        }
        Self::from_digest(hasher.finalize().into())
    }

    /// Decode the payload reference carried by an on-chain request: either
    /// a bare 32-byte digest or a sha2-256 multihash.
    pub fn from_request_data(data: &[u8]) -> Result<Self, StorageError> {
        let digest = match data {
            [SHA2_256, DIGEST_LEN, rest @ ..] if rest.len() == 32 => rest,
            _ if data.len() == 32 => data,
            _ => {
                return Err(StorageError::InvalidHash(format!(
                    "request data is {} bytes, expected a 32-byte digest or a multihash",
                    data.len()
                )));
            }
        };
        let mut out = [0u8; 32];
        out.copy_from_slice(digest);
        Ok(Self::from_digest(out))
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Canonical sha2-256 multihash bytes.
    pub fn multihash(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(34);
        out.push(SHA2_256);
        out.push(DIGEST_LEN);
        out.extend_from_slice(&self.digest);
        out
    }

    /// Hex form of the multihash, as reported on chain.
    pub fn to_multihash_hex(&self) -> String {
        hex::encode(self.multihash())
    }

    /// Base16 CIDv1 string.
    pub fn to_cid_v1(&self) -> String {
        format!(
            "{BASE16_PREFIX}{}",
            hex::encode([CID_V1, DAG_PB, SHA2_256, DIGEST_LEN])
                + &hex::encode(self.digest)
        )
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cid_v1())
    }
}

impl FromStr for ContentHash {
    type Err = StorageError;

    /// Accepts a base16 CIDv1 (`f0170…`), a hex multihash (`1220…`) or a
    /// hex digest, each optionally `0x`-prefixed where hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StorageError::InvalidHash(s.to_string());
        if s.len() == CID_STR_LEN
            && let Some(cid) = s.strip_prefix(BASE16_PREFIX)
        {
            let bytes = hex::decode(cid).map_err(|_| invalid())?;
            return match bytes.as_slice() {
                [CID_V1, _codec, rest @ ..] => Self::from_request_data(rest),
                _ => Err(invalid()),
            };
        }
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|_| invalid())?;
        Self::from_request_data(&bytes)
    }
}

/// Content-addressed store collaborator.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetch a blob by hash.
    async fn get(&self, hash: &ContentHash) -> Result<Files, StorageError>;

    /// Store a blob and return its hash.
    async fn put(&self, files: Files) -> Result<ContentHash, StorageError>;
}
