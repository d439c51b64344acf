//! Identifiers used in docsync.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Number of bytes in an identifier.
pub const ID_LEN: usize = 32;

/// Error returned when parsing an identifier from a string fails.
#[derive(Debug, thiserror::Error)]
pub enum ParseIdError {
    /// The input was not valid hex.
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    /// The input did not decode to exactly 32 bytes.
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

macro_rules! id_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
            derive_more::From,
        )]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// The identifier as a byte array.
            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }

            /// Convert into the inner byte array.
            pub fn to_bytes(self) -> [u8; ID_LEN] {
                self.0
            }

            /// Hex representation of the first five bytes, for logging.
            pub fn fmt_short(&self) -> String {
                hex::encode(&self.0[..5])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.fmt_short())
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s)?;
                let bytes: [u8; ID_LEN] = bytes
                    .try_into()
                    .map_err(|v: Vec<u8>| ParseIdError::Length(v.len()))?;
                Ok(Self(bytes))
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

id_type!(
    DocId,
    "Identifier for a document.\n\nOpaque to the sync engine; assigned by whoever creates the document."
);
id_type!(
    PeerId,
    "Identifier for a synchronization peer (another device, tab or server)."
);
id_type!(
    BlobKey,
    "Content-derived identifier for a blob.\n\nSame content, same key: the key is the blake3 hash of the blob bytes."
);

impl DocId {
    /// Create a random document id.
    pub fn random<R: rand::Rng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; ID_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl PeerId {
    /// Create a random peer id.
    pub fn random<R: rand::Rng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; ID_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl BlobKey {
    /// Compute the key for a blob's content.
    pub fn for_content(data: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(data.as_ref()).as_bytes())
    }
}
