use kdbcrypt_core::entry::Value;
use thiserror::Error;
use zeroize::Zeroizing;

/// Leading bytes of every encrypted value.
pub const MAGIC: &[u8; 4] = b"#!kc";
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// magic | algorithm | generation (u32 BE) | nonce
pub const HEADER_LEN: usize = MAGIC.len() + 1 + 4 + NONCE_LEN;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("value is not a kdbcrypt payload")]
    NotAPayload,
    #[error("payload truncated: {len} bytes")]
    Truncated { len: usize },
    #[error("unknown algorithm id {0}")]
    UnknownAlgorithm(u8),
    #[error("unknown plaintext kind {0}")]
    UnknownKind(u8),
    #[error("empty plaintext")]
    EmptyPlaintext,
    #[error("string value is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Algorithm {
    Aes256Gcm = 1,
}

impl TryFrom<u8> for Algorithm {
    type Error = PayloadError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Algorithm::Aes256Gcm),
            other => Err(PayloadError::UnknownAlgorithm(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub algorithm: Algorithm,
    pub generation: u32,
    pub nonce: [u8; NONCE_LEN],
}

impl PayloadHeader {
    /// Serialised header; also the associated data authenticated with the ciphertext.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4] = self.algorithm as u8;
        out[5..9].copy_from_slice(&self.generation.to_be_bytes());
        out[9..].copy_from_slice(&self.nonce);
        out
    }
}

/// Header followed by ciphertext and authentication tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub header: PayloadHeader,
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, PayloadError> {
        if !has_magic(bytes) {
            return Err(PayloadError::NotAPayload);
        }
        // Every payload carries at least the plaintext kind byte plus the tag.
        if bytes.len() < HEADER_LEN + 1 + TAG_LEN {
            return Err(PayloadError::Truncated { len: bytes.len() });
        }
        let algorithm = Algorithm::try_from(bytes[4])?;
        let mut generation = [0u8; 4];
        generation.copy_from_slice(&bytes[5..9]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[9..HEADER_LEN]);

        Ok(Self {
            header: PayloadHeader {
                algorithm,
                generation: u32::from_be_bytes(generation),
                nonce,
            },
            ciphertext: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

/// Full-length prefix check; shorter buffers never match.
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC
}

const KIND_STRING: u8 = 0;
const KIND_BINARY: u8 = 1;
const KIND_NULL: u8 = 2;

/// Plaintext sealed for an entry: one kind byte so the original type survives, then the bytes.
pub fn encode_plaintext(value: &Value) -> Zeroizing<Vec<u8>> {
    let (kind, bytes): (u8, &[u8]) = match value {
        Value::String(s) => (KIND_STRING, s.as_bytes()),
        Value::Binary(Some(b)) => (KIND_BINARY, b),
        Value::Binary(None) => (KIND_NULL, &[]),
    };
    let mut out = Zeroizing::new(Vec::with_capacity(bytes.len() + 1));
    out.push(kind);
    out.extend_from_slice(bytes);
    out
}

pub fn decode_plaintext(plaintext: &[u8]) -> Result<Value, PayloadError> {
    let (kind, body) = plaintext
        .split_first()
        .ok_or(PayloadError::EmptyPlaintext)?;
    match *kind {
        KIND_STRING => std::str::from_utf8(body)
            .map(|s| Value::String(s.to_string()))
            .map_err(|_| PayloadError::InvalidUtf8),
        KIND_BINARY => Ok(Value::Binary(Some(body.to_vec()))),
        KIND_NULL if body.is_empty() => Ok(Value::Binary(None)),
        other => Err(PayloadError::UnknownKind(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedPayload {
        EncryptedPayload {
            header: PayloadHeader {
                algorithm: Algorithm::Aes256Gcm,
                generation: 7,
                nonce: [9u8; NONCE_LEN],
            },
            ciphertext: vec![0xAB; 1 + TAG_LEN],
        }
    }

    #[test]
    fn header_layout_is_stable() {
        let bytes = sample().to_bytes();
        assert_eq!(&bytes[..4], b"#!kc");
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[5..9], &[0, 0, 0, 7]);
        assert_eq!(bytes.len(), HEADER_LEN + 1 + TAG_LEN);
        assert_eq!(EncryptedPayload::parse(&bytes), Ok(sample()));
    }

    #[test]
    fn rejects_foreign_short_and_unknown() {
        assert_eq!(
            EncryptedPayload::parse(b"abcde"),
            Err(PayloadError::NotAPayload)
        );
        assert_eq!(EncryptedPayload::parse(b"#!k"), Err(PayloadError::NotAPayload));

        let bytes = sample().to_bytes();
        assert_eq!(
            EncryptedPayload::parse(&bytes[..HEADER_LEN + TAG_LEN]),
            Err(PayloadError::Truncated {
                len: HEADER_LEN + TAG_LEN
            })
        );

        let mut bytes = bytes;
        bytes[4] = 9;
        assert_eq!(
            EncryptedPayload::parse(&bytes),
            Err(PayloadError::UnknownAlgorithm(9))
        );
    }

    #[test]
    fn plaintext_keeps_type() {
        for value in [
            Value::String(String::new()),
            Value::String("abcde".into()),
            Value::Binary(None),
            Value::Binary(Some(Vec::new())),
            Value::Binary(Some(vec![1, 2, 3, 4])),
        ] {
            let encoded = encode_plaintext(&value);
            assert_eq!(decode_plaintext(&encoded), Ok(value));
        }
    }

    #[test]
    fn plaintext_rejects_bad_input() {
        assert_eq!(decode_plaintext(&[]), Err(PayloadError::EmptyPlaintext));
        assert_eq!(decode_plaintext(&[7]), Err(PayloadError::UnknownKind(7)));
        assert_eq!(decode_plaintext(&[2, 1]), Err(PayloadError::UnknownKind(2)));
        assert_eq!(
            decode_plaintext(&[0, 0xff, 0xfe]),
            Err(PayloadError::InvalidUtf8)
        );
    }
}
