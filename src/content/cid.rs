//! Content identifiers
//!
//! CIDv1 with a sha2-256 multihash. The textual form is multibase
//! base58btc (`z` prefix) and the JSON form is the IPLD link shape
//! `{"/": "z..."}`.

use super::ContentError;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const CID_VERSION: u64 = 1;
const SHA2_256: u64 = 0x12;
const DIGEST_LEN: usize = 32;
const BASE58BTC_PREFIX: char = 'z';

/// Multicodec of the block a CID points to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// Raw payload bytes (leaf)
    Raw,
    /// JSON-encoded DAG node linking other blocks
    DagJson,
}

impl Codec {
    pub fn code(self) -> u64 {
        match self {
            Codec::Raw => 0x55,
            Codec::DagJson => 0x0129,
        }
    }

    pub fn from_code(code: u64) -> Result<Self, ContentError> {
        match code {
            0x55 => Ok(Codec::Raw),
            0x0129 => Ok(Codec::DagJson),
            other => Err(ContentError::UnsupportedCodec(other)),
        }
    }
}

/// Self-describing fingerprint of a block
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId {
    codec: Codec,
    digest: [u8; DIGEST_LEN],
}

impl ContentId {
    /// Address a block by its bytes
    pub fn for_block(codec: Codec, data: &[u8]) -> Self {
        Self {
            codec,
            digest: Sha256::digest(data).into(),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Check that `data` hashes to this identifier
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::for_block(self.codec, data) == *self
    }

    /// Binary CID: version, codec, multihash code, digest length, digest
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DIGEST_LEN + 6);
        write_varint(CID_VERSION, &mut out);
        write_varint(self.codec.code(), &mut out);
        write_varint(SHA2_256, &mut out);
        write_varint(DIGEST_LEN as u64, &mut out);
        out.extend_from_slice(&self.digest);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContentError> {
        let mut cursor = bytes;

        let version = read_varint(&mut cursor)?;
        if version != CID_VERSION {
            return Err(ContentError::UnsupportedVersion(version));
        }

        let codec = Codec::from_code(read_varint(&mut cursor)?)?;

        let hash_code = read_varint(&mut cursor)?;
        if hash_code != SHA2_256 {
            return Err(ContentError::UnsupportedHash(hash_code));
        }

        let len = read_varint(&mut cursor)? as usize;
        if len != DIGEST_LEN || cursor.len() != DIGEST_LEN {
            return Err(ContentError::InvalidCid(format!(
                "digest length {} (have {} bytes)",
                len,
                cursor.len()
            )));
        }

        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(cursor);
        Ok(Self { codec, digest })
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            BASE58BTC_PREFIX,
            bs58::encode(self.to_bytes()).into_string()
        )
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self)
    }
}

impl FromStr for ContentId {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix(BASE58BTC_PREFIX)
            .ok_or_else(|| ContentError::InvalidCid(format!("unsupported multibase: {}", s)))?;

        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| ContentError::InvalidCid(e.to_string()))?;

        Self::from_bytes(&bytes)
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("/", &self.to_string())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, String>::deserialize(deserializer)?;
        let link = map
            .get("/")
            .ok_or_else(|| de::Error::missing_field("/"))?;
        link.parse().map_err(de::Error::custom)
    }
}

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(cursor: &mut &[u8]) -> Result<u64, ContentError> {
    let mut value = 0u64;
    for (i, byte) in cursor.iter().enumerate().take(9) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            *cursor = &cursor[i + 1..];
            return Ok(value);
        }
    }
    Err(ContentError::InvalidCid("truncated varint".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_is_content_addressed() {
        let a = ContentId::for_block(Codec::Raw, b"same bytes");
        let b = ContentId::for_block(Codec::Raw, b"same bytes");
        let c = ContentId::for_block(Codec::Raw, b"other bytes");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.verify(b"same bytes"));
        assert!(!a.verify(b"other bytes"));
    }

    #[test]
    fn test_codec_changes_cid() {
        let raw = ContentId::for_block(Codec::Raw, b"x");
        let dag = ContentId::for_block(Codec::DagJson, b"x");

        assert_ne!(raw, dag);
        assert_ne!(raw.to_string(), dag.to_string());
    }

    #[test]
    fn test_string_form() {
        let cid = ContentId::for_block(Codec::DagJson, b"node");
        let text = cid.to_string();

        assert!(text.starts_with('z'));
        assert_eq!(text.parse::<ContentId>().unwrap(), cid);
        assert_eq!(cid.to_bytes()[..4], [0x01, 0xa9, 0x02, 0x12]);
    }

    #[test]
    fn test_json_link_form() {
        let cid = ContentId::for_block(Codec::Raw, b"payload");
        let json = serde_json::to_string(&cid).unwrap();

        assert_eq!(json, format!(r#"{{"/":"{}"}}"#, cid));
        assert_eq!(serde_json::from_str::<ContentId>(&json).unwrap(), cid);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("Qmabc".parse::<ContentId>().is_err());
        assert!("z".parse::<ContentId>().is_err());
        assert!("z0OIl".parse::<ContentId>().is_err());

        let mut bytes = ContentId::for_block(Codec::Raw, b"x").to_bytes();
        bytes.pop();
        assert!(ContentId::from_bytes(&bytes).is_err());

        let mut bytes = ContentId::for_block(Codec::Raw, b"x").to_bytes();
        bytes[0] = 2;
        assert!(matches!(
            ContentId::from_bytes(&bytes),
            Err(ContentError::UnsupportedVersion(2))
        ));
    }
}
