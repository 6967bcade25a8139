//! In-place decryption of sops-encrypted documents (AES-256-GCM values).
//!
//! A document is encrypted when it carries a top-level `sops` mapping. Every string
//! value of the form `ENC[AES256_GCM,data:..,iv:..,tag:..,type:..]` is decrypted with
//! one of the supplied data keys; the additional data is the mapping key path joined
//! by `:` with a trailing `:`.

use aes_gcm::aead::consts::U32;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_yaml::Value;

use crate::PostBuildError;

pub const METADATA_KEY: &str = "sops";
/// Suffix of decryption-secret entries holding a data key.
pub const DATA_KEY_SUFFIX: &str = ".datakey";

const ENC_PREFIX: &str = "ENC[AES256_GCM,";
const KEY_LEN: usize = 32;
const IV_LEN: usize = 32;
const TAG_LEN: usize = 16;

pub(crate) type SopsCipher = AesGcm<Aes256, U32>;

/// An unwrapped 256-bit sops data key.
#[derive(Clone)]
pub struct DataKey([u8; KEY_LEN]);

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(..)")
    }
}

impl DataKey {
    /// Accepts either 32 raw bytes or their base64 text.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, PostBuildError> {
        let bytes = if raw.len() == KEY_LEN {
            raw.to_vec()
        } else {
            let text = std::str::from_utf8(raw)
                .map_err(|_| PostBuildError::Decryption("data key is neither 32 bytes nor base64 text".into()))?;
            STANDARD
                .decode(text.trim())
                .map_err(|e| PostBuildError::Decryption(format!("data key is not valid base64: {}", e)))?
        };
        let key: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PostBuildError::Decryption(format!("data key must be {} bytes, got {}", KEY_LEN, bytes.len())))?;
        Ok(Self(key))
    }

    pub(crate) fn cipher(&self) -> SopsCipher {
        SopsCipher::new(GenericArray::from_slice(&self.0))
    }
}

struct Encrypted {
    data: Vec<u8>,
    iv: Vec<u8>,
    tag: Vec<u8>,
    kind: String,
}

pub fn is_encrypted_document(doc: &Value) -> bool {
    doc.as_mapping().map(|m| m.contains_key(METADATA_KEY)).unwrap_or(false)
}

/// Decrypt every encrypted value of `doc` and drop its `sops` metadata.
/// Returns `false` (and leaves the document alone) when it is not sops-encrypted.
pub fn decrypt_document(doc: &mut Value, keys: &[DataKey]) -> Result<bool, PostBuildError> {
    let Some(map) = doc.as_mapping_mut() else { return Ok(false) };
    if map.remove(METADATA_KEY).is_none() {
        return Ok(false);
    }
    if keys.is_empty() {
        return Err(PostBuildError::Decryption("document is sops-encrypted but no data keys are configured".into()));
    }
    let mut path = Vec::new();
    walk(doc, &mut path, keys)?;
    Ok(true)
}

fn walk(v: &mut Value, path: &mut Vec<String>, keys: &[DataKey]) -> Result<(), PostBuildError> {
    let replacement = match v {
        Value::Mapping(m) => {
            for (k, child) in m.iter_mut() {
                path.push(key_string(k));
                walk(child, path, keys)?;
                path.pop();
            }
            None
        }
        Value::Sequence(items) => {
            for child in items.iter_mut() {
                walk(child, path, keys)?;
            }
            None
        }
        Value::String(s) => match parse_encrypted(s) {
            Some(enc) => Some(decrypt_value(&enc?, path, keys)?),
            None => None,
        },
        _ => None,
    };
    if let Some(new) = replacement {
        *v = new;
    }
    Ok(())
}

fn key_string(k: &Value) -> String {
    match k {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn parse_encrypted(s: &str) -> Option<Result<Encrypted, PostBuildError>> {
    let body = s.strip_prefix(ENC_PREFIX)?.strip_suffix(']')?;
    Some(parse_fields(body))
}

fn parse_fields(body: &str) -> Result<Encrypted, PostBuildError> {
    let malformed = |what: String| PostBuildError::Decryption(format!("malformed encrypted value: {}", what));
    let (mut data, mut iv, mut tag, mut kind) = (None, None, None, None);
    for part in body.split(',') {
        let (k, v) = part.split_once(':').ok_or_else(|| malformed("expected key:value pairs".into()))?;
        match k {
            "data" => data = Some(v),
            "iv" => iv = Some(v),
            "tag" => tag = Some(v),
            "type" => kind = Some(v),
            _ => {}
        }
    }
    let decode = |field: Option<&str>, name: &str| -> Result<Vec<u8>, PostBuildError> {
        let text = field.ok_or_else(|| malformed(format!("missing {}", name)))?;
        STANDARD.decode(text).map_err(|e| malformed(format!("{}: {}", name, e)))
    };
    Ok(Encrypted {
        data: decode(data, "data")?,
        iv: decode(iv, "iv")?,
        tag: decode(tag, "tag")?,
        kind: kind.unwrap_or("str").to_string(),
    })
}

fn decrypt_value(enc: &Encrypted, path: &[String], keys: &[DataKey]) -> Result<Value, PostBuildError> {
    let at = path.join(":");
    if enc.iv.len() != IV_LEN || enc.tag.len() != TAG_LEN {
        return Err(PostBuildError::Decryption(format!("{}: unexpected iv or tag length", at)));
    }
    let aad = format!("{}:", at);
    let mut msg = enc.data.clone();
    msg.extend_from_slice(&enc.tag);
    let nonce = GenericArray::from_slice(&enc.iv);
    let plain = keys
        .iter()
        .find_map(|k| k.cipher().decrypt(nonce, Payload { msg: &msg, aad: aad.as_bytes() }).ok())
        .ok_or_else(|| PostBuildError::Decryption(format!("{}: no data key could decrypt the value", at)))?;
    let text = String::from_utf8(plain)
        .map_err(|_| PostBuildError::Decryption(format!("{}: decrypted value is not UTF-8", at)))?;
    typed_value(&text, &enc.kind).map_err(|e| PostBuildError::Decryption(format!("{}: {}", at, e)))
}

fn typed_value(text: &str, kind: &str) -> Result<Value, String> {
    match kind {
        "str" | "bytes" => Ok(Value::String(text.to_string())),
        "int" => text.parse::<i64>().map(Value::from).map_err(|e| format!("invalid int: {}", e)),
        "float" => text.parse::<f64>().map(Value::from).map_err(|e| format!("invalid float: {}", e)),
        "bool" => match text {
            "true" | "True" => Ok(Value::Bool(true)),
            "false" | "False" => Ok(Value::Bool(false)),
            other => Err(format!("invalid bool: {}", other)),
        },
        other => Err(format!("unsupported value type {}", other)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Encrypt the way sops does, for fixtures.
    pub fn encrypt(key: &DataKey, iv: [u8; IV_LEN], plain: &str, aad: &str, kind: &str) -> String {
        let out = key
            .cipher()
            .encrypt(GenericArray::from_slice(&iv), Payload { msg: plain.as_bytes(), aad: aad.as_bytes() })
            .unwrap();
        let (data, tag) = out.split_at(out.len() - TAG_LEN);
        format!(
            "ENC[AES256_GCM,data:{},iv:{},tag:{},type:{}]",
            STANDARD.encode(data),
            STANDARD.encode(iv),
            STANDARD.encode(tag),
            kind
        )
    }
}
