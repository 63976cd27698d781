// PII field encryption with key rotation support.
// Uses AES-256-GCM with versioned keys; ciphertexts are self-identifying
// ($enc$ prefix) so encrypt and decrypt are both idempotent and data
// written before a key existed stays readable verbatim.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use conveyor_core::DataMap;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const PREFIX: &str = "$enc$";

#[derive(Clone)]
struct VersionedKey {
    id: String,
    cipher: Aes256Gcm,
}

/// Encrypts marked fields of resource / instance / user data maps.
/// Thread-safe and cheap to clone; disabled mode (no key configured)
/// passes data through untouched in both directions.
#[derive(Clone, Default)]
pub struct FieldEncryptor {
    primary: Option<Arc<VersionedKey>>,
    /// All keys (including primary) available for decryption
    keys: Arc<HashMap<String, Aes256Gcm>>,
    pii_fields: Arc<HashSet<String>>,
}

impl FieldEncryptor {
    /// Disabled encryptor: everything passes through verbatim.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Create from versioned key strings in format "key_id:base64_key".
    /// The primary key is used for new encryptions; previous keys stay
    /// available for decryption during rotation.
    pub fn new(
        primary_key: &str,
        previous_keys: &[String],
        pii_fields: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        let (primary_id, primary_cipher) = parse_versioned_key(primary_key)?;

        let mut keys = HashMap::new();
        keys.insert(primary_id.clone(), primary_cipher.clone());
        for key_str in previous_keys {
            let (id, cipher) = parse_versioned_key(key_str)?;
            if keys.contains_key(&id) {
                anyhow::bail!("duplicate key id: {}", id);
            }
            keys.insert(id, cipher);
        }

        Ok(Self {
            primary: Some(Arc::new(VersionedKey {
                id: primary_id,
                cipher: primary_cipher,
            })),
            keys: Arc::new(keys),
            pii_fields: Arc::new(pii_fields.into_iter().collect()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.primary.is_some()
    }

    pub fn is_pii_field(&self, name: &str) -> bool {
        self.pii_fields.contains(name)
    }

    /// Whether a value is a self-identifying ciphertext.
    pub fn is_encrypted(value: &Value) -> bool {
        matches!(value, Value::String(s) if s.starts_with(PREFIX))
    }

    /// Encrypt a single value. Already-encrypted values are returned
    /// unchanged so re-encryption never double-wraps.
    pub fn encrypt_value(&self, value: &Value) -> Result<Value> {
        let Some(primary) = &self.primary else {
            return Ok(value.clone());
        };
        if Self::is_encrypted(value) {
            return Ok(value.clone());
        }

        let plaintext = serde_json::to_vec(value).context("failed to serialize PII value")?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = primary
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| anyhow::anyhow!("encryption failed: {}", e))?;

        Ok(Value::String(format!(
            "{}{}${}${}",
            PREFIX,
            primary.id,
            BASE64.encode(nonce_bytes),
            BASE64.encode(&ciphertext)
        )))
    }

    /// Decrypt a single value. Plaintext values are returned unchanged;
    /// with no keys configured, ciphertexts are returned verbatim.
    pub fn decrypt_value(&self, value: &Value) -> Result<Value> {
        let Value::String(s) = value else {
            return Ok(value.clone());
        };
        let Some(rest) = s.strip_prefix(PREFIX) else {
            return Ok(value.clone());
        };
        if self.keys.is_empty() {
            return Ok(value.clone());
        }

        let mut parts = rest.splitn(3, '$');
        let (key_id, nonce_b64, ct_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => anyhow::bail!("malformed encrypted value"),
        };

        let cipher = self
            .keys
            .get(key_id)
            .with_context(|| format!("unknown encryption key id '{}'", key_id))?;

        let nonce_bytes = BASE64.decode(nonce_b64).context("failed to decode nonce")?;
        let ciphertext = BASE64
            .decode(ct_b64)
            .context("failed to decode ciphertext")?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| anyhow::anyhow!("decryption failed (data may be corrupted): {}", e))?;

        serde_json::from_slice(&plaintext).context("decrypted data is not valid JSON")
    }

    /// Encrypt every marked field of a data map, at any nesting depth.
    pub fn encrypt_map(&self, data: &DataMap) -> Result<DataMap> {
        if !self.enabled() || self.pii_fields.is_empty() {
            return Ok(data.clone());
        }
        data.iter()
            .map(|(k, v)| Ok((k.clone(), self.encrypt_field(k, v)?)))
            .collect()
    }

    /// Decrypt every marked field of a data map.
    pub fn decrypt_map(&self, data: &DataMap) -> Result<DataMap> {
        data.iter()
            .map(|(k, v)| Ok((k.clone(), self.decrypt_field(k, v)?)))
            .collect()
    }

    fn encrypt_field(&self, name: &str, value: &Value) -> Result<Value> {
        if self.is_pii_field(name) {
            return self.encrypt_value(value);
        }
        match value {
            Value::Object(fields) => Ok(Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.encrypt_field(k, v)?)))
                    .collect::<Result<_>>()?,
            )),
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|v| self.encrypt_field(name, v))
                    .collect::<Result<_>>()?,
            )),
            other => Ok(other.clone()),
        }
    }

    fn decrypt_field(&self, name: &str, value: &Value) -> Result<Value> {
        if Self::is_encrypted(value) {
            return self.decrypt_value(value);
        }
        match value {
            Value::Object(fields) => Ok(Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.decrypt_field(k, v)?)))
                    .collect::<Result<_>>()?,
            )),
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|v| self.decrypt_field(name, v))
                    .collect::<Result<_>>()?,
            )),
            other => Ok(other.clone()),
        }
    }
}

fn parse_versioned_key(key_str: &str) -> Result<(String, Aes256Gcm)> {
    let (key_id, encoded) = key_str
        .split_once(':')
        .context("invalid key format, expected 'key_id:base64_key'")?;

    let key_bytes = BASE64
        .decode(encoded)
        .context("failed to decode key from base64")?;
    if key_bytes.len() != KEY_SIZE {
        anyhow::bail!(
            "key must be {} bytes, got {} bytes for key id '{}'",
            KEY_SIZE,
            key_bytes.len(),
            key_id
        );
    }

    let cipher = Aes256Gcm::new_from_slice(&key_bytes)
        .map_err(|e| anyhow::anyhow!("failed to create cipher for key '{}': {}", key_id, e))?;
    Ok((key_id.to_string(), cipher))
}

/// Generate a new random encryption key in versioned format
/// ("key_id:base64_key").
pub fn generate_encryption_key(key_id: &str) -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    format!("{}:{}", key_id, BASE64.encode(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encryptor(fields: &[&str]) -> FieldEncryptor {
        let key = generate_encryption_key("kek-v1");
        FieldEncryptor::new(&key, &[], fields.iter().map(|s| s.to_string())).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let enc = encryptor(&["email"]);
        let mut data = DataMap::new();
        data.insert("email".into(), json!("alice@example.com"));
        data.insert("note".into(), json!("visible"));

        let encrypted = enc.encrypt_map(&data).unwrap();
        assert!(FieldEncryptor::is_encrypted(&encrypted["email"]));
        assert_eq!(encrypted["note"], json!("visible"));

        let decrypted = enc.decrypt_map(&encrypted).unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn test_encrypt_is_idempotent() {
        let enc = encryptor(&["phone"]);
        let mut data = DataMap::new();
        data.insert("phone".into(), json!("+1-555-0100"));

        let once = enc.encrypt_map(&data).unwrap();
        let twice = enc.encrypt_map(&once).unwrap();
        // No double-wrap: the ciphertext is unchanged
        assert_eq!(once, twice);
        assert_eq!(enc.decrypt_map(&twice).unwrap(), data);
    }

    #[test]
    fn test_decrypt_plaintext_is_noop() {
        let enc = encryptor(&["email"]);
        let mut data = DataMap::new();
        data.insert("email".into(), json!("stored-before-key-existed"));

        let decrypted = enc.decrypt_map(&data).unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn test_disabled_passthrough() {
        let enc = FieldEncryptor::disabled();
        let mut data = DataMap::new();
        data.insert("email".into(), json!("plain"));

        assert_eq!(enc.encrypt_map(&data).unwrap(), data);
        assert_eq!(enc.decrypt_map(&data).unwrap(), data);
    }

    #[test]
    fn test_nested_pii_fields() {
        let enc = encryptor(&["email"]);
        let mut data = DataMap::new();
        data.insert(
            "contact".into(),
            json!({"email": "deep@example.com", "city": "Utrecht"}),
        );

        let encrypted = enc.encrypt_map(&data).unwrap();
        assert!(FieldEncryptor::is_encrypted(&encrypted["contact"]["email"]));
        assert_eq!(encrypted["contact"]["city"], json!("Utrecht"));

        let decrypted = enc.decrypt_map(&encrypted).unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn test_key_rotation_reads_old_data() {
        let key_v1 = generate_encryption_key("kek-v1");
        let key_v2 = generate_encryption_key("kek-v2");

        let enc_v1 =
            FieldEncryptor::new(&key_v1, &[], vec!["email".to_string()]).unwrap();
        let mut data = DataMap::new();
        data.insert("email".into(), json!("old@example.com"));
        let encrypted_v1 = enc_v1.encrypt_map(&data).unwrap();

        let enc_v2 = FieldEncryptor::new(
            &key_v2,
            &[key_v1.clone()],
            vec!["email".to_string()],
        )
        .unwrap();
        assert_eq!(enc_v2.decrypt_map(&encrypted_v1).unwrap(), data);

        // New writes carry the new key id
        let encrypted_v2 = enc_v2.encrypt_map(&data).unwrap();
        let Value::String(s) = &encrypted_v2["email"] else {
            panic!("expected string ciphertext");
        };
        assert!(s.starts_with("$enc$kek-v2$"));
    }

    #[test]
    fn test_unknown_key_id_fails() {
        let key_v1 = generate_encryption_key("kek-v1");
        let key_v2 = generate_encryption_key("kek-v2");

        let enc_v1 = FieldEncryptor::new(&key_v1, &[], vec!["email".to_string()]).unwrap();
        let mut data = DataMap::new();
        data.insert("email".into(), json!("x"));
        let encrypted = enc_v1.encrypt_map(&data).unwrap();

        let enc_v2 = FieldEncryptor::new(&key_v2, &[], vec!["email".to_string()]).unwrap();
        assert!(enc_v2.decrypt_map(&encrypted).is_err());
    }

    #[test]
    fn test_invalid_key_formats() {
        assert!(FieldEncryptor::new("no-colon", &[], Vec::<String>::new()).is_err());
        assert!(FieldEncryptor::new("kek:not-base64!!!", &[], Vec::<String>::new()).is_err());
        let short = format!("kek:{}", BASE64.encode([0u8; 16]));
        assert!(FieldEncryptor::new(&short, &[], Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_non_string_pii_values() {
        let enc = encryptor(&["riskScore"]);
        let mut data = DataMap::new();
        data.insert("riskScore".into(), json!({"level": 3, "labels": ["a"]}));

        let encrypted = enc.encrypt_map(&data).unwrap();
        assert!(FieldEncryptor::is_encrypted(&encrypted["riskScore"]));
        assert_eq!(enc.decrypt_map(&encrypted).unwrap(), data);
    }
}
