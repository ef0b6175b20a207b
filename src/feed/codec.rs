//! Operation codec
//!
//! Translates between a [`SignedFeed`] and a decoded [`Feed`]. Bodies are
//! decoded by a converter looked up by the operation's kind; the registry is
//! open so new kinds can be added without touching the core.

use std::collections::HashMap;
use std::fmt;

use base64::prelude::*;
use serde_json::value::RawValue;
use tracing::debug;

use super::keys::{NodeKey, PublicKeyDescriptor};
use super::{Feed, Operation, OperationBody, RawOperation, SignedFeed, DECLARE_KEY, EAV};
use crate::entities::Datom;
use crate::error::CodecError;

/// Decodes the raw JSON body of one operation kind
pub type Converter = Box<dyn Fn(&RawValue) -> Result<OperationBody, CodecError> + Send + Sync>;

/// Kind-keyed converter registry plus encode/decode
pub struct Codec {
    converters: HashMap<String, Converter>,
}

impl Codec {
    /// An empty registry; every kind must be registered before decoding.
    pub fn new() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Registry with the core `declare-key` and `eav` kinds installed
    pub fn with_defaults() -> Self {
        let mut codec = Self::new();
        codec.register_op(DECLARE_KEY, convert_key);
        codec.register_op(EAV, convert_datoms);
        codec
    }

    /// Install the converter for `kind`, replacing any previous one.
    pub fn register_op<F>(&mut self, kind: impl Into<String>, converter: F)
    where
        F: Fn(&RawValue) -> Result<OperationBody, CodecError> + Send + Sync + 'static,
    {
        self.converters.insert(kind.into(), Box::new(converter));
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.converters.contains_key(kind)
    }

    /// Serialize and sign `feed` with `key`.
    ///
    /// Fails with [`CodecError::Signing`] if `key` is not the key the feed
    /// declares.
    pub fn encode(&self, feed: &Feed, key: &NodeKey) -> Result<SignedFeed, CodecError> {
        let declared = feed.declared_key()?;
        if *declared != key.public() {
            return Err(CodecError::Signing(
                "private key does not match the feed's declared key".to_string(),
            ));
        }

        let raw_ops = feed
            .ops()
            .iter()
            .map(|op| {
                Ok(RawOperation {
                    op: op.kind.clone(),
                    seq_num: op.seq_num,
                    body: op.body.to_raw()?,
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        let payload = serde_json::to_vec(&raw_ops)?;
        let signature = key.sign(&payload);

        Ok(SignedFeed {
            payload: BASE64_URL_SAFE_NO_PAD.encode(&payload),
            signature: BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        })
    }

    /// Verify `signed` against its own declared key and decode every body.
    pub fn decode(&self, signed: &SignedFeed) -> Result<Feed, CodecError> {
        let payload = signed.payload_bytes()?;
        let raw_ops: Vec<RawOperation> = serde_json::from_slice(&payload)
            .map_err(|e| CodecError::MalformedOperation(format!("bad operation array: {}", e)))?;

        let first = raw_ops
            .first()
            .ok_or_else(|| CodecError::MalformedOperation("empty feed".to_string()))?;
        if first.op != DECLARE_KEY {
            return Err(CodecError::MalformedOperation(format!(
                "feed must start with {}, found {}",
                DECLARE_KEY, first.op
            )));
        }
        let key = match self.decode_body(first)? {
            OperationBody::DeclareKey(key) => key,
            _ => {
                return Err(CodecError::MalformedOperation(
                    "declare-key body is not a key".to_string(),
                ))
            }
        };

        key.verify(&payload, &signed.signature_bytes()?)?;

        let mut ops = Vec::with_capacity(raw_ops.len());
        for raw in &raw_ops {
            ops.push(Operation {
                kind: raw.op.clone(),
                seq_num: raw.seq_num,
                body: self.decode_body(raw)?,
            });
        }
        debug!(ops = ops.len(), "Decoded feed");

        Feed::from_operations(ops)
    }

    fn decode_body(&self, raw: &RawOperation) -> Result<OperationBody, CodecError> {
        let converter = self
            .converters
            .get(&raw.op)
            .ok_or_else(|| CodecError::UnknownOperationKind(raw.op.clone()))?;
        converter(&raw.body)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.converters.keys().collect();
        kinds.sort();
        f.debug_struct("Codec").field("kinds", &kinds).finish()
    }
}

/// Converter for `eav` bodies
pub fn convert_datoms(raw: &RawValue) -> Result<OperationBody, CodecError> {
    let datoms: Vec<Datom> = serde_json::from_str(raw.get())
        .map_err(|e| CodecError::MalformedOperation(format!("bad eav body: {}", e)))?;
    // Entity ids become key segments and the entity half of `{feed}:{entity}`
    if let Some(bad) = datoms
        .iter()
        .find(|d| d.entity_id.is_empty() || d.entity_id.contains([':', '/']))
    {
        return Err(CodecError::MalformedOperation(format!(
            "bad entity id {:?}",
            bad.entity_id
        )));
    }
    Ok(OperationBody::Eav(datoms))
}

/// Converter for `declare-key` bodies
pub fn convert_key(raw: &RawValue) -> Result<OperationBody, CodecError> {
    let key: PublicKeyDescriptor = serde_json::from_str(raw.get())
        .map_err(|e| CodecError::MalformedOperation(format!("bad declare-key body: {}", e)))?;
    Ok(OperationBody::DeclareKey(key))
}
