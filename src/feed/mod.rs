//! Signed append-only feeds
//!
//! A [`Feed`] is one writer's ordered log of [`Operation`]s. Its wire and
//! storage form is a [`SignedFeed`]: the JSON operation array plus an Ed25519
//! signature over exactly those bytes.
//!
//! Invariants held by every `Feed` value:
//! - operation 0 is a `declare-key` operation carrying the writer's key
//! - `seq_num`s are gapless and start at 0
//! - operations are only ever appended

pub mod codec;
pub mod keys;

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::entities::Datom;
use crate::error::CodecError;

pub use codec::{Codec, Converter};
pub use keys::{fingerprint, NodeKey, PublicKeyDescriptor};

/// Operation kind declaring the writer's public key
pub const DECLARE_KEY: &str = "declare-key";

/// Operation kind carrying a batch of datoms
pub const EAV: &str = "eav";

/// Decoded operation payload
#[derive(Debug, Clone, PartialEq)]
pub enum OperationBody {
    DeclareKey(PublicKeyDescriptor),
    Eav(Vec<Datom>),
    /// Body of a kind registered outside the core, kept as plain JSON
    Opaque(serde_json::Value),
}

impl OperationBody {
    /// Generic raw encoding of the body.
    pub fn to_raw(&self) -> Result<Box<RawValue>, serde_json::Error> {
        match self {
            OperationBody::DeclareKey(key) => serde_json::value::to_raw_value(key),
            OperationBody::Eav(datoms) => serde_json::value::to_raw_value(datoms),
            OperationBody::Opaque(value) => serde_json::value::to_raw_value(value),
        }
    }
}

/// A single entry in a feed
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: String,
    pub seq_num: u64,
    pub body: OperationBody,
}

impl Operation {
    pub fn declare_key(key: PublicKeyDescriptor) -> Self {
        Self {
            kind: DECLARE_KEY.to_string(),
            seq_num: 0,
            body: OperationBody::DeclareKey(key),
        }
    }

    /// An `eav` operation; the sequence number is assigned on append.
    pub fn eav(datoms: Vec<Datom>) -> Self {
        Self {
            kind: EAV.to_string(),
            seq_num: 0,
            body: OperationBody::Eav(datoms),
        }
    }

    pub fn datoms(&self) -> Option<&[Datom]> {
        match &self.body {
            OperationBody::Eav(datoms) => Some(datoms),
            _ => None,
        }
    }
}

/// Wire form of one operation with its body left undecoded
#[derive(Debug, Serialize, Deserialize)]
pub struct RawOperation {
    pub op: String,
    pub seq_num: u64,
    pub body: Box<RawValue>,
}

/// One writer's operation log
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    ops: Vec<Operation>,
}

impl Feed {
    /// Bootstrap a feed whose first operation declares `key`.
    pub fn new(key: &NodeKey) -> Self {
        Self {
            ops: vec![Operation::declare_key(key.public())],
        }
    }

    /// Build a feed from already-sequenced operations, checking the invariants.
    pub fn from_operations(ops: Vec<Operation>) -> Result<Self, CodecError> {
        match ops.first() {
            Some(Operation {
                body: OperationBody::DeclareKey(_),
                ..
            }) => {}
            Some(op) => {
                return Err(CodecError::MalformedOperation(format!(
                    "feed must start with {}, found {}",
                    DECLARE_KEY, op.kind
                )))
            }
            None => return Err(CodecError::MalformedOperation("empty feed".to_string())),
        }
        for (i, op) in ops.iter().enumerate() {
            if op.seq_num != i as u64 {
                return Err(CodecError::MalformedOperation(format!(
                    "expected seq_num {}, got {}",
                    i, op.seq_num
                )));
            }
        }
        Ok(Self { ops })
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append `op` with the next sequence number and return that number.
    pub fn append(&mut self, mut op: Operation) -> u64 {
        let seq_num = self.ops.len() as u64;
        op.seq_num = seq_num;
        self.ops.push(op);
        seq_num
    }

    /// The key declared by operation 0
    pub fn declared_key(&self) -> Result<&PublicKeyDescriptor, CodecError> {
        match self.ops.first().map(|op| &op.body) {
            Some(OperationBody::DeclareKey(key)) => Ok(key),
            _ => Err(CodecError::MalformedOperation(
                "feed had no declared key".to_string(),
            )),
        }
    }

    pub fn fingerprint(&self) -> Result<String, CodecError> {
        self.declared_key()?.fingerprint()
    }
}

/// Authenticated, content-addressable serialization of a [`Feed`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedFeed {
    /// Base64url JSON array of [`RawOperation`]
    pub payload: String,
    /// Base64url Ed25519 signature over the decoded payload bytes
    pub signature: String,
}

impl SignedFeed {
    pub fn payload_bytes(&self) -> Result<Vec<u8>, CodecError> {
        BASE64_URL_SAFE_NO_PAD
            .decode(&self.payload)
            .map_err(|e| CodecError::MalformedOperation(format!("bad payload encoding: {}", e)))
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>, CodecError> {
        BASE64_URL_SAFE_NO_PAD
            .decode(&self.signature)
            .map_err(|_| CodecError::SignatureInvalid)
    }

    /// Parse the operation array without verifying or decoding bodies.
    pub fn raw_operations(&self) -> Result<Vec<RawOperation>, CodecError> {
        let payload = self.payload_bytes()?;
        serde_json::from_slice(&payload)
            .map_err(|e| CodecError::MalformedOperation(format!("bad operation array: {}", e)))
    }

    /// Number of operations in the feed
    pub fn length(&self) -> Result<usize, CodecError> {
        Ok(self.raw_operations()?.len())
    }

    /// Content address of the feed, computed from its declared key.
    pub fn fingerprint(&self) -> Result<String, CodecError> {
        let ops = self.raw_operations()?;
        let first = ops
            .first()
            .ok_or_else(|| CodecError::MalformedOperation("empty feed".to_string()))?;
        if first.op != DECLARE_KEY {
            return Err(CodecError::MalformedOperation(format!(
                "feed must start with {}, found {}",
                DECLARE_KEY, first.op
            )));
        }
        let key: PublicKeyDescriptor = serde_json::from_str(first.body.get())
            .map_err(|e| CodecError::MalformedOperation(format!("bad declared key: {}", e)))?;
        key.fingerprint()
    }
}
