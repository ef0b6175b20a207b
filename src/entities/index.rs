//! The four datom indexes
//!
//! | Index | Key | Value |
//! |-------|-----|-------|
//! | EAV | `eav/{id}/{attr}` | value |
//! | AEV | `aev/{attr}/{id}` | value |
//! | AVE | `ave/{attr}/{value}/{id}` | id |
//! | VAE | `vae/{value}/{attr}/{id}` | id |
//!
//! `id` is always the qualified `{feed}:{entity}` form. Every write goes
//! through a [`WriteBatch`] so one operation lands atomically.

use std::collections::BTreeSet;

use tracing::trace;

use super::datom::{is_system_attribute, Datom, Value, FEED_ID_ATTR, ID_ATTR};
use crate::error::StoreError;
use crate::feed::Operation;
use crate::storage::{Key, Store, WriteBatch};

/// Top-level prefixes of the derived indexes
pub const INDEXES: [&str; 4] = ["eav", "aev", "ave", "vae"];

/// Qualify a feed-scoped entity id
pub fn qualified_id(feed_id: &str, entity_id: &str) -> String {
    format!("{}:{}", feed_id, entity_id)
}

/// Split a qualified id into `(feed, entity)`
pub fn split_id(id: &str) -> Option<(&str, &str)> {
    match id.split_once(':') {
        Some((feed, entity)) if !feed.is_empty() && !entity.is_empty() => Some((feed, entity)),
        _ => None,
    }
}

pub fn eav_key(id: &str, attribute: &str) -> Key {
    Key::new(&["eav", id, attribute])
}

pub fn aev_key(attribute: &str, id: &str) -> Key {
    Key::new(&["aev", attribute, id])
}

pub fn ave_key(attribute: &str, value: &str, id: &str) -> Key {
    Key::new(&["ave", attribute, value, id])
}

pub fn vae_key(value: &str, attribute: &str, id: &str) -> Key {
    Key::new(&["vae", value, attribute, id])
}

/// Stage one datom for entity `id` into `batch`.
///
/// An assertion replaces any previous value of `(id, attribute)` in all four
/// indexes; a retraction removes them.
pub fn stage_datom(
    store: &dyn Store,
    batch: &mut WriteBatch,
    id: &str,
    attribute: &str,
    value: &Value,
    added: bool,
) -> Result<(), StoreError> {
    let value = value.to_string();
    let eav = eav_key(id, attribute);
    let previous = batch
        .read_through(store, eav.as_bytes())?
        .map(|v| String::from_utf8_lossy(&v).into_owned());

    if let Some(previous) = previous.as_deref() {
        if previous != value || !added {
            batch.delete(ave_key(attribute, previous, id));
            batch.delete(vae_key(previous, attribute, id));
        }
    }

    if added {
        batch.set(&eav, value.as_bytes());
        batch.set(aev_key(attribute, id), value.as_bytes());
        batch.set(ave_key(attribute, &value, id), id.as_bytes());
        batch.set(vae_key(&value, attribute, id), id.as_bytes());
    } else {
        batch.delete(&eav);
        batch.delete(aev_key(attribute, id));
        batch.delete(ave_key(attribute, &value, id));
        batch.delete(vae_key(&value, attribute, id));
    }
    trace!(id, attribute, added, "Staged datom");
    Ok(())
}

/// Stage every datom of `op`, written by feed `feed_id`, into `batch`.
///
/// Entities receiving an assertion also get their `db/ID` and `db/FeedID`
/// system datoms. Assertions of system attributes inside the body are ignored
/// since those are derived here.
pub fn stage_operation(
    store: &dyn Store,
    batch: &mut WriteBatch,
    feed_id: &str,
    op: &Operation,
) -> Result<(), StoreError> {
    let Some(datoms) = op.datoms() else {
        return Ok(());
    };

    let mut touched = BTreeSet::new();
    for datom in datoms {
        if datom.added && is_system_attribute(&datom.attribute) {
            continue;
        }
        stage_user_datom(store, batch, feed_id, datom)?;
        if datom.added {
            touched.insert(datom.entity_id.as_str());
        }
    }

    let feed_value = Value::Text(feed_id.to_string());
    for entity_id in touched {
        let id = qualified_id(feed_id, entity_id);
        stage_datom(store, batch, &id, FEED_ID_ATTR, &feed_value, true)?;
        stage_datom(store, batch, &id, ID_ATTR, &Value::Text(id.clone()), true)?;
    }
    Ok(())
}

fn stage_user_datom(
    store: &dyn Store,
    batch: &mut WriteBatch,
    feed_id: &str,
    datom: &Datom,
) -> Result<(), StoreError> {
    let id = qualified_id(feed_id, &datom.entity_id);
    stage_datom(store, batch, &id, &datom.attribute, &datom.value, datom.added)
}

/// Stage deletion of every key under the four index prefixes.
pub fn stage_clear(store: &dyn Store, batch: &mut WriteBatch) -> Result<usize, StoreError> {
    let mut cleared = 0;
    for index in INDEXES {
        for (key, _) in store.prefix(Key::prefix(&[index]).as_bytes())? {
            batch.delete(key);
            cleared += 1;
        }
    }
    Ok(cleared)
}
