//! Entity store over signed feeds
//!
//! Feeds are the source of truth, persisted as JSON [`SignedFeed`]s under
//! `feed/{fingerprint}`. The four datom indexes are derived from them and can
//! be rebuilt at any time with [`EntityDb::rebuild_indexes`].
//!
//! Local writes (`put`, `add`, `remove`) append one `eav` operation to the
//! user feed, re-sign it, and persist the feed together with the index
//! changes in a single batch. Announcing the new head is queued afterwards and
//! never blocks or fails the write.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::datom::{Datom, Value, FEED_ID_ATTR, KIND_ATTR};
use super::index::{self, qualified_id, split_id};
use super::schema::{Entity, Record};
use crate::error::{EntityError, StoreError};
use crate::feed::{Codec, Feed, NodeKey, Operation, SignedFeed};
use crate::storage::{Key, Store, WriteBatch};
use crate::sync::{AnnounceQueue, AnnounceTask};

/// Key prefix of stored feeds
pub const FEED_PREFIX: &str = "feed";

pub fn feed_key(fingerprint: &str) -> Key {
    Key::new(&[FEED_PREFIX, fingerprint])
}

/// What [`EntityDb::ingest_feed`] did with an incoming feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Feed was unknown; stored and fully applied
    Created,
    /// Incoming feed was not longer than the stored one
    Unchanged,
    /// Stored feed was a prefix; only the new operations were applied
    Extended { applied: usize },
    /// Histories diverged; stored and all indexes rebuilt
    Replaced,
}

pub struct EntityDb {
    store: Arc<dyn Store>,
    codec: Codec,
    key: NodeKey,
    fp: String,
    /// Serializes feed writes so appends never race
    write_lock: Mutex<()>,
    /// Pubs marked due since the current sync round read the registry
    due_marks: Mutex<HashSet<String>>,
    announcer: Option<AnnounceQueue>,
}

impl EntityDb {
    pub fn new(store: Arc<dyn Store>, key: NodeKey) -> Self {
        let fp = key.fingerprint();
        Self {
            store,
            codec: Codec::with_defaults(),
            key,
            fp,
            write_lock: Mutex::new(()),
            due_marks: Mutex::new(HashSet::new()),
            announcer: None,
        }
    }

    /// Queue announcements of local writes on `queue`.
    pub fn with_announcer(mut self, queue: AnnounceQueue) -> Self {
        self.announcer = Some(queue);
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Fingerprint of the local user feed
    pub fn fingerprint(&self) -> &str {
        &self.fp
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn close(&self) -> Result<(), EntityError> {
        Ok(self.store.close()?)
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>, EntityError> {
        self.write_lock
            .lock()
            .map_err(|_| EntityError::Store(StoreError::Poisoned))
    }

    pub(super) fn lock_due_marks(&self) -> Result<MutexGuard<'_, HashSet<String>>, EntityError> {
        self.due_marks
            .lock()
            .map_err(|_| EntityError::Store(StoreError::Poisoned))
    }

    // ---- feeds ----

    /// Every stored feed, in key order.
    pub fn get_feeds(&self) -> Result<Vec<SignedFeed>, EntityError> {
        self.store
            .prefix(Key::prefix(&[FEED_PREFIX]).as_bytes())?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(EntityError::from))
            .collect()
    }

    pub fn get_feed(&self, fingerprint: &str) -> Result<Option<SignedFeed>, EntityError> {
        match self.store.get(feed_key(fingerprint).as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// The local feed, decoded and verified.
    pub fn user_feed(&self) -> Result<Feed, EntityError> {
        let signed = self.get_feed(&self.fp)?.ok_or(EntityError::NoUserFeed)?;
        Ok(self.codec.decode(&signed)?)
    }

    /// Create the user feed with its `declare-key` operation if it is missing.
    pub fn ensure_user_feed(&self) -> Result<SignedFeed, EntityError> {
        let _guard = self.lock_writes()?;
        if let Some(signed) = self.get_feed(&self.fp)? {
            return Ok(signed);
        }
        let feed = Feed::new(&self.key);
        let signed = self.put_user_feed(&feed)?;
        info!(fingerprint = %self.fp, "Created user feed");
        Ok(signed)
    }

    /// Sign `feed` with the node key and persist it as the user feed.
    ///
    /// Indexes are left alone; callers apply operations themselves.
    pub fn put_user_feed(&self, feed: &Feed) -> Result<SignedFeed, EntityError> {
        let actual = feed.fingerprint()?;
        if actual != self.fp {
            return Err(EntityError::FingerprintMismatch {
                expected: self.fp.clone(),
                actual,
            });
        }
        let signed = self.codec.encode(feed, &self.key)?;
        self.store
            .set(feed_key(&self.fp).as_bytes(), &serde_json::to_vec(&signed)?)?;
        Ok(signed)
    }

    /// Verify, persist and index a whole feed, replacing any stored version.
    pub fn put_feed(&self, signed: &SignedFeed) -> Result<String, EntityError> {
        let _guard = self.lock_writes()?;
        let feed = self.codec.decode(signed)?;
        let fp = feed.fingerprint()?;
        let mut batch = WriteBatch::new();
        batch.set(feed_key(&fp), serde_json::to_vec(signed)?);
        self.stage_ops(&mut batch, &fp, feed.ops())?;
        self.store.write(batch)?;
        debug!(fingerprint = %fp, length = feed.len(), "Stored feed");
        Ok(fp)
    }

    /// Merge a feed received from a peer.
    ///
    /// Only versions longer than the stored one are taken. When the stored
    /// version is a prefix of the incoming one, just the new operations are
    /// applied; otherwise every index is rebuilt.
    pub fn ingest_feed(&self, signed: &SignedFeed) -> Result<IngestOutcome, EntityError> {
        let feed = self.codec.decode(signed)?;
        let fp = feed.fingerprint()?;

        let _guard = self.lock_writes()?;
        let stored = match self.get_feed(&fp)? {
            Some(stored) => Some(self.codec.decode(&stored)?),
            None => None,
        };

        let from = match &stored {
            None => 0,
            Some(stored) if feed.len() <= stored.len() => {
                debug!(fingerprint = %fp, length = feed.len(), "Feed not newer, ignoring");
                return Ok(IngestOutcome::Unchanged);
            }
            Some(stored) if feed.ops()[..stored.len()] == *stored.ops() => stored.len(),
            Some(stored) => {
                warn!(
                    fingerprint = %fp,
                    stored = stored.len(),
                    incoming = feed.len(),
                    "Feed history diverged, rebuilding indexes"
                );
                let mut batch = WriteBatch::new();
                batch.set(feed_key(&fp), serde_json::to_vec(signed)?);
                self.rebuild_locked(batch)?;
                return Ok(IngestOutcome::Replaced);
            }
        };

        let mut batch = WriteBatch::new();
        batch.set(feed_key(&fp), serde_json::to_vec(signed)?);
        self.stage_ops(&mut batch, &fp, &feed.ops()[from..])?;
        self.store.write(batch)?;

        let applied = feed.len() - from;
        info!(fingerprint = %fp, applied, length = feed.len(), "Ingested feed");
        Ok(if stored.is_none() {
            IngestOutcome::Created
        } else {
            IngestOutcome::Extended { applied }
        })
    }

    /// Decode `signed` and apply every operation to the indexes.
    ///
    /// The feed itself is not persisted.
    pub fn load_feed(&self, signed: &SignedFeed) -> Result<Feed, EntityError> {
        let feed = self.codec.decode(signed)?;
        let fp = feed.fingerprint()?;
        let mut batch = WriteBatch::new();
        self.stage_ops(&mut batch, &fp, feed.ops())?;
        self.store.write(batch)?;
        Ok(feed)
    }

    fn stage_ops(
        &self,
        batch: &mut WriteBatch,
        fp: &str,
        ops: &[Operation],
    ) -> Result<(), EntityError> {
        for op in ops {
            index::stage_operation(self.store.as_ref(), batch, fp, op)?;
        }
        Ok(())
    }

    /// Drop every index entry and replay all stored feeds.
    ///
    /// A stored feed that does not decode is logged and skipped. The whole
    /// rebuild is written as one batch. Returns the number of feeds applied.
    pub fn rebuild_indexes(&self) -> Result<usize, EntityError> {
        let _guard = self.lock_writes()?;
        self.rebuild_locked(WriteBatch::new())
    }

    /// Rebuild on top of `batch`, so feed writes already staged there land
    /// together with the indexes derived from them. Caller holds the write
    /// lock.
    fn rebuild_locked(&self, mut batch: WriteBatch) -> Result<usize, EntityError> {
        let cleared = index::stage_clear(self.store.as_ref(), &mut batch)?;

        let feed_prefix = Key::prefix(&[FEED_PREFIX]);
        let mut stored: BTreeMap<Vec<u8>, Vec<u8>> = self
            .store
            .prefix(feed_prefix.as_bytes())?
            .into_iter()
            .collect();
        for (key, value) in batch.iter() {
            if !key.starts_with(feed_prefix.as_bytes()) {
                continue;
            }
            match value {
                Some(value) => stored.insert(key.to_vec(), value.to_vec()),
                None => stored.remove(key),
            };
        }

        let mut applied = 0;
        for (key, value) in stored {
            let key = String::from_utf8_lossy(&key).into_owned();
            let feed = match self.decode_stored(&value) {
                Ok(feed) => feed,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable feed");
                    continue;
                }
            };
            let fp = feed.fingerprint()?;
            self.stage_ops(&mut batch, &fp, feed.ops())?;
            applied += 1;
        }

        self.store.write(batch)?;
        info!(feeds = applied, cleared, "Rebuilt indexes");
        Ok(applied)
    }

    fn decode_stored(&self, value: &[u8]) -> Result<Feed, EntityError> {
        let signed: SignedFeed = serde_json::from_slice(value)?;
        Ok(self.codec.decode(&signed)?)
    }

    /// Re-create the user feed by copying its operations into a fresh feed.
    pub fn rebuild_user_feed(&self) -> Result<SignedFeed, EntityError> {
        let signed = {
            let _guard = self.lock_writes()?;
            let old = self.user_feed()?;
            let mut feed = Feed::new(&self.key);
            for op in old.ops().iter().skip(1) {
                feed.append(op.clone());
            }
            self.put_user_feed(&feed)?
        };
        info!(fingerprint = %self.fp, "Rebuilt user feed");
        self.announce(&signed);
        Ok(signed)
    }

    // ---- typed records ----

    /// Check `id` is well formed and belongs to the local feed.
    fn owned_id<'a>(&self, id: &'a str) -> Result<(&'a str, &'a str), EntityError> {
        let (feed, entity) = parse_id(id)?;
        if feed != self.fp {
            return Err(EntityError::NotOwner {
                id: id.to_string(),
                feed: self.fp.clone(),
            });
        }
        Ok((feed, entity))
    }

    /// Current `(attribute, value)` pairs of `id`
    fn attributes(&self, id: &str) -> Result<Vec<(String, String)>, EntityError> {
        let prefix = Key::prefix(&["eav", id]);
        let skip = prefix.as_bytes().len();
        Ok(self
            .store
            .prefix(prefix.as_bytes())?
            .into_iter()
            .map(|(key, value)| {
                (
                    String::from_utf8_lossy(&key[skip..]).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect())
    }

    pub fn get<T: Record>(&self, id: &str) -> Result<Entity<T>, EntityError> {
        let (feed, _) = parse_id(id)?;
        let attributes = self.attributes(id)?;
        if attributes.is_empty() {
            return Err(EntityError::NotFound(id.to_string()));
        }

        let fields = T::fields();
        let mut record = T::default();
        let mut feed_id = feed.to_string();
        for (attribute, value) in &attributes {
            match attribute.as_str() {
                KIND_ATTR if value != T::KIND => {
                    return Err(EntityError::NotFound(id.to_string()));
                }
                FEED_ID_ATTR => feed_id = value.clone(),
                _ => {
                    if let Some(field) = fields.iter().find(|f| f.attribute(T::KIND) == *attribute) {
                        field.decode_into(&mut record, value)?;
                    }
                }
            }
        }

        Ok(Entity {
            id: id.to_string(),
            feed_id,
            record,
        })
    }

    /// Every entity whose `db/Kind` is `T::KIND`, across all feeds.
    ///
    /// An entity that does not read back as `T` is logged and left out.
    pub fn get_all<T: Record>(&self) -> Result<Vec<Entity<T>>, EntityError> {
        let prefix = Key::prefix(&["ave", KIND_ATTR, T::KIND]);
        let skip = prefix.as_bytes().len();
        let mut entities = Vec::new();
        for (key, id) in self.store.prefix(prefix.as_bytes())? {
            // a kind value containing '/' also lands under this prefix
            if key[skip..] != id[..] {
                continue;
            }
            let id = String::from_utf8_lossy(&id).into_owned();
            match self.get(&id) {
                Ok(entity) => entities.push(entity),
                Err(
                    e @ (EntityError::MalformedId(_)
                    | EntityError::NotFound(_)
                    | EntityError::TypeMismatch { .. }),
                ) => {
                    warn!(id = %id, kind = T::KIND, error = %e, "Skipping unreadable entity");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(entities)
    }

    /// Assert every field of `record` on the local entity `id`.
    pub fn put<T: Record>(&self, id: &str, record: &T) -> Result<(), EntityError> {
        let (_, entity) = self.owned_id(id)?;
        let mut datoms = vec![Datom::assert(entity, KIND_ATTR, Value::from(T::KIND))];
        for field in T::fields() {
            datoms.push(Datom::assert(entity, field.attribute(T::KIND), (field.get)(record)));
        }
        self.commit(datoms)?;
        debug!(id, kind = T::KIND, "Put entity");
        Ok(())
    }

    /// Store `record` under a fresh id in the local feed and return the id.
    pub fn add<T: Record>(&self, record: &T) -> Result<String, EntityError> {
        let id = qualified_id(&self.fp, &Uuid::new_v4().to_string());
        self.put(&id, record)?;
        Ok(id)
    }

    /// Retract every current datom of the local entity `id`.
    pub fn remove(&self, id: &str) -> Result<(), EntityError> {
        let (_, entity) = self.owned_id(id)?;
        let attributes = self.attributes(id)?;
        if attributes.is_empty() {
            return Err(EntityError::NotFound(id.to_string()));
        }
        let datoms = attributes
            .into_iter()
            .map(|(attribute, value)| Datom::retract(entity, attribute, Value::Text(value)))
            .collect();
        self.commit(datoms)?;
        debug!(id, "Removed entity");
        Ok(())
    }

    /// Append `datoms` to the user feed, persist and index them atomically,
    /// then queue the announcement.
    fn commit(&self, datoms: Vec<Datom>) -> Result<(), EntityError> {
        let signed = {
            let _guard = self.lock_writes()?;
            let mut feed = self.user_feed()?;
            let seq_num = feed.append(Operation::eav(datoms));
            let signed = self.codec.encode(&feed, &self.key)?;

            let mut batch = WriteBatch::new();
            batch.set(feed_key(&self.fp), serde_json::to_vec(&signed)?);
            self.stage_ops(&mut batch, &self.fp, &feed.ops()[seq_num as usize..])?;
            self.store.write(batch)?;
            debug!(fingerprint = %self.fp, seq_num, "Appended operation");
            signed
        };
        self.announce(&signed);
        Ok(())
    }

    /// Queue an announcement of `signed` to the known pubs.
    fn announce(&self, signed: &SignedFeed) {
        let Some(queue) = &self.announcer else {
            return;
        };
        let origin = match self.get_self() {
            Ok(Some(origin)) => origin,
            Ok(None) => {
                debug!("No self pub registered, not announcing");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Could not read self pub, not announcing");
                return;
            }
        };
        match self.get_pubs() {
            Ok(pubs) => {
                queue.enqueue(AnnounceTask {
                    origin,
                    pubs,
                    feed: signed.clone(),
                });
            }
            Err(e) => warn!(error = %e, "Could not read pubs, not announcing"),
        }
    }

    /// Every key/value pair in the store, as text.
    pub fn dump(&self) -> Result<Vec<(String, String)>, EntityError> {
        Ok(self
            .store
            .prefix(&[])?
            .into_iter()
            .map(|(k, v)| {
                (
                    String::from_utf8_lossy(&k).into_owned(),
                    String::from_utf8_lossy(&v).into_owned(),
                )
            })
            .collect())
    }
}

/// Split a qualified id, rejecting ids that would break key structure.
fn parse_id(id: &str) -> Result<(&str, &str), EntityError> {
    match split_id(id) {
        Some((feed, entity)) if !id.contains('/') && !entity.contains(':') => Ok((feed, entity)),
        _ => Err(EntityError::MalformedId(id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::entities::schema::{integer, text, Field, FieldKind};
    use crate::error::CodecError;
    use crate::storage::MemoryStore;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Note {
        body: String,
        stars: i64,
    }

    impl Record for Note {
        const KIND: &'static str = "Note";

        fn fields() -> Vec<Field<Self>> {
            vec![
                Field::<Self>::new("body", FieldKind::Text, |n| n.body.clone().into(), |n, v| n.body = text(v)),
                Field::<Self>::new("stars", FieldKind::Integer, |n| n.stars.into(), |n, v| n.stars = integer(v)),
            ]
        }
    }

    fn note(body: &str, stars: i64) -> Note {
        Note {
            body: body.to_string(),
            stars,
        }
    }

    fn open_db() -> EntityDb {
        let db = EntityDb::new(Arc::new(MemoryStore::new()), NodeKey::generate());
        db.ensure_user_feed().unwrap();
        db
    }

    fn index_count(db: &EntityDb) -> usize {
        index::INDEXES
            .iter()
            .map(|i| db.store().prefix(Key::prefix(&[*i]).as_bytes()).unwrap().len())
            .sum()
    }

    #[test]
    fn test_add_then_get() {
        let db = open_db();
        let id = db.add(&note("hello", 3)).unwrap();

        assert!(id.starts_with(&format!("{}:", db.fingerprint())));
        let entity: Entity<Note> = db.get(&id).unwrap();
        assert_eq!(entity.record, note("hello", 3));
        assert_eq!(entity.feed_id, db.fingerprint());
        assert_eq!(db.user_feed().unwrap().len(), 2);
    }

    #[test]
    fn test_get_all_scans_kind() {
        let db = open_db();
        db.add(&note("a", 1)).unwrap();
        db.add(&note("b", 2)).unwrap();

        let mut bodies: Vec<String> = db
            .get_all::<Note>()
            .unwrap()
            .into_iter()
            .map(|e| e.record.body)
            .collect();
        bodies.sort();
        assert_eq!(bodies, vec!["a", "b"]);
    }

    #[test]
    fn test_put_overwrites_fields() {
        let db = open_db();
        let id = db.add(&note("draft", 1)).unwrap();
        db.put(&id, &note("final", 5)).unwrap();

        assert_eq!(db.get::<Note>(&id).unwrap().record, note("final", 5));
        assert_eq!(db.get_all::<Note>().unwrap().len(), 1);
        assert_eq!(db.user_feed().unwrap().len(), 3);
    }

    #[test]
    fn test_put_foreign_id_is_rejected_without_mutation() {
        let db = open_db();
        let before = db.dump().unwrap();

        let result = db.put("otherFeed:entity123", &note("x", 1));
        assert!(matches!(result, Err(EntityError::NotOwner { .. })));
        assert_eq!(db.dump().unwrap(), before);
    }

    #[test]
    fn test_malformed_ids() {
        let db = open_db();
        for id in ["no-colon", ":e", "fp:", "fp:a/b"] {
            assert!(
                matches!(db.get::<Note>(id), Err(EntityError::MalformedId(_))),
                "{id}"
            );
        }
    }

    #[test]
    fn test_remove_retracts_everything() {
        let db = open_db();
        let id = db.add(&note("gone", 1)).unwrap();
        db.remove(&id).unwrap();

        assert!(matches!(db.get::<Note>(&id), Err(EntityError::NotFound(_))));
        assert!(db.get_all::<Note>().unwrap().is_empty());
        assert_eq!(index_count(&db), 0);
        assert!(matches!(db.remove(&id), Err(EntityError::NotFound(_))));
    }

    #[test]
    fn test_remove_foreign_id_is_rejected() {
        let db = open_db();
        assert!(matches!(
            db.remove("someone:else"),
            Err(EntityError::NotOwner { .. })
        ));
    }

    #[test]
    fn test_type_mismatch_on_read() {
        let db = open_db();
        let id = qualified_id(db.fingerprint(), "e1");
        let (_, entity) = split_id(&id).unwrap();
        db.commit(vec![
            Datom::assert(entity, KIND_ATTR, "Note".into()),
            Datom::assert(entity, "Note/stars", "many".into()),
        ])
        .unwrap();

        assert!(matches!(
            db.get::<Note>(&id),
            Err(EntityError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let db = open_db();
        let id = db.add(&note("a", 1)).unwrap();
        db.put(&id, &note("b", 2)).unwrap();
        db.add(&note("c", 3)).unwrap();
        let before = db.dump().unwrap();

        assert_eq!(db.rebuild_indexes().unwrap(), 1);
        assert_eq!(db.dump().unwrap(), before);
        db.rebuild_indexes().unwrap();
        assert_eq!(db.dump().unwrap(), before);
    }

    #[test]
    fn test_rebuild_skips_corrupt_feed() {
        let db = open_db();
        db.add(&note("a", 1)).unwrap();
        db.store().set(feed_key("broken").as_bytes(), b"not json").unwrap();

        assert_eq!(db.rebuild_indexes().unwrap(), 1);
        assert_eq!(db.get_all::<Note>().unwrap().len(), 1);
    }

    #[test]
    fn test_rebuild_user_feed_keeps_content() {
        let db = open_db();
        db.add(&note("a", 1)).unwrap();
        let before = db.user_feed().unwrap();

        db.rebuild_user_feed().unwrap();
        assert_eq!(db.user_feed().unwrap(), before);
    }

    #[test]
    fn test_missing_user_feed() {
        let db = EntityDb::new(Arc::new(MemoryStore::new()), NodeKey::generate());
        assert!(matches!(db.user_feed(), Err(EntityError::NoUserFeed)));
        assert!(matches!(db.add(&note("a", 1)), Err(EntityError::NoUserFeed)));
    }

    #[test]
    fn test_put_user_feed_rejects_foreign_feed() {
        let db = open_db();
        let other = Feed::new(&NodeKey::generate());
        assert!(matches!(
            db.put_user_feed(&other),
            Err(EntityError::FingerprintMismatch { .. })
        ));
    }

    #[test]
    fn test_ingest_outcomes() {
        let writer = open_db();
        let reader = open_db();

        let id = writer.add(&note("first", 1)).unwrap();
        let v2 = writer.get_feed(writer.fingerprint()).unwrap().unwrap();
        assert_eq!(reader.ingest_feed(&v2).unwrap(), IngestOutcome::Created);
        assert_eq!(reader.ingest_feed(&v2).unwrap(), IngestOutcome::Unchanged);

        writer.put(&id, &note("second", 2)).unwrap();
        let v3 = writer.get_feed(writer.fingerprint()).unwrap().unwrap();
        assert_eq!(
            reader.ingest_feed(&v3).unwrap(),
            IngestOutcome::Extended { applied: 1 }
        );
        assert_eq!(reader.get::<Note>(&id).unwrap().record, note("second", 2));
        assert_eq!(reader.ingest_feed(&v2).unwrap(), IngestOutcome::Unchanged);
    }

    #[test]
    fn test_ingest_divergent_history_rebuilds() {
        let key = NodeKey::generate();
        let fp = key.fingerprint();
        let codec = Codec::with_defaults();
        let reader = open_db();

        let mut short = Feed::new(&key);
        short.append(Operation::eav(vec![
            Datom::assert("e1", KIND_ATTR, "Note".into()),
            Datom::assert("e1", "Note/body", "old".into()),
        ]));
        reader.ingest_feed(&codec.encode(&short, &key).unwrap()).unwrap();

        let mut long = Feed::new(&key);
        long.append(Operation::eav(vec![
            Datom::assert("e1", KIND_ATTR, "Note".into()),
            Datom::assert("e1", "Note/body", "new".into()),
        ]));
        long.append(Operation::eav(vec![Datom::assert("e1", "Note/stars", Value::Integer(4))]));
        assert_eq!(
            reader.ingest_feed(&codec.encode(&long, &key).unwrap()).unwrap(),
            IngestOutcome::Replaced
        );

        let entity = reader.get::<Note>(&qualified_id(&fp, "e1")).unwrap();
        assert_eq!(entity.record, note("new", 4));
    }

    #[test]
    fn test_ingest_rejects_tampered_feed() {
        let writer = open_db();
        let reader = open_db();
        writer.add(&note("a", 1)).unwrap();
        let mut signed = writer.get_feed(writer.fingerprint()).unwrap().unwrap();
        signed.signature = reader.get_feed(reader.fingerprint()).unwrap().unwrap().signature;

        assert!(matches!(reader.ingest_feed(&signed), Err(EntityError::Codec(_))));
        assert!(reader.get_feed(writer.fingerprint()).unwrap().is_none());
    }

    #[test]
    fn test_foreign_feed_cannot_write_local_entities() {
        let reader = open_db();
        let mine = reader.add(&note("mine", 1)).unwrap();
        let (_, entity) = split_id(&mine).unwrap();

        let key = NodeKey::generate();
        let mut feed = Feed::new(&key);
        feed.append(Operation::eav(vec![Datom::assert(entity, "Note/body", "hijacked".into())]));
        reader
            .ingest_feed(&Codec::with_defaults().encode(&feed, &key).unwrap())
            .unwrap();

        assert_eq!(reader.get::<Note>(&mine).unwrap().record.body, "mine");
    }

    #[test]
    fn test_load_feed_applies_without_persisting() {
        let writer = open_db();
        let reader = open_db();
        writer.add(&note("a", 1)).unwrap();
        let signed = writer.get_feed(writer.fingerprint()).unwrap().unwrap();

        reader.load_feed(&signed).unwrap();
        assert_eq!(reader.get_all::<Note>().unwrap().len(), 1);
        assert!(reader.get_feed(writer.fingerprint()).unwrap().is_none());
    }

    #[test]
    fn test_get_all_skips_unreadable_foreign_entities() {
        let reader = open_db();
        reader.add(&note("mine", 1)).unwrap();

        let key = NodeKey::generate();
        let codec = Codec::with_defaults();
        let mut feed = Feed::new(&key);
        feed.append(Operation::eav(vec![
            Datom::assert("e1", KIND_ATTR, "Note/x".into()),
            Datom::assert("e2", KIND_ATTR, "Note".into()),
            Datom::assert("e2", "Note/stars", "many".into()),
        ]));
        reader.ingest_feed(&codec.encode(&feed, &key).unwrap()).unwrap();

        let mut bad = Feed::new(&key);
        bad.append(Operation::eav(vec![Datom::assert("a:b", KIND_ATTR, "Note".into())]));
        assert!(matches!(
            reader.ingest_feed(&codec.encode(&bad, &key).unwrap()),
            Err(EntityError::Codec(CodecError::MalformedOperation(_)))
        ));

        let all = reader.get_all::<Note>().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].record.body, "mine");
    }

    /// Counts direct sets and batch writes on top of a memory store
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        sets: AtomicUsize,
        writes: AtomicUsize,
    }

    impl Store for CountingStore {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key)
        }

        fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value)
        }

        fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
            self.inner.delete(key)
        }

        fn prefix(&self, prefix: &[u8]) -> Result<Vec<crate::storage::KeyValue>, StoreError> {
            self.inner.prefix(prefix)
        }

        fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write(batch)
        }

        fn close(&self) -> Result<(), StoreError> {
            self.inner.close()
        }
    }

    #[test]
    fn test_divergent_ingest_is_one_write() {
        let key = NodeKey::generate();
        let codec = Codec::with_defaults();
        let store = Arc::new(CountingStore::default());
        let reader = EntityDb::new(store.clone(), NodeKey::generate());

        let mut short = Feed::new(&key);
        short.append(Operation::eav(vec![Datom::assert("e1", KIND_ATTR, "Note".into())]));
        reader.ingest_feed(&codec.encode(&short, &key).unwrap()).unwrap();

        let mut long = Feed::new(&key);
        long.append(Operation::eav(vec![
            Datom::assert("e2", KIND_ATTR, "Note".into()),
            Datom::assert("e2", "Note/body", "new".into()),
        ]));
        long.append(Operation::eav(vec![Datom::assert("e2", "Note/stars", Value::Integer(2))]));

        let sets = store.sets.load(Ordering::SeqCst);
        let writes = store.writes.load(Ordering::SeqCst);
        assert_eq!(
            reader.ingest_feed(&codec.encode(&long, &key).unwrap()).unwrap(),
            IngestOutcome::Replaced
        );
        assert_eq!(store.sets.load(Ordering::SeqCst), sets);
        assert_eq!(store.writes.load(Ordering::SeqCst), writes + 1);

        let all = reader.get_all::<Note>().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].record, note("new", 2));
        assert_eq!(reader.get_feed(&key.fingerprint()).unwrap().unwrap().length().unwrap(), 3);
    }
}
