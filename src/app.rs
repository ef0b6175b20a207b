//! Bookmarks - the application record stored in feeds

use std::sync::Arc;

use serde::Serialize;

use crate::entities::schema::{integer, text};
use crate::entities::{Entity, EntityDb, Field, FieldKind, Record};
use crate::error::EntityError;
use crate::sync::now_secs;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Bookmark {
    pub url: String,
    pub title: String,
    /// Unix seconds
    pub created_at: i64,
}

impl Bookmark {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            created_at: now_secs(),
        }
    }
}

impl Record for Bookmark {
    const KIND: &'static str = "Bookmark";

    fn fields() -> Vec<Field<Self>> {
        vec![
            Field::<Self>::new("url", FieldKind::Text, |b| b.url.clone().into(), |b, v| b.url = text(v)),
            Field::<Self>::new("title", FieldKind::Text, |b| b.title.clone().into(), |b, v| b.title = text(v)),
            Field::<Self>::new(
                "created_at",
                FieldKind::Integer,
                |b| b.created_at.into(),
                |b, v| b.created_at = integer(v),
            ),
        ]
    }
}

/// Bookmark operations over the entity store
#[derive(Clone)]
pub struct Bookmarks {
    db: Arc<EntityDb>,
}

impl Bookmarks {
    pub fn new(db: Arc<EntityDb>) -> Self {
        Self { db }
    }

    /// Every bookmark from every known feed, newest first.
    pub fn list(&self) -> Result<Vec<Entity<Bookmark>>, EntityError> {
        let mut bookmarks = self.db.get_all::<Bookmark>()?;
        bookmarks.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(bookmarks)
    }

    /// Add a bookmark to the local feed and return its id.
    pub fn add(&self, url: &str, title: &str) -> Result<String, EntityError> {
        self.db.add(&Bookmark::new(url, title))
    }

    pub fn remove(&self, id: &str) -> Result<(), EntityError> {
        self.db.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::NodeKey;
    use crate::storage::MemoryStore;

    fn bookmarks() -> Bookmarks {
        let db = EntityDb::new(Arc::new(MemoryStore::new()), NodeKey::generate());
        db.ensure_user_feed().unwrap();
        Bookmarks::new(Arc::new(db))
    }

    #[test]
    fn test_add_and_list() {
        let app = bookmarks();
        let id = app.add("http://x", "X").unwrap();

        let listed = app.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].record.url, "http://x");
        assert_eq!(listed[0].record.title, "X");
        assert!(listed[0].record.created_at > 0);
    }

    #[test]
    fn test_remove() {
        let app = bookmarks();
        let id = app.add("http://x", "").unwrap();
        app.remove(&id).unwrap();
        assert!(app.list().unwrap().is_empty());
    }
}
