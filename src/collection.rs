//! A list of related entities that remembers what was added and removed
//! since it was loaded, so that saves only touch the rows that changed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

/// A stable token assigned to an entity when it enters a collection. Entities
/// without a primary key are told apart by their identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(u64);

impl Identity {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Identity(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub trait Identifiable {
    /// The primary key value, or `Value::Null` for an entity not yet stored.
    fn primary_key(&self) -> Value;
}

#[derive(Debug)]
pub struct Collection<E> {
    entries: Vec<(Identity, E)>,
    added: Vec<Identity>,
    removed: Vec<(Identity, E)>,
    tracking: bool,
}

impl<E> Default for Collection<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            added: Vec::new(),
            removed: Vec::new(),
            tracking: false,
        }
    }
}

impl<E: Identifiable> Collection<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty collection that records changes from the start.
    pub fn tracked() -> Self {
        Self {
            tracking: true,
            ..Self::default()
        }
    }

    /// A collection of already stored entities. Changes are recorded from
    /// this point on.
    pub fn loaded(entities: impl IntoIterator<Item = E>) -> Self {
        let mut collection = Self::new();
        for entity in entities {
            collection.add(entity);
        }
        collection.tracking = true;
        collection
    }

    pub fn set_tracking(&mut self, tracking: bool) {
        self.tracking = tracking;
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    pub fn add(&mut self, entity: E) -> Identity {
        let key = entity.primary_key();
        let restored = if self.tracking && !key.is_null() {
            self.removed
                .iter()
                .position(|(_, removed)| removed.primary_key() == key)
        } else {
            None
        };

        let identity = match restored {
            Some(index) => self.removed.remove(index).0,
            None => {
                let identity = Identity::next();
                if self.tracking {
                    self.added.push(identity);
                }
                identity
            }
        };
        self.entries.push((identity, entity));
        identity
    }

    pub fn remove(&mut self, identity: Identity) -> bool {
        let index = match self.entries.iter().position(|(id, _)| *id == identity) {
            Some(index) => index,
            None => return false,
        };
        let entry = self.entries.remove(index);

        if let Some(added) = self.added.iter().position(|id| *id == identity) {
            self.added.remove(added);
        } else if self.tracking {
            self.removed.push(entry);
        }
        true
    }

    /// Removes the entity whose primary key equals `key`.
    pub fn remove_by_key(&mut self, key: &Value) -> bool {
        match self.lookup(key) {
            Some(identity) => self.remove(identity),
            None => false,
        }
    }

    pub fn clear(&mut self) {
        let identities: Vec<Identity> = self.entries.iter().map(|(id, _)| *id).collect();
        for identity in identities {
            self.remove(identity);
        }
    }

    /// Finds an entity by primary key. Null keys never match.
    pub fn lookup(&self, key: &Value) -> Option<Identity> {
        if key.is_null() {
            return None;
        }
        self.entries
            .iter()
            .find(|(_, entity)| entity.primary_key() == *key)
            .map(|(id, _)| *id)
    }

    /// Resolves an entity to its identity, comparing primary keys when both
    /// sides have one and identities otherwise.
    pub fn identify(&self, entity: &E, identity: Option<Identity>) -> Option<Identity> {
        let key = entity.primary_key();
        if !key.is_null() {
            if let Some(found) = self.lookup(&key) {
                return Some(found);
            }
        }
        identity.filter(|identity| self.entries.iter().any(|(id, _)| id == identity))
    }

    pub fn get(&self, identity: Identity) -> Option<&E> {
        self.entries
            .iter()
            .find(|(id, _)| *id == identity)
            .map(|(_, entity)| entity)
    }

    pub fn get_mut(&mut self, identity: Identity) -> Option<&mut E> {
        self.entries
            .iter_mut()
            .find(|(id, _)| *id == identity)
            .map(|(_, entity)| entity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.entries.iter().map(|(_, entity)| entity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn added(&self) -> impl Iterator<Item = &E> {
        self.added.iter().filter_map(move |identity| self.get(*identity))
    }

    pub fn removed(&self) -> impl Iterator<Item = &E> {
        self.removed.iter().map(|(_, entity)| entity)
    }

    pub fn has_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Forgets recorded changes, typically once they have been saved.
    pub fn commit(&mut self) {
        self.added.clear();
        self.removed.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Item {
        id: Option<i64>,
        name: &'static str,
    }

    impl Identifiable for Item {
        fn primary_key(&self) -> Value {
            json!(self.id)
        }
    }

    fn item(id: Option<i64>, name: &'static str) -> Item {
        Item { id, name }
    }

    #[test]
    fn test_untracked_collection_records_nothing() {
        let mut items = Collection::new();
        let identity = items.add(item(Some(1), "a"));
        assert!(items.remove(identity));
        assert!(!items.has_changed());
        assert!(items.is_empty());
    }

    #[test]
    fn test_tracks_additions_and_removals() {
        let mut items = Collection::loaded(vec![item(Some(1), "a"), item(Some(2), "b")]);
        assert!(!items.has_changed());

        items.add(item(None, "c"));
        assert!(items.remove_by_key(&json!(1)));

        let added: Vec<_> = items.added().map(|i| i.name).collect();
        let removed: Vec<_> = items.removed().map(|i| i.name).collect();
        assert_eq!(added, vec!["c"]);
        assert_eq!(removed, vec!["a"]);

        items.commit();
        assert!(!items.has_changed());
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_add_and_remove_cancel_out() {
        let mut items = Collection::tracked();
        let first = items.add(item(None, "a"));
        let second = items.add(item(None, "a"));
        assert_ne!(first, second);

        assert!(items.remove(first));
        assert_eq!(items.added().count(), 1);
        assert_eq!(items.removed().count(), 0);

        let mut items = Collection::loaded(vec![item(Some(5), "e")]);
        items.remove_by_key(&json!(5));
        items.add(item(Some(5), "e"));
        assert!(!items.has_changed());
    }

    #[test]
    fn test_identify_prefers_primary_key() {
        let mut items = Collection::tracked();
        let keyed = items.add(item(Some(3), "k"));
        let unkeyed = items.add(item(None, "u"));

        assert_eq!(items.identify(&item(Some(3), "other"), None), Some(keyed));
        assert_eq!(items.identify(&item(None, "u"), Some(unkeyed)), Some(unkeyed));
        assert_eq!(items.identify(&item(None, "u"), None), None);
        assert_eq!(items.lookup(&Value::Null), None);
    }

    #[test]
    fn test_clear_removes_everything() {
        let mut items = Collection::loaded(vec![item(Some(1), "a")]);
        items.add(item(None, "b"));
        items.clear();
        assert!(items.is_empty());
        assert_eq!(items.removed().map(|i| i.name).collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(items.added().count(), 0);
    }
}
