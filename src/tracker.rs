use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::meta::Object;

/// Identity of a live object: the address of its shared allocation.
/// Valid for as long as any strong reference exists; the dirty and ghost
/// sets hold strong references, so identities they contain never dangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(usize);

impl ObjId {
    pub(crate) fn of(obj: &Object) -> Self {
        ObjId(obj as *const Object as usize)
    }

    #[cfg(test)]
    pub(crate) fn raw(value: usize) -> Self {
        ObjId(value)
    }
}

/// Pending lifecycle flag of an object within its store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pending {
    #[default]
    None,
    Add,
    Remove,
}

/// Objects requiring a flush action, in the order they were dirtied.
///
/// Insertion order is kept so unconstrained objects flush in a
/// deterministic order rather than hash order.
#[derive(Debug, Default)]
pub(crate) struct DirtySet {
    items: Vec<(ObjId, Rc<Object>)>,
}

impl DirtySet {
    pub fn insert(&mut self, id: ObjId, obj: Rc<Object>) {
        if !self.contains(id) {
            self.items.push((id, obj));
        }
    }

    pub fn remove(&mut self, id: ObjId) -> Option<Rc<Object>> {
        let pos = self.items.iter().position(|(i, _)| *i == id)?;
        Some(self.items.remove(pos).1)
    }

    pub fn contains(&self, id: ObjId) -> bool {
        self.items.iter().any(|(i, _)| *i == id)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjId, &Rc<Object>)> {
        self.items.iter().map(|(id, obj)| (*id, obj))
    }
}

/// Objects deleted from the database but still reachable through the
/// cache until the owning transaction ends.
#[derive(Debug, Default)]
pub(crate) struct GhostSet {
    items: HashMap<ObjId, Rc<Object>>,
}

impl GhostSet {
    pub fn insert(&mut self, id: ObjId, obj: Rc<Object>) {
        self.items.insert(id, obj);
    }

    pub fn remove(&mut self, id: ObjId) {
        self.items.remove(&id);
    }

    pub fn contains(&self, id: ObjId) -> bool {
        self.items.contains_key(&id)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn objects(&self) -> Vec<Rc<Object>> {
        self.items.values().cloned().collect()
    }
}

/// Reference-counted before/after flush constraints. Only pairs with a
/// positive count are enforced, so redundant add/remove calls cancel.
#[derive(Debug, Default)]
pub(crate) struct FlushOrder {
    pairs: HashMap<(ObjId, ObjId), i64>,
}

impl FlushOrder {
    pub fn add(&mut self, before: ObjId, after: ObjId) {
        *self.pairs.entry((before, after)).or_insert(0) += 1;
    }

    pub fn remove(&mut self, before: ObjId, after: ObjId) {
        if let Some(count) = self.pairs.get_mut(&(before, after)) {
            *count -= 1;
        }
    }

    /// Map each constrained object to the set of objects that must flush
    /// strictly before it.
    pub fn predecessors(&self) -> HashMap<ObjId, HashSet<ObjId>> {
        let mut map: HashMap<ObjId, HashSet<ObjId>> = HashMap::new();
        for (&(before, after), &count) in &self.pairs {
            if count > 0 {
                map.entry(after).or_default().insert(before);
            }
        }
        map
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_counts_cancel() {
        let (a, b) = (ObjId::raw(1), ObjId::raw(2));
        let mut order = FlushOrder::default();
        order.add(a, b);
        order.add(a, b);
        order.remove(a, b);
        assert!(order.predecessors().get(&b).is_some_and(|s| s.contains(&a)));
        order.remove(a, b);
        assert!(order.predecessors().is_empty());
        // Removing below zero keeps the pair unenforced even after a
        // later add brings it back to zero.
        order.remove(a, b);
        order.add(a, b);
        assert!(order.predecessors().is_empty());
    }

    #[test]
    fn order_clear_drops_everything() {
        let (a, b) = (ObjId::raw(1), ObjId::raw(2));
        let mut order = FlushOrder::default();
        order.add(a, b);
        order.clear();
        assert!(order.predecessors().is_empty());
    }
}
