//! Recency list with O(1) touch, insert, remove, and pop-oldest
//!
//! A doubly linked list stored in a slab (`Vec` of nodes plus a free list)
//! with a key → slot index. Head is most recently used, tail least.

use std::collections::HashMap;

#[derive(Debug)]
struct Node {
    key: String,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
pub struct LruList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    slots: HashMap<String, usize>,
}

impl LruList {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Mark `key` most recently used, inserting it if absent.
    pub fn push_front(&mut self, key: &str) {
        if let Some(&slot) = self.slots.get(key) {
            self.unlink(slot);
            self.link_front(slot);
            return;
        }
        let node = Node {
            key: key.to_string(),
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.slots.insert(key.to_string(), slot);
        self.link_front(slot);
    }

    /// Move an existing key to the front. Returns false if absent.
    pub fn touch(&mut self, key: &str) -> bool {
        match self.slots.get(key) {
            Some(&slot) => {
                self.unlink(slot);
                self.link_front(slot);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                self.unlink(slot);
                self.nodes[slot].key.clear();
                self.free.push(slot);
                true
            }
            None => false,
        }
    }

    /// Remove and return the least recently used key.
    pub fn pop_back(&mut self) -> Option<String> {
        let slot = self.tail?;
        let key = std::mem::take(&mut self.nodes[slot].key);
        self.slots.remove(&key);
        self.unlink(slot);
        self.free.push(slot);
        Some(key)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Keys from most to least recently used.
    #[cfg(test)]
    fn iter(&self) -> impl Iterator<Item = &str> {
        std::iter::successors(self.head, |&slot| self.nodes[slot].next)
            .map(|slot| self.nodes[slot].key.as_str())
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[slot].prev = None;
        self.nodes[slot].next = None;
    }

    fn link_front(&mut self, slot: usize) {
        self.nodes[slot].prev = None;
        self.nodes[slot].next = self.head;
        if let Some(h) = self.head {
            self.nodes[h].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(list: &LruList) -> Vec<&str> {
        list.iter().collect()
    }

    #[test]
    fn push_front_orders_most_recent_first() {
        let mut list = LruList::new();
        list.push_front("a");
        list.push_front("b");
        list.push_front("c");
        assert_eq!(order(&list), ["c", "b", "a"]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn touch_moves_to_front() {
        let mut list = LruList::new();
        for k in ["a", "b", "c"] {
            list.push_front(k);
        }
        assert!(list.touch("a"));
        assert_eq!(order(&list), ["a", "c", "b"]);
        assert!(!list.touch("zzz"));
    }

    #[test]
    fn pop_back_returns_coldest() {
        let mut list = LruList::new();
        for k in ["a", "b", "c"] {
            list.push_front(k);
        }
        list.touch("a");
        assert_eq!(list.pop_back().as_deref(), Some("b"));
        assert_eq!(list.pop_back().as_deref(), Some("c"));
        assert_eq!(list.pop_back().as_deref(), Some("a"));
        assert_eq!(list.pop_back(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_middle_head_and_tail() {
        let mut list = LruList::new();
        for k in ["a", "b", "c", "d"] {
            list.push_front(k);
        }
        assert!(list.remove("c"));
        assert!(list.remove("d"));
        assert!(list.remove("a"));
        assert!(!list.remove("a"));
        assert_eq!(order(&list), ["b"]);
        assert_eq!(list.pop_back().as_deref(), Some("b"));
    }

    #[test]
    fn slots_are_reused() {
        let mut list = LruList::new();
        list.push_front("a");
        list.push_front("b");
        list.remove("a");
        list.push_front("c");
        assert_eq!(list.nodes.len(), 2);
        assert_eq!(order(&list), ["c", "b"]);
    }

    #[test]
    fn reinserting_existing_key_does_not_duplicate() {
        let mut list = LruList::new();
        list.push_front("a");
        list.push_front("b");
        list.push_front("a");
        assert_eq!(order(&list), ["a", "b"]);
        assert_eq!(list.len(), 2);
    }
}
