// Slab allocator - stable integer keys over a reusable slot vector
//
// Each slot is either occupied by a live value or free and linked into a
// singly-linked free list. Slots are never removed, only reused, so a key
// stays valid until it is released.

use std::fmt;

/// Key handed out by [`Slab::emplace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlabKey(u32);

impl SlabKey {
    /// Index of the slot this key addresses.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<SlabKey> for usize {
    fn from(key: SlabKey) -> Self {
        key.index()
    }
}

impl fmt::Display for SlabKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum Slot<T> {
    Occupied(T),
    /// Link to the next free slot (`None` terminates the list)
    Free { next: Option<u32> },
}

/// Growable container with O(1) insert/release and LIFO slot reuse.
///
/// Dropping the slab drops every still-occupied value exactly once; released
/// slots hold no value and are skipped.
pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    next_free: Option<u32>,
    len: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            next_free: None,
            len: 0,
        }
    }

    /// Store `value`, reusing the most recently released slot if there is one.
    pub fn emplace(&mut self, value: T) -> SlabKey {
        self.len += 1;

        if let Some(index) = self.next_free {
            let slot = &mut self.slots[index as usize];
            let next = match slot {
                Slot::Free { next } => *next,
                Slot::Occupied(_) => unreachable!("free list points at occupied slot {}", index),
            };
            *slot = Slot::Occupied(value);
            self.next_free = next;
            return SlabKey(index);
        }

        let index = u32::try_from(self.slots.len()).expect("slab exceeded u32::MAX slots");
        self.slots.push(Slot::Occupied(value));
        SlabKey(index)
    }

    /// Borrow the value behind `key`.
    ///
    /// # Panics
    /// If `key` was released or never issued by this slab.
    pub fn get(&self, key: SlabKey) -> &T {
        match self.slots.get(key.index()) {
            Some(Slot::Occupied(value)) => value,
            _ => panic!("slab key {} is not live", key),
        }
    }

    /// Mutable counterpart of [`Slab::get`].
    pub fn get_mut(&mut self, key: SlabKey) -> &mut T {
        match self.slots.get_mut(key.index()) {
            Some(Slot::Occupied(value)) => value,
            _ => panic!("slab key {} is not live", key),
        }
    }

    /// Non-panicking lookup.
    pub fn try_get(&self, key: SlabKey) -> Option<&T> {
        match self.slots.get(key.index()) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, key: SlabKey) -> bool {
        self.try_get(key).is_some()
    }

    /// Take the value out of its slot and push the slot onto the free list.
    ///
    /// # Panics
    /// On double release or a key that was never issued.
    pub fn release(&mut self, key: SlabKey) -> T {
        let slot = self
            .slots
            .get_mut(key.index())
            .unwrap_or_else(|| panic!("slab key {} was never issued", key));

        let freed = std::mem::replace(slot, Slot::Free { next: self.next_free });
        match freed {
            Slot::Occupied(value) => {
                self.next_free = Some(key.0);
                self.len -= 1;
                value
            }
            Slot::Free { next } => {
                // Undo so the free list stays intact before panicking
                *slot = Slot::Free { next };
                panic!("slab key {} released twice", key)
            }
        }
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever allocated (live + free). Never shrinks.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Iterate over live values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (SlabKey, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied(value) => Some((SlabKey(i as u32), value)),
            Slot::Free { .. } => None,
        })
    }
}

impl<T: fmt::Debug> fmt::Debug for Slab<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct DropCounter(Rc<Cell<usize>>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn keys_stay_valid_until_released() {
        let mut slab = Slab::new();
        let a = slab.emplace("a".to_string());
        let b = slab.emplace("b".to_string());
        let c = slab.emplace("c".to_string());

        slab.release(b);

        assert_eq!(slab.get(a), "a");
        assert_eq!(slab.get(c), "c");
        assert!(!slab.contains(b));
        assert_eq!(slab.len(), 2);
    }

    #[test]
    fn reuse_is_lifo() {
        let mut slab = Slab::with_capacity(8);
        let keys: Vec<_> = (0..5).map(|i| slab.emplace(i)).collect();

        slab.release(keys[1]);
        slab.release(keys[3]);
        slab.release(keys[0]);

        assert_eq!(slab.emplace(10), keys[0]);
        assert_eq!(slab.emplace(11), keys[3]);
        assert_eq!(slab.emplace(12), keys[1]);
        // Free list exhausted: append
        assert_eq!(slab.emplace(13).index(), 5);
        assert_eq!(slab.slot_count(), 6);
    }

    #[test]
    fn keys_are_not_reused_before_release() {
        let mut slab = Slab::new();
        let first: Vec<_> = (0..4).map(|i| slab.emplace(i)).collect();
        let second: Vec<_> = (0..4).map(|i| slab.emplace(i)).collect();
        for key in &second {
            assert!(!first.contains(key));
        }
    }

    #[test]
    fn get_mut_writes_through() {
        let mut slab = Slab::new();
        let key = slab.emplace(1u32);
        *slab.get_mut(key) += 41;
        assert_eq!(*slab.get(key), 42);
    }

    #[test]
    fn release_returns_value_and_drops_once() {
        let drops = Rc::new(Cell::new(0));
        let mut slab = Slab::new();
        let key = slab.emplace(DropCounter(drops.clone()));

        let value = slab.release(key);
        assert_eq!(drops.get(), 0);
        drop(value);
        assert_eq!(drops.get(), 1);

        drop(slab);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn drop_destroys_live_values_exactly_once() {
        let drops = Rc::new(Cell::new(0));
        let mut constructed = 0;
        let mut released = 0;
        let mut slab = Slab::new();
        let mut live = Vec::new();

        // Interleave emplace/release so free slots end up scattered
        for round in 0..6 {
            for _ in 0..4 {
                live.push(slab.emplace(DropCounter(drops.clone())));
                constructed += 1;
            }
            if round % 2 == 0 {
                let key = live.remove(1);
                drop(slab.release(key));
                released += 1;
                let key = live.pop().unwrap();
                drop(slab.release(key));
                released += 1;
            }
        }

        assert_eq!(drops.get(), released);
        drop(slab);
        assert_eq!(drops.get(), constructed);
        assert_eq!(constructed - released, live.len());
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_release_panics() {
        let mut slab = Slab::new();
        let key = slab.emplace(5);
        slab.release(key);
        slab.release(key);
    }

    #[test]
    #[should_panic(expected = "not live")]
    fn get_after_release_panics() {
        let mut slab = Slab::new();
        let key = slab.emplace(5);
        slab.release(key);
        let _ = slab.get(key);
    }

    #[test]
    fn iter_skips_free_slots() {
        let mut slab = Slab::new();
        let a = slab.emplace('a');
        let b = slab.emplace('b');
        let c = slab.emplace('c');
        slab.release(b);

        let live: Vec<_> = slab.iter().collect();
        assert_eq!(live, vec![(a, &'a'), (c, &'c')]);
    }
}
