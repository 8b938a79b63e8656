//! Generation checked resource slots
//!
//! Native resources are never handed out by pointer. Callers and worker jobs
//! hold a [`SlotKey`] (index plus generation); a slot's generation is bumped
//! whenever its entry is removed, so a key that outlived its resource no
//! longer resolves.

/// Index of a slot together with the generation it was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{index}v{generation}")]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

impl SlotKey {
    /// Slot index
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when the key was issued
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

/// Slab of entries addressed by [`SlotKey`]
#[derive(Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store `entry` and return its key
    pub(crate) fn insert(&mut self, entry: T) -> SlotKey {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return SlotKey {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        SlotKey {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, key: SlotKey) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub(crate) fn contains(&self, key: SlotKey) -> bool {
        self.get(key).is_some()
    }

    /// Remove the entry for `key`, invalidating every copy of the key
    pub(crate) fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self
            .slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(entry)
    }

    /// Remove every entry, invalidating all outstanding keys
    pub(crate) fn clear(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                drained.push(entry);
            }
        }
        self.len = 0;
        drained
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (SlotKey, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    SlotKey {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");

        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_stale_key_after_remove() {
        let mut arena = Arena::new();
        let key = arena.insert(1);
        assert_eq!(arena.remove(key), Some(1));

        // Slot is reused with a new generation
        let reused = arena.insert(2);
        assert_eq!(reused.index(), key.index());
        assert_ne!(reused.generation(), key.generation());

        assert!(arena.get(key).is_none());
        assert!(arena.remove(key).is_none());
        assert_eq!(arena.get(reused), Some(&2));
    }

    #[test]
    fn test_clear_invalidates_all_keys() {
        let mut arena = Arena::new();
        let keys: Vec<_> = (0..4).map(|i| arena.insert(i)).collect();

        let drained = arena.clear();
        assert_eq!(drained.len(), 4);
        assert_eq!(arena.len(), 0);
        assert!(keys.iter().all(|key| !arena.contains(*key)));

        let fresh = arena.insert(10);
        assert!(!keys.contains(&fresh));
        assert_eq!(arena.iter().count(), 1);
    }
}
