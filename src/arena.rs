//! Paged, generation-checked slot arenas for scheduler records.
//!
//! Task and group records are allocated out of fixed-size pages so that a
//! burst of submissions does not pay one heap allocation per record. Slots
//! carry a generation tag: a stale identifier whose slot has been recycled
//! fails the generation check instead of aliasing a new record.

/// Opaque handle to a slot in a [`SlotArena`].
///
/// The public task/group identifiers map to these through the pool registry;
/// raw addresses are never handed out.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct SlotId {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Object pool backed by a chain of fixed-size pages.
///
/// Pages are never freed or moved once allocated; a freed slot goes onto a
/// free list and is reused with a bumped generation.
pub(crate) struct SlotArena<T> {
    pages: Vec<Box<[Slot<T>]>>,
    free: Vec<u32>,
    live: usize,
    page_size: usize,
}

impl<T> SlotArena<T> {
    pub fn with_page_size(page_size: usize) -> Self {
        assert!(page_size > 0, "arena page size must be non-zero");
        SlotArena {
            pages: Vec::new(),
            free: Vec::new(),
            live: 0,
            page_size,
        }
    }

    fn add_page(&mut self) {
        let base = (self.pages.len() * self.page_size) as u32;
        let page: Vec<Slot<T>> = (0..self.page_size)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();
        self.pages.push(page.into_boxed_slice());
        // Reversed so slots are handed out in ascending index order.
        self.free
            .extend((base..base + self.page_size as u32).rev());
    }

    pub fn insert(&mut self, value: T) -> SlotId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.add_page();
                self.free.pop().expect("fresh page must have free slots")
            }
        };
        let slot = &mut self.pages[index as usize / self.page_size][index as usize % self.page_size];
        debug_assert!(slot.value.is_none());
        slot.value = Some(value);
        self.live += 1;
        SlotId {
            index,
            generation: slot.generation,
        }
    }

    fn slot(&self, id: SlotId) -> Option<&Slot<T>> {
        self.pages
            .get(id.index as usize / self.page_size)
            .map(|page| &page[id.index as usize % self.page_size])
            .filter(|slot| slot.generation == id.generation)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slot(id).and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        let page_size = self.page_size;
        self.pages
            .get_mut(id.index as usize / page_size)
            .map(|page| &mut page[id.index as usize % page_size])
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let page_size = self.page_size;
        let slot = self
            .pages
            .get_mut(id.index as usize / page_size)
            .map(|page| &mut page[id.index as usize % page_size])
            .filter(|slot| slot.generation == id.generation)?;
        let value = slot.value.take();
        if value.is_some() {
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index);
            self.live -= 1;
        }
        value
    }

    pub fn len(&self) -> usize {
        self.live
    }
}
