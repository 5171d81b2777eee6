//! # Capability Masks
//!
//! Bitsets of component ids, and the table that interns them.
//!
//! The number of component types can exceed one machine word, so masks are
//! stored as a word vector. Interning turns every distinct bitset into a
//! small [`MaskHandle`]; two equal bitsets always get the same handle, so
//! families and entities compare capability sets by handle identity.

use std::collections::HashMap;

use super::component::ComponentId;

/// A set of component ids, one bit per id.
///
/// Trailing zero words are always trimmed, so structurally equal sets have
/// equal representations and hash identically.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ComponentMask {
    /// 64 component ids per word.
    words: Vec<u64>,
}

impl ComponentMask {
    /// Creates an empty mask.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Builds a mask from a list of ids.
    #[must_use]
    pub fn from_ids(ids: &[ComponentId]) -> Self {
        let mut mask = Self::new();
        for &id in ids {
            mask.insert(id);
        }
        mask
    }

    /// Returns a copy with `id` set.
    #[must_use]
    pub fn with(mut self, id: ComponentId) -> Self {
        self.insert(id);
        self
    }

    /// Sets the bit for `id`. Returns `true` if it was clear.
    pub fn insert(&mut self, id: ComponentId) -> bool {
        let (word, bit) = Self::split(id);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let was_clear = self.words[word] & bit == 0;
        self.words[word] |= bit;
        was_clear
    }

    /// Clears the bit for `id`. Returns `true` if it was set.
    pub fn remove(&mut self, id: ComponentId) -> bool {
        let (word, bit) = Self::split(id);
        let Some(slot) = self.words.get_mut(word) else {
            return false;
        };
        let was_set = *slot & bit != 0;
        *slot &= !bit;
        self.trim();
        was_set
    }

    /// Checks whether `id` is set.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: ComponentId) -> bool {
        let (word, bit) = Self::split(id);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    /// Checks `(self & required) == required`.
    #[must_use]
    pub fn is_superset_of(&self, required: &Self) -> bool {
        required
            .words
            .iter()
            .enumerate()
            .all(|(i, &w)| self.words.get(i).copied().unwrap_or(0) & w == w)
    }

    /// Returns the union of two masks.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let (long, short) = if self.words.len() >= other.words.len() {
            (self, other)
        } else {
            (other, self)
        };
        let mut words = long.words.clone();
        for (dst, src) in words.iter_mut().zip(&short.words) {
            *dst |= src;
        }
        Self { words }
    }

    /// Returns `true` if no bit is set.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Returns the number of set bits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates over the set ids in ascending order.
    pub fn iter(&self) -> MaskIter<'_> {
        MaskIter {
            words: &self.words,
            word_idx: 0,
            current_word: self.words.first().copied().unwrap_or(0),
        }
    }

    #[inline]
    fn split(id: ComponentId) -> (usize, u64) {
        let index = id.index();
        (index / 64, 1u64 << (index % 64))
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

impl FromIterator<ComponentId> for ComponentMask {
    fn from_iter<I: IntoIterator<Item = ComponentId>>(iter: I) -> Self {
        let mut mask = Self::new();
        for id in iter {
            mask.insert(id);
        }
        mask
    }
}

/// Iterator over the ids set in a [`ComponentMask`].
pub struct MaskIter<'a> {
    words: &'a [u64],
    word_idx: usize,
    current_word: u64,
}

impl Iterator for MaskIter<'_> {
    type Item = ComponentId;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current_word != 0 {
                // Lowest set bit
                let bit = self.current_word.trailing_zeros() as usize;
                self.current_word &= self.current_word - 1;
                let index = self.word_idx * 64 + bit;
                return u32::try_from(index).ok().map(ComponentId::new);
            }

            self.word_idx += 1;
            if self.word_idx >= self.words.len() {
                return None;
            }
            self.current_word = self.words[self.word_idx];
        }
    }
}

/// Interned handle to a [`ComponentMask`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaskHandle(u32);

impl MaskHandle {
    /// Handle of the empty mask. Always interned first.
    pub const EMPTY: Self = Self(0);

    /// Returns the raw table index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// De-duplicating table of masks.
///
/// Owned by the world; there is no global mask table.
pub struct MaskTable {
    /// Masks by handle.
    masks: Vec<ComponentMask>,
    /// Reverse lookup.
    handles: HashMap<ComponentMask, MaskHandle>,
}

// A table always holds the empty mask, so `len` never reaches zero.
#[allow(clippy::len_without_is_empty)]
impl MaskTable {
    /// Creates a table holding only the empty mask.
    #[must_use]
    pub fn new() -> Self {
        let mut handles = HashMap::new();
        handles.insert(ComponentMask::new(), MaskHandle::EMPTY);
        Self {
            masks: vec![ComponentMask::new()],
            handles,
        }
    }

    /// Returns the handle for `mask`, interning it on first sight.
    pub fn intern(&mut self, mask: ComponentMask) -> MaskHandle {
        if let Some(&handle) = self.handles.get(&mask) {
            return handle;
        }
        let index = u32::try_from(self.masks.len()).unwrap_or_else(|_| {
            unreachable!("more than u32::MAX distinct capability masks")
        });
        let handle = MaskHandle(index);
        self.masks.push(mask.clone());
        self.handles.insert(mask, handle);
        handle
    }

    /// Returns the handle for `mask` if it is already interned.
    #[must_use]
    pub fn lookup(&self, mask: &ComponentMask) -> Option<MaskHandle> {
        self.handles.get(mask).copied()
    }

    /// Resolves a handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle came from another table.
    #[inline]
    #[must_use]
    pub fn get(&self, handle: MaskHandle) -> &ComponentMask {
        &self.masks[handle.index()]
    }

    /// Returns the number of distinct masks, the empty mask included.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.masks.len()
    }
}

impl Default for MaskTable {
    fn default() -> Self {
        Self::new()
    }
}
