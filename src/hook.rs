//! Generic, reference-counted record list.
//!
//! [`HookList`] is the storage primitive underneath the [source registry]: a
//! doubly-linked list of records allocated from a pooled arena, where every
//! record carries a unique monotonically increasing [identifier], a flags
//! word and a reference count. The reference count is what makes iteration
//! safe in the face of mutation: a cursor holds a reference on the record it
//! is parked on, so the record — and its links — survive even if the record
//! is [destroyed] while the cursor sits on it. The slot is only recycled
//! once the record is both destroyed and no references remain.
//!
//! The list is generic over its record value and is usable on its own, e.g.
//! for callback lists maintained by consumers of the registry.
//!
//! [source registry]: crate::Registry
//! [identifier]: HookId
//! [destroyed]: HookList::destroy

use std::cmp::Ordering;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Identifier of a record in a [`HookList`].
///
/// Identifiers are unique per list and monotonically increasing; they are
/// never reused, so a stale `HookId` simply stops matching once its record
/// is destroyed. The id `0` is reserved for records that are not part of
/// any list, see [`INVALID_HOOK_ID`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HookId(pub u64);

/// The only invalid hook id, carried by records not linked into any list.
pub const INVALID_HOOK_ID: HookId = HookId(0);

impl HookId {
    /// Whether or not the `HookId` is valid.
    pub fn is_valid(&self) -> bool {
        *self != INVALID_HOOK_ID
    }
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-record flags word.
///
/// The low bits are owned by the list itself ([`ACTIVE`], [`IN_CALL`]),
/// everything from [`HookFlags::USER_SHIFT`] up is free for the list's user,
/// see for example the ready and can-recurse flags kept by the [registry].
///
/// [`ACTIVE`]: HookFlags::ACTIVE
/// [`IN_CALL`]: HookFlags::IN_CALL
/// [registry]: crate::Registry
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct HookFlags(pub u16);

impl HookFlags {
    /// The record is live: it has not been destroyed.
    pub const ACTIVE: HookFlags = HookFlags(1 << 0);
    /// The record's callback is currently being invoked.
    pub const IN_CALL: HookFlags = HookFlags(1 << 1);
    /// First bit available to users of the list.
    pub const USER_SHIFT: u16 = 4;

    /// No flags set.
    pub const fn empty() -> HookFlags {
        HookFlags(0)
    }

    /// Whether all flags in `other` are set in `self`.
    pub fn contains(self, other: HookFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HookFlags {
    type Output = HookFlags;
    fn bitor(self, rhs: HookFlags) -> HookFlags {
        HookFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for HookFlags {
    fn bitor_assign(&mut self, rhs: HookFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for HookFlags {
    type Output = HookFlags;
    fn bitand(self, rhs: HookFlags) -> HookFlags {
        HookFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for HookFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HookFlags({:#b})", self.0)
    }
}

/// Position of a record in a [`HookList`]'s arena.
///
/// An `Entry` stays usable for as long as a reference is held on the record
/// it points at, even after the record is destroyed; this is what allows a
/// cursor to keep walking a list that is mutated underneath it. Obtain one
/// from [`first_valid`], [`next_valid`] or [`entry`].
///
/// [`first_valid`]: HookList::first_valid
/// [`next_valid`]: HookList::next_valid
/// [`entry`]: HookList::entry
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Entry(usize);

/// A record slot in the arena.
#[derive(Debug)]
struct Slot<T> {
    /// `INVALID_HOOK_ID` once destroyed (or while on the free list).
    id: HookId,
    flags: HookFlags,
    /// Number of outstanding references, including the list's own (dropped
    /// at destroy time). The slot is recycled when this hits zero.
    refs: usize,
    prev: Option<usize>,
    next: Option<usize>,
    /// Taken (and dropped) at destroy time.
    value: Option<T>,
}

/// A reference-counted, pool-allocated, doubly-linked record list.
///
/// See the [module documentation] for an overview of the reference-count
/// protocol.
///
/// # Examples
///
/// ```
/// use kairos::hook::HookList;
///
/// let mut hooks = HookList::new();
/// let a = hooks.insert_before(None, "a");
/// let b = hooks.insert_before(None, "b");
///
/// assert_eq!(hooks.get(a), Some(&"a"));
/// assert_eq!(hooks.destroy(b), Some("b"));
/// // Destroying twice is a no-op.
/// assert_eq!(hooks.destroy(b), None);
/// assert_eq!(hooks.len(), 1);
/// ```
///
/// [module documentation]: crate::hook
#[derive(Debug)]
pub struct HookList<T> {
    slots: Vec<Slot<T>>,
    /// Indices of recycled slots.
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    next_id: u64,
    /// Cleared by `clear`; the arena is released once the last record goes.
    is_setup: bool,
}

impl<T> HookList<T> {
    /// Create a new, empty list.
    pub fn new() -> HookList<T> {
        HookList {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            next_id: 1,
            is_setup: true,
        }
    }

    /// Returns the number of live (not destroyed) records.
    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut at = self.head;
        while let Some(index) = at {
            if self.slots[index].id.is_valid() {
                n += 1;
            }
            at = self.slots[index].next;
        }
        n
    }

    /// Whether or not the list holds any live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop a slot from the free list or carve a new one from the arena.
    fn alloc(&mut self, value: T) -> usize {
        let slot = Slot {
            id: INVALID_HOOK_ID,
            flags: HookFlags::ACTIVE,
            refs: 0,
            prev: None,
            next: None,
            value: Some(value),
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = slot;
                index
            },
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            },
        }
    }

    /// Insert `value` before the record with id `sibling`, or at the tail
    /// if `sibling` is `None`. Returns the new record's id.
    ///
    /// The new record starts with a single reference, owned by the list.
    ///
    /// # Panics
    ///
    /// Panics if the list was [cleared], or if `sibling` does not name a
    /// live record in this list.
    ///
    /// [cleared]: HookList::clear
    pub fn insert_before(&mut self, sibling: Option<HookId>, value: T) -> HookId {
        assert!(self.is_setup, "insert into a cleared HookList");
        let before = sibling.map(|id| match self.index_of(id) {
            Some(index) => index,
            None => panic!("insert_before: no record with id {}", id),
        });

        let index = self.alloc(value);
        let id = HookId(self.next_id);
        self.next_id += 1;
        {
            let slot = &mut self.slots[index];
            slot.id = id;
            slot.refs = 1;
        }
        self.link_before(index, before);
        id
    }

    /// Insert `value` in sorted position.
    ///
    /// Walks the live records and inserts before the first sibling for
    /// which `compare(&value, sibling)` is not [`Ordering::Greater`], or at
    /// the tail. A comparator that never returns [`Ordering::Equal`] for
    /// equal keys therefore yields first-in-first-out ordering among them.
    pub fn insert_sorted<F>(&mut self, value: T, mut compare: F) -> HookId
        where F: FnMut(&T, &T) -> Ordering,
    {
        let mut sibling = None;
        let mut at = self.head;
        while let Some(index) = at {
            let slot = &self.slots[index];
            if self.valid_at(index) {
                let existing = slot.value.as_ref().unwrap();
                if compare(&value, existing) != Ordering::Greater {
                    sibling = Some(slot.id);
                    break;
                }
            }
            at = slot.next;
        }
        self.insert_before(sibling, value)
    }

    /// Splice `index` into the chain before `before` (tail if `None`).
    fn link_before(&mut self, index: usize, before: Option<usize>) {
        match before {
            Some(next) => {
                let prev = self.slots[next].prev;
                self.slots[index].prev = prev;
                self.slots[index].next = Some(next);
                self.slots[next].prev = Some(index);
                match prev {
                    Some(prev) => self.slots[prev].next = Some(index),
                    None => self.head = Some(index),
                }
            },
            None => {
                let prev = self.tail;
                self.slots[index].prev = prev;
                self.slots[index].next = None;
                match prev {
                    Some(prev) => self.slots[prev].next = Some(index),
                    None => self.head = Some(index),
                }
                self.tail = Some(index);
            },
        }
    }

    /// Remove `index` from the chain. Called once its last reference drops.
    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.slots[index].prev, self.slots[index].next);
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.tail = prev,
        }
        self.slots[index].prev = None;
        self.slots[index].next = None;
    }

    fn valid_at(&self, index: usize) -> bool {
        let slot = &self.slots[index];
        slot.id.is_valid() && slot.flags.contains(HookFlags::ACTIVE)
    }

    fn index_of(&self, id: HookId) -> Option<usize> {
        if !id.is_valid() {
            return None;
        }
        let mut at = self.head;
        while let Some(index) = at {
            if self.slots[index].id == id {
                return Some(index);
            }
            at = self.slots[index].next;
        }
        None
    }

    /// Returns the position of the live record with id `id`.
    pub fn entry(&self, id: HookId) -> Option<Entry> {
        self.index_of(id).filter(|&index| self.valid_at(index)).map(Entry)
    }

    /// Returns a reference to the value of the live record with id `id`.
    pub fn get(&self, id: HookId) -> Option<&T> {
        self.entry(id).and_then(move |entry| self.value(entry))
    }

    /// Returns a mutable reference to the value of the live record with id
    /// `id`.
    pub fn get_mut(&mut self, id: HookId) -> Option<&mut T> {
        match self.entry(id) {
            Some(Entry(index)) => self.slots[index].value.as_mut(),
            None => None,
        }
    }

    /// Returns the id of the first live record matching `predicate`.
    ///
    /// Destroyed records are skipped.
    pub fn find<F>(&self, mut predicate: F) -> Option<HookId>
        where F: FnMut(&T) -> bool,
    {
        let mut at = self.head;
        while let Some(index) = at {
            if self.valid_at(index) && predicate(self.slots[index].value.as_ref().unwrap()) {
                return Some(self.slots[index].id);
            }
            at = self.slots[index].next;
        }
        None
    }

    /// Returns the id of the record at `entry`, or [`INVALID_HOOK_ID`] if
    /// it was destroyed.
    pub fn id(&self, entry: Entry) -> HookId {
        self.slots[entry.0].id
    }

    /// Returns the value at `entry`, or `None` if the record was destroyed.
    pub fn value(&self, entry: Entry) -> Option<&T> {
        self.slots[entry.0].value.as_ref()
    }

    /// Mutable variant of [`value`].
    ///
    /// [`value`]: HookList::value
    pub fn value_mut(&mut self, entry: Entry) -> Option<&mut T> {
        self.slots[entry.0].value.as_mut()
    }

    /// Whether the record at `entry` is live: not destroyed and active.
    pub fn is_valid(&self, entry: Entry) -> bool {
        self.valid_at(entry.0)
    }

    /// Returns the flags of the record at `entry`.
    pub fn flags(&self, entry: Entry) -> HookFlags {
        self.slots[entry.0].flags
    }

    /// Whether all of `flags` are set on the record at `entry`.
    pub fn is_set(&self, entry: Entry, flags: HookFlags) -> bool {
        self.slots[entry.0].flags.contains(flags)
    }

    /// Set `flags` on the record at `entry`.
    pub fn set(&mut self, entry: Entry, flags: HookFlags) {
        self.slots[entry.0].flags |= flags;
    }

    /// Clear `flags` on the record at `entry`.
    pub fn unset(&mut self, entry: Entry, flags: HookFlags) {
        self.slots[entry.0].flags.0 &= !flags.0;
    }

    /// Take a reference on the record at `entry`, keeping its slot and
    /// links alive until [`release`]d.
    ///
    /// [`release`]: HookList::release
    pub fn acquire(&mut self, entry: Entry) {
        debug_assert!(self.slots[entry.0].refs > 0, "acquire on a recycled slot");
        self.slots[entry.0].refs += 1;
    }

    /// Drop a reference on the record at `entry`.
    ///
    /// When the last reference drops the slot is unlinked and returned to
    /// the arena; returns `true` in that case. If this empties a [cleared]
    /// list the arena itself is released.
    ///
    /// [cleared]: HookList::clear
    pub fn release(&mut self, entry: Entry) -> bool {
        let index = entry.0;
        debug_assert!(self.slots[index].refs > 0, "release on a recycled slot");
        self.slots[index].refs -= 1;
        if self.slots[index].refs > 0 {
            return false;
        }
        debug_assert!(!self.slots[index].id.is_valid(), "last reference dropped on a live record");
        self.unlink(index);
        self.slots[index].value = None;
        self.free.push(index);
        if !self.is_setup && self.head.is_none() {
            // Teardown was requested; with the last record gone the arena
            // can go too.
            self.slots = Vec::new();
            self.free = Vec::new();
        }
        true
    }

    /// Destroy the record at `entry`, see [`destroy`].
    ///
    /// [`destroy`]: HookList::destroy
    pub fn destroy_entry(&mut self, entry: Entry) -> Option<T> {
        let index = entry.0;
        if !self.slots[index].id.is_valid() {
            // Already destroyed.
            return None;
        }
        self.slots[index].id = INVALID_HOOK_ID;
        self.slots[index].flags.0 &= !HookFlags::ACTIVE.0;
        let value = self.slots[index].value.take();
        // Drop the list's own reference; the slot sticks around while
        // cursors or queued work still point at it.
        let _ = self.release(entry);
        value
    }

    /// Destroy the record with id `id`, returning its value.
    ///
    /// The record is marked invalid immediately: its id is cleared, it no
    /// longer shows up in scans and its value is handed back to the caller
    /// (destroying it exactly once). The slot itself is recycled only when
    /// the last outstanding reference drops. Destroying an unknown or
    /// already destroyed id is a no-op returning `None`.
    pub fn destroy(&mut self, id: HookId) -> Option<T> {
        match self.index_of(id) {
            Some(index) => self.destroy_entry(Entry(index)),
            None => None,
        }
    }

    /// Returns the position of the first live record, taking a reference
    /// on it.
    ///
    /// The caller owns that reference and must [`release`] it, or trade it
    /// in by advancing with [`next_valid`].
    ///
    /// [`release`]: HookList::release
    /// [`next_valid`]: HookList::next_valid
    pub fn first_valid(&mut self) -> Option<Entry> {
        let mut at = self.head;
        while let Some(index) = at {
            if self.valid_at(index) {
                self.acquire(Entry(index));
                return Some(Entry(index));
            }
            at = self.slots[index].next;
        }
        None
    }

    /// Advance a cursor: returns the next live record after `entry`,
    /// taking a reference on it, and releases the reference held on
    /// `entry`.
    ///
    /// Works even if the record at `entry` was destroyed in the meantime;
    /// the reference the cursor holds keeps its links intact.
    pub fn next_valid(&mut self, entry: Entry) -> Option<Entry> {
        let mut at = self.slots[entry.0].next;
        let mut found = None;
        while let Some(index) = at {
            if self.valid_at(index) {
                self.acquire(Entry(index));
                found = Some(Entry(index));
                break;
            }
            at = self.slots[index].next;
        }
        let _ = self.release(entry);
        found
    }

    /// Request teardown: destroy all live records and mark the list as no
    /// longer set up.
    ///
    /// Records still referenced by in-flight cursors survive (invalid, so
    /// scans skip them); the arena is released as soon as the last of them
    /// goes. Inserting into a cleared list panics.
    pub fn clear(&mut self) {
        let mut at = self.head;
        while let Some(index) = at {
            let next = self.slots[index].next;
            if self.slots[index].id.is_valid() {
                drop(self.destroy_entry(Entry(index)));
            }
            at = next;
        }
        self.is_setup = false;
        if self.head.is_none() {
            self.slots = Vec::new();
            self.free = Vec::new();
        }
    }
}

impl<T> Default for HookList<T> {
    fn default() -> HookList<T> {
        HookList::new()
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::{HookFlags, HookList, INVALID_HOOK_ID};

    #[test]
    fn ids_are_monotonic() {
        let mut hooks = HookList::new();
        let a = hooks.insert_before(None, 1);
        let b = hooks.insert_before(None, 2);
        assert!(a.is_valid());
        assert!(b > a);
    }

    #[test]
    fn insert_before_sibling() {
        let mut hooks = HookList::new();
        let a = hooks.insert_before(None, "a");
        let c = hooks.insert_before(None, "c");
        let b = hooks.insert_before(Some(c), "b");

        let mut order = Vec::new();
        let mut at = hooks.first_valid();
        while let Some(entry) = at {
            order.push(hooks.id(entry));
            at = hooks.next_valid(entry);
        }
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn sorted_insert_is_fifo_for_equal_keys() {
        let mut hooks = HookList::new();
        // Comparator that never returns `Equal`: equal keys sort after
        // existing ones.
        let compare = |new: &(i32, char), old: &(i32, char)| {
            if new.0 < old.0 { Ordering::Less } else { Ordering::Greater }
        };
        let _ = hooks.insert_sorted((1, 'a'), compare);
        let _ = hooks.insert_sorted((0, 'b'), compare);
        let _ = hooks.insert_sorted((1, 'c'), compare);

        let mut order = Vec::new();
        let mut at = hooks.first_valid();
        while let Some(entry) = at {
            order.push(hooks.value(entry).unwrap().1);
            at = hooks.next_valid(entry);
        }
        assert_eq!(order, vec!['b', 'a', 'c']);
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut hooks = HookList::new();
        let id = hooks.insert_before(None, 7);
        assert_eq!(hooks.destroy(id), Some(7));
        assert_eq!(hooks.destroy(id), None);
        assert_eq!(hooks.get(id), None);
    }

    #[test]
    fn destroyed_record_survives_while_referenced() {
        let mut hooks = HookList::new();
        let _ = hooks.insert_before(None, 'a');
        let b = hooks.insert_before(None, 'b');

        let cursor = hooks.first_valid().unwrap();
        // Destroy the record under the cursor; the value goes now, the
        // slot only when the cursor moves on.
        let destroyed = hooks.destroy(hooks.id(cursor));
        assert_eq!(destroyed, Some('a'));
        assert_eq!(hooks.id(cursor), INVALID_HOOK_ID);
        assert_eq!(hooks.value(cursor), None);

        // The cursor still advances past it to `b`.
        let next = hooks.next_valid(cursor).unwrap();
        assert_eq!(hooks.id(next), b);
        let _ = hooks.release(next);
    }

    #[test]
    fn find_skips_destroyed_records() {
        let mut hooks = HookList::new();
        let a = hooks.insert_before(None, 1);
        let b = hooks.insert_before(None, 1);
        let _ = hooks.destroy(a);
        assert_eq!(hooks.find(|&v| v == 1), Some(b));
    }

    #[test]
    fn user_flags() {
        const MARKED: HookFlags = HookFlags(1 << HookFlags::USER_SHIFT);

        let mut hooks = HookList::new();
        let _ = hooks.insert_before(None, ());
        let entry = hooks.first_valid().unwrap();
        assert!(!hooks.is_set(entry, MARKED));
        hooks.set(entry, MARKED);
        assert!(hooks.is_set(entry, MARKED));
        hooks.unset(entry, MARKED);
        assert!(!hooks.is_set(entry, MARKED));
        let _ = hooks.release(entry);
    }

    #[test]
    fn clear_releases_arena_when_last_reference_drops() {
        let mut hooks = HookList::new();
        let _ = hooks.insert_before(None, 1);
        let entry = hooks.first_valid().unwrap();
        hooks.clear();
        // Still referenced, so the slot is still there.
        assert!(hooks.is_empty());
        assert!(hooks.release(entry));
    }
}
