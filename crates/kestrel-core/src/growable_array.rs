//! Header-prefixed growable array.
//!
//! A [`GrowableArray`] stores its bookkeeping header (capacity, length, element
//! stride, allocation tag) in the same heap block as its elements, directly in
//! front of them. Growth reallocates the whole block to `(capacity + 1) * 2`
//! elements, which may move it.
//!
//! The array is an owning value: every operation that can reallocate takes
//! `&mut self`, and element access goes through borrows of the array itself, so
//! no reference into the old block can outlive a growth.

use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use crate::error::{Error, Result};
use crate::memory::{MemoryTag, MemoryTracker};

#[repr(C)]
struct Header {
    capacity: usize,
    length: usize,
    stride: usize,
    tag: MemoryTag,
    tracker: &'static MemoryTracker,
}

/// Growable, header-prefixed sequence.
pub struct GrowableArray<T> {
    block: NonNull<Header>,
    _marker: PhantomData<T>,
}

// SAFETY: the array uniquely owns its block; sharing follows `T`.
unsafe impl<T: Send> Send for GrowableArray<T> {}
// SAFETY: shared access only hands out `&T`.
unsafe impl<T: Sync> Sync for GrowableArray<T> {}

impl<T> GrowableArray<T> {
    /// Create an empty array attributed to `tag`.
    pub fn new(tag: MemoryTag) -> Self {
        Self::with_capacity(0, tag)
    }

    /// Create an empty array with room for `capacity` elements.
    pub fn with_capacity(capacity: usize, tag: MemoryTag) -> Self {
        Self::with_capacity_in(capacity, tag, MemoryTracker::global())
    }

    /// Create an empty array whose block is accounted in `tracker`.
    pub fn with_capacity_in(
        capacity: usize,
        tag: MemoryTag,
        tracker: &'static MemoryTracker,
    ) -> Self {
        let (layout, _) = Self::layout(capacity);
        // SAFETY: the layout always contains the header, so its size is non-zero.
        let raw = unsafe { alloc::alloc(layout) };
        let Some(block) = NonNull::new(raw.cast::<Header>()) else {
            alloc::handle_alloc_error(layout)
        };

        // SAFETY: `block` is freshly allocated and sized for a header.
        unsafe {
            block.as_ptr().write(Header {
                capacity,
                length: 0,
                stride: std::mem::size_of::<T>(),
                tag,
                tracker,
            });
        }
        tracker.record_alloc(tag, layout.size() as u64);

        Self {
            block,
            _marker: PhantomData,
        }
    }

    /// Create an array holding clones of `items`.
    pub fn from_slice(items: &[T], tag: MemoryTag) -> Self
    where
        T: Clone,
    {
        let mut array = Self::with_capacity(items.len(), tag);
        for item in items {
            array.push(item.clone());
        }
        array
    }

    fn layout(capacity: usize) -> (Layout, usize) {
        let elements = Layout::array::<T>(capacity).expect("growable array capacity overflow");
        let (layout, offset) = Layout::new::<Header>()
            .extend(elements)
            .expect("growable array capacity overflow");
        (layout.pad_to_align(), offset)
    }

    fn header(&self) -> &Header {
        // SAFETY: the block always starts with an initialised header.
        unsafe { self.block.as_ref() }
    }

    fn header_mut(&mut self) -> &mut Header {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { self.block.as_mut() }
    }

    fn elements(&self) -> *mut T {
        let (_, offset) = Self::layout(0);
        // SAFETY: the element offset lies within the allocated block.
        unsafe { self.block.as_ptr().cast::<u8>().add(offset).cast::<T>() }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.header().length
    }

    /// Whether the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements the current block can hold.
    pub fn capacity(&self) -> usize {
        self.header().capacity
    }

    /// Size in bytes of one element.
    pub fn stride(&self) -> usize {
        self.header().stride
    }

    /// Allocation tag of the block.
    pub fn tag(&self) -> MemoryTag {
        self.header().tag
    }

    fn reallocate(&mut self, new_capacity: usize) {
        let old_capacity = self.capacity();
        let (old_layout, _) = Self::layout(old_capacity);
        let (new_layout, _) = Self::layout(new_capacity);

        // SAFETY: `block` was allocated with `old_layout`; alignment is unchanged.
        let raw = unsafe {
            alloc::realloc(
                self.block.as_ptr().cast::<u8>(),
                old_layout,
                new_layout.size(),
            )
        };
        let Some(block) = NonNull::new(raw.cast::<Header>()) else {
            alloc::handle_alloc_error(new_layout)
        };
        self.block = block;

        let header = self.header_mut();
        header.capacity = new_capacity;
        let (tag, tracker) = (header.tag, header.tracker);
        tracker.record_realloc(tag, old_layout.size() as u64, new_layout.size() as u64);
    }

    fn grow(&mut self) {
        let new_capacity = (self.capacity() + 1) * 2;
        tracing::trace!(
            from = self.capacity(),
            to = new_capacity,
            "growable array reallocating"
        );
        self.reallocate(new_capacity);
    }

    /// Ensure room for at least `capacity` elements.
    pub fn reserve(&mut self, capacity: usize) {
        if capacity > self.capacity() {
            self.reallocate(capacity);
        }
    }

    /// Append an element, growing the block when full.
    pub fn push(&mut self, value: T) {
        if self.len() == self.capacity() {
            self.grow();
        }
        let len = self.len();
        // SAFETY: `len < capacity` after the growth check.
        unsafe { self.elements().add(len).write(value) };
        self.header_mut().length = len + 1;
    }

    /// Remove and return the last element.
    ///
    /// # Panics
    /// Popping an empty array is a precondition violation.
    pub fn pop(&mut self) -> T {
        match self.try_pop() {
            Some(value) => value,
            None => panic!("pop on an empty GrowableArray"),
        }
    }

    /// Remove and return the last element, if any.
    pub fn try_pop(&mut self) -> Option<T> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        self.header_mut().length = len - 1;
        // SAFETY: slot `len - 1` was initialised and is now outside the live range.
        Some(unsafe { self.elements().add(len - 1).read() })
    }

    /// Insert `value` at `index`, shifting the tail up by one.
    ///
    /// An index past the end is reported and leaves the array unchanged.
    pub fn insert(&mut self, index: usize, value: T) -> Result<()> {
        let len = self.len();
        if index > len {
            tracing::warn!(index, length = len, "growable array insert out of range");
            return Err(Error::IndexOutOfRange { index, length: len });
        }
        if len == self.capacity() {
            self.grow();
        }
        let base = self.elements();
        // SAFETY: the tail `[index, len)` moves within capacity; `copy` handles overlap.
        unsafe {
            ptr::copy(base.add(index), base.add(index + 1), len - index);
            base.add(index).write(value);
        }
        self.header_mut().length = len + 1;
        Ok(())
    }

    /// Remove the element at `index`, shifting the tail down by one.
    pub fn remove(&mut self, index: usize) -> Result<T> {
        let len = self.len();
        if index >= len {
            tracing::warn!(index, length = len, "growable array remove out of range");
            return Err(Error::IndexOutOfRange { index, length: len });
        }
        let base = self.elements();
        // SAFETY: `index` is live; the tail moves down over the vacated slot.
        let value = unsafe {
            let value = base.add(index).read();
            ptr::copy(base.add(index + 1), base.add(index), len - index - 1);
            value
        };
        self.header_mut().length = len - 1;
        Ok(value)
    }

    /// Remove the element at `index`, replacing it with the last element.
    pub fn swap_remove(&mut self, index: usize) -> Result<T> {
        let len = self.len();
        if index >= len {
            return Err(Error::IndexOutOfRange { index, length: len });
        }
        self.as_mut_slice().swap(index, len - 1);
        Ok(self.pop())
    }

    /// Resize to `new_len`, filling new slots with clones of `value`.
    pub fn resize(&mut self, new_len: usize, value: T)
    where
        T: Clone,
    {
        self.resize_with(new_len, || value.clone());
    }

    /// Resize to `new_len`, filling new slots from `f`.
    pub fn resize_with(&mut self, new_len: usize, mut f: impl FnMut() -> T) {
        if new_len <= self.len() {
            self.truncate(new_len);
            return;
        }
        self.reserve(new_len);
        while self.len() < new_len {
            self.push(f());
        }
    }

    /// Drop every element past `len`.
    pub fn truncate(&mut self, len: usize) {
        let old_len = self.len();
        if len >= old_len {
            return;
        }
        self.header_mut().length = len;
        // SAFETY: `[len, old_len)` was live and is no longer reachable.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                self.elements().add(len),
                old_len - len,
            ));
        }
    }

    /// Drop every element, keeping the block.
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// View the elements as a slice.
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: `[0, len)` is initialised.
        unsafe { std::slice::from_raw_parts(self.elements(), self.len()) }
    }

    /// View the elements as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: `[0, len)` is initialised and borrowed exclusively.
        unsafe { std::slice::from_raw_parts_mut(self.elements(), self.len()) }
    }
}

impl<T> Drop for GrowableArray<T> {
    fn drop(&mut self) {
        self.clear();
        let (layout, _) = Self::layout(self.capacity());
        let (tag, tracker) = (self.header().tag, self.header().tracker);
        // SAFETY: the block was allocated with this layout and is not used again.
        unsafe { alloc::dealloc(self.block.as_ptr().cast::<u8>(), layout) };
        tracker.record_free(tag, layout.size() as u64);
    }
}

impl<T> Deref for GrowableArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> DerefMut for GrowableArray<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: Clone> Clone for GrowableArray<T> {
    fn clone(&self) -> Self {
        let mut array =
            Self::with_capacity_in(self.len(), self.header().tag, self.header().tracker);
        for item in self.iter() {
            array.push(item.clone());
        }
        array
    }
}

impl<T: fmt::Debug> fmt::Debug for GrowableArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T> Default for GrowableArray<T> {
    fn default() -> Self {
        Self::new(MemoryTag::Array)
    }
}

impl<T> Extend<T> for GrowableArray<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.push(item);
        }
    }
}

impl<T> FromIterator<T> for GrowableArray<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut array = Self::default();
        array.extend(iter);
        array
    }
}

impl<'a, T> IntoIterator for &'a GrowableArray<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
