use std::mem;

use tracing::warn;

use crate::error::Error;

/// How many elements to grow by when none was asked for.
pub const DEFAULT_INCREMENT: usize = 8;

/// A homogeneous, contiguous, growable array.
///
/// Storage grows in blocks of `increment` elements and is never given back
/// when elements are deleted.
///
/// Index misuse is reported as [`Error::OutOfBounds`] instead of panicking.
#[derive(Debug, Clone)]
pub struct DynArray<T> {
    items: Vec<T>,

    // What we have asked the allocator for, in elements.
    // `Vec` may hold more.
    allocated: usize,

    increment: usize,
}

impl<T> Default for DynArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DynArray<T> {
    /// A new array growing by [`DEFAULT_INCREMENT`] elements at a time.
    pub fn new() -> Self {
        Self::with_increment(DEFAULT_INCREMENT)
    }

    /// A new array which grows by `increment` elements at a time.
    /// The first block is allocated up front.
    /// An increment of zero means [`DEFAULT_INCREMENT`].
    pub fn with_increment(increment: usize) -> Self {
        let increment = if increment == 0 {
            DEFAULT_INCREMENT
        } else {
            increment
        };

        Self {
            items: Vec::with_capacity(increment),
            allocated: increment,
            increment,
        }
    }

    /// Number of elements in use.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if no elements are in use.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of elements storage has been allocated for.
    pub fn capacity(&self) -> usize {
        self.allocated
    }

    /// The growth increment, in elements.
    pub fn increment(&self) -> usize {
        self.increment
    }

    /// Make room for `additional` more elements,
    /// adding whole increment blocks until they fit.
    fn reserve(&mut self, additional: usize) -> Result<(), Error> {
        let needed = self.items.len() + additional;
        if needed <= self.allocated {
            return Ok(());
        }

        let mut allocated = self.allocated;
        while allocated < needed {
            allocated += self.increment;
        }

        self.items
            .try_reserve_exact(allocated - self.items.len())
            .map_err(|_| Error::AllocationFailure {
                requested: allocated,
            })?;
        self.allocated = allocated;

        Ok(())
    }

    // `within` allows addressing one past the end, for inserts.
    fn check_bounds(&self, index: usize, within: usize) -> Result<(), Error> {
        if index >= self.items.len() + within {
            warn!(index, len = self.items.len(), "Array bounds error");
            return Err(Error::OutOfBounds {
                index,
                len: self.items.len(),
            });
        }

        Ok(())
    }

    /// Borrow the element at `index`.
    pub fn get(&self, index: usize) -> Result<&T, Error> {
        self.check_bounds(index, 0)?;
        Ok(&self.items[index])
    }

    /// Mutably borrow the element at `index`.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut T, Error> {
        self.check_bounds(index, 0)?;
        Ok(&mut self.items[index])
    }

    /// Overwrite the element at `index`, returning the old one.
    pub fn put(&mut self, element: T, index: usize) -> Result<T, Error> {
        let slot = self.get_mut(index)?;
        Ok(mem::replace(slot, element))
    }

    /// Move `element` into a new slot at the end.
    pub fn append(&mut self, element: T) -> Result<&mut T, Error> {
        self.reserve(1)?;
        self.items.push(element);

        let last = self.items.len() - 1;
        Ok(&mut self.items[last])
    }

    /// Move `element` into a new slot at `at`,
    /// shifting trailing elements to the right.
    /// `at` may be one past the end, which appends.
    pub fn insert(&mut self, element: T, at: usize) -> Result<&mut T, Error> {
        self.check_bounds(at, 1)?;
        self.reserve(1)?;
        self.items.insert(at, element);

        Ok(&mut self.items[at])
    }

    /// Remove the element at `at`, shifting trailing elements to the left.
    /// Returns the new number of elements in use.
    pub fn delete(&mut self, at: usize) -> Result<usize, Error> {
        self.check_bounds(at, 0)?;
        self.items.remove(at);

        Ok(self.items.len())
    }

    /// Find the index of an element by where it lives.
    ///
    /// The reference must point into this array's storage,
    /// an element which merely compares equal is not enough.
    pub fn index_of(&self, element: &T) -> Result<usize, Error> {
        let size = mem::size_of::<T>().max(1);
        let base = self.items.as_ptr() as usize;
        let address = element as *const T as usize;
        let offset = address.wrapping_sub(base);

        if address < base || offset >= self.items.len() * size || offset % size != 0 {
            return Err(Error::OutOfBounds {
                index: offset / size,
                len: self.items.len(),
            });
        }

        Ok(offset / size)
    }

    /// Drop every element, keeping the storage.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// The elements in use.
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// The elements in use, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.items
    }

    /// Iterate over the elements in use.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Iterate mutably over the elements in use.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }
}

impl<T: Default> DynArray<T> {
    /// Create a new default-valued element at the end.
    pub fn new_element(&mut self) -> Result<&mut T, Error> {
        self.append(T::default())
    }

    /// Create a new default-valued element at `index`,
    /// shifting trailing elements to the right.
    pub fn new_element_at(&mut self, index: usize) -> Result<&mut T, Error> {
        self.insert(T::default(), index)
    }
}

impl<T: Copy> DynArray<T> {
    /// Insert a run of elements at `at`, shifting trailing elements right.
    /// Returns how many were inserted.
    pub fn insert_slice(&mut self, at: usize, values: &[T]) -> Result<usize, Error> {
        self.check_bounds(at, 1)?;
        self.reserve(values.len())?;

        self.items.extend_from_slice(values);
        self.items[at..].rotate_right(values.len());

        Ok(values.len())
    }

    /// Remove up to `count` elements from the front,
    /// moving the rest down to index zero.
    /// Returns how many were removed.
    pub fn remove_front(&mut self, count: usize) -> usize {
        let count = count.min(self.items.len());
        self.items.drain(..count);

        count
    }
}

impl<'a, T> IntoIterator for &'a DynArray<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
