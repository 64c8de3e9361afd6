/// Returned by [`Ring::try_push`] when no slot is free; hands the value back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(pub T);

/// Fixed-capacity FIFO
///
/// `start` and `end` only move forward modulo `N`; `len` disambiguates empty from full.
pub struct Ring<T: Copy, const N: usize> {
    slots: [Option<T>; N],
    start: usize,
    end: usize,
    len: usize,
}

impl<T: Copy, const N: usize> Ring<T, N> {
    pub const fn new() -> Self {
        Ring {
            slots: [None; N],
            start: 0,
            end: 0,
            len: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }

    /// Appends `value`, leaving the ring untouched when it is full
    pub fn try_push(&mut self, value: T) -> Result<(), Full<T>> {
        if self.is_full() {
            return Err(Full(value));
        }
        self.slots[self.end] = Some(value);
        self.end = (self.end + 1) % N;
        self.len += 1;
        Ok(())
    }

    pub fn try_pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.slots[self.start].take();
        self.start = (self.start + 1) % N;
        self.len -= 1;
        value
    }

    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            self.slots[self.start].as_ref()
        }
    }

    /// Iterates from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.slots[(self.start + i) % N].as_ref())
    }

    pub fn clear(&mut self) {
        while self.try_pop().is_some() {}
    }
}

impl<T: Copy, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ring_rejects_and_keeps_contents() {
        let mut ring = Ring::<u8, 2>::new();
        ring.try_push(1).unwrap();
        ring.try_push(2).unwrap();
        assert_eq!(ring.try_push(3), Err(Full(3)));
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn indices_wrap() {
        let mut ring = Ring::<u8, 3>::new();
        for i in 0..10 {
            ring.try_push(i).unwrap();
            assert_eq!(ring.try_pop(), Some(i));
        }
        assert!(ring.is_empty());
        assert_eq!(ring.try_pop(), None);
    }
}
