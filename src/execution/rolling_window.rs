use crate::error::{Error, Result};

/// Fixed-capacity circular buffer of samples
///
/// Once full, every push overwrites the oldest sample. Iteration yields the
/// surviving samples from least recent to most recent.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    items: Vec<T>,
    capacity: usize,
    /// Slot of the most recent write, `None` while empty
    cursor: Option<usize>,
}

impl<T> RollingWindow<T> {
    /// Create an empty window
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "rolling window capacity must be positive");
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
            cursor: None,
        }
    }

    /// Fallible constructor for capacities coming from configuration
    pub fn try_new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config(
                "rolling window capacity must be positive".to_string(),
            ));
        }
        Ok(Self::new(capacity))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.is_none()
    }

    /// Add a sample, overwriting the oldest one when full
    pub fn push(&mut self, value: T) {
        let next = self.cursor.map_or(0, |c| (c + 1) % self.capacity);
        if self.is_full() {
            self.items[next] = value;
        } else {
            self.items.push(value);
        }
        self.cursor = Some(next);
    }

    pub fn most_recent(&self) -> Option<&T> {
        self.cursor.map(|c| &self.items[c])
    }

    pub fn least_recent(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        Some(&self.items[self.oldest_index()])
    }

    fn oldest_index(&self) -> usize {
        match self.cursor {
            Some(c) if self.is_full() => (c + 1) % self.capacity,
            _ => 0,
        }
    }

    /// Iterate from least recent to most recent
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            window: self,
            index: self.oldest_index(),
            remaining: self.len(),
        }
    }
}

impl<'a, T> IntoIterator for &'a RollingWindow<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Chronological iterator over a [`RollingWindow`]
pub struct Iter<'a, T> {
    window: &'a RollingWindow<T>,
    index: usize,
    remaining: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = &self.window.items[self.index];
        self.index = (self.index + 1) % self.window.capacity;
        self.remaining -= 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}
