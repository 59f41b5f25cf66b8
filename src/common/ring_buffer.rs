//! Fixed size ring that keeps the most recent N items.
//!
//! Used on both ends to remember the last few audio blocks sent, the newest one
//! rides along with the next packet as forward error correction data.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    next: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> RingBuffer<T> {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        RingBuffer {
            slots,
            next: 0,
            len: 0,
        }
    }
    /// add an item, overwriting the oldest once full.  Returns the item pushed out.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = self.slots[self.next].replace(item);
        self.next = (self.next + 1) % self.slots.len();
        self.len = (self.len + 1).min(self.slots.len());
        evicted
    }
    /// newest item
    pub fn last(&self) -> Option<&T> {
        self.nth_last(0)
    }
    /// 0 is the newest, 1 the one before that...
    pub fn nth_last(&self, n: usize) -> Option<&T> {
        if n >= self.len {
            return None;
        }
        let capacity = self.slots.len();
        let idx = (self.next + capacity - 1 - n) % capacity;
        self.slots[idx].as_ref()
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.next = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod test_ring_buffer {
    use super::*;

    #[test]
    fn empty() {
        let ring: RingBuffer<u32> = RingBuffer::new(4);
        assert!(ring.is_empty());
        assert!(ring.last().is_none());
        assert_eq!(ring.capacity(), 4);
    }
    #[test]
    fn keeps_newest() {
        // It should drop the oldest entries once it wraps
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.last(), Some(&4));
        assert_eq!(ring.nth_last(1), Some(&3));
        assert_eq!(ring.nth_last(2), Some(&2));
        assert_eq!(ring.nth_last(3), None);
        ring.clear();
        assert!(ring.last().is_none());
    }
    #[test]
    fn hands_back_the_oldest() {
        let mut ring = RingBuffer::new(2);
        assert_eq!(ring.push("a"), None);
        assert_eq!(ring.push("b"), None);
        assert_eq!(ring.push("c"), Some("a"));
        assert_eq!(ring.push("d"), Some("b"));
    }
}
