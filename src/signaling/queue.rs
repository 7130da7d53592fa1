//! Begrenzte Warteschlange für Frames, die ohne Verbindung gesendet wurden

use std::collections::VecDeque;

/// FIFO mit fester Kapazität; bei Überlauf fällt der älteste Frame heraus
#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Anzahl der bisher verworfenen Frames
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.trim();
    }

    pub fn push(&mut self, frame: String) {
        self.frames.push_back(frame);
        self.trim();
    }

    /// Legt nicht zugestellte Frames wieder an den Anfang (Reihenfolge bleibt)
    pub fn requeue_front(&mut self, frames: Vec<String>) {
        for frame in frames.into_iter().rev() {
            self.frames.push_front(frame);
        }
        self.trim();
    }

    pub fn drain(&mut self) -> impl Iterator<Item = String> + '_ {
        self.frames.drain(..)
    }

    fn trim(&mut self) {
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
            self.dropped += 1;
        }
        if self.dropped > 0 && self.frames.len() == self.capacity {
            tracing::warn!(
                "Outbound queue full ({} frames), {} dropped so far",
                self.capacity,
                self.dropped
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(queue: &mut OutboundQueue) -> Vec<String> {
        queue.drain().collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = OutboundQueue::new(10);
        queue.push("a".into());
        queue.push("b".into());
        queue.push("c".into());
        assert_eq!(frames(&mut queue), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue = OutboundQueue::new(2);
        queue.push("a".into());
        queue.push("b".into());
        queue.push("c".into());
        assert_eq!(queue.dropped(), 1);
        assert_eq!(frames(&mut queue), vec!["b", "c"]);
    }

    #[test]
    fn test_requeue_front_keeps_original_order() {
        let mut queue = OutboundQueue::new(10);
        queue.push("later".into());
        queue.requeue_front(vec!["first".into(), "second".into()]);
        assert_eq!(frames(&mut queue), vec!["first", "second", "later"]);
    }
}
