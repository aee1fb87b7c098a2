//! Recent peripheral output kept for polling clients

/// Bounded buffer of the most recent inbound bytes
///
/// When an append does not fit, the buffer restarts with the new chunk
/// (truncated to capacity) rather than shifting old data out.
#[derive(Debug)]
pub struct Backlog {
    data: Vec<u8>,
    capacity: usize,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.data.len() + chunk.len() > self.capacity {
            self.data.clear();
        }
        let take = chunk.len().min(self.capacity);
        self.data.extend_from_slice(&chunk[..take]);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
