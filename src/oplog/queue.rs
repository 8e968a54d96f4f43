use mongodb::bson::Document;

use super::entry::OplogEntry;

/// One batch of parsed oplog entries, moved (not copied) from the assembler
/// to the apply loop. Byte and op counts are maintained on push/pop.
#[derive(Debug, Default)]
pub struct OpQueue {
    entries: Vec<OplogEntry>,
    bytes: usize,
    must_shutdown: bool,
}

impl OpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, raw: Document) {
        let entry = OplogEntry::parse(raw);
        self.bytes += entry.byte_size();
        self.entries.push(entry);
    }

    /// Remove and return the most recently pushed entry.
    pub fn pop(&mut self) -> Option<OplogEntry> {
        let entry = self.entries.pop()?;
        self.bytes -= entry.byte_size();
        Some(entry)
    }

    pub fn front(&self) -> Option<&OplogEntry> {
        self.entries.first()
    }

    pub fn back(&self) -> Option<&OplogEntry> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[OplogEntry] {
        &self.entries
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_must_shutdown(&mut self) {
        self.must_shutdown = true;
    }

    pub fn must_shutdown(&self) -> bool {
        self.must_shutdown
    }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::{doc, Timestamp};

    use super::*;

    fn raw_insert(id: i32) -> Document {
        doc! {
            "ts": Timestamp { time: id as u32, increment: 0 },
            "v": 2_i64,
            "op": "i",
            "ns": "db.coll",
            "o": { "_id": id },
        }
    }

    #[test]
    fn counts_track_push_and_pop() {
        let mut queue = OpQueue::new();
        assert!(queue.is_empty());

        queue.push(raw_insert(1));
        queue.push(raw_insert(2));
        assert_eq!(queue.count(), 2);
        let bytes = queue.byte_size();
        assert!(bytes > 0);

        let popped = queue.pop().unwrap();
        assert_eq!(popped.id_for_partition().unwrap().as_i32(), Some(2));
        assert_eq!(queue.count(), 1);
        assert!(queue.byte_size() < bytes);
    }

    #[test]
    fn shutdown_flag_is_sticky() {
        let mut queue = OpQueue::new();
        assert!(!queue.must_shutdown());
        queue.set_must_shutdown();
        assert!(queue.must_shutdown());
    }
}
