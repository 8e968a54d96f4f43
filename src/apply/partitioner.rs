use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use mongodb::bson::Bson;

use crate::error::Result;
use crate::oplog::{OpQueue, OpType};
use crate::storage::{CollectionProperties, EngineCapabilities, StorageInterface};

/// Per-batch cache of the collection properties that drive partitioning, so
/// they are not fetched repeatedly for each op. Single-threaded: only the
/// partitioner touches it.
pub struct CachedCollectionProperties<'a> {
    storage: &'a dyn StorageInterface,
    cache: HashMap<String, CollectionProperties>,
}

impl<'a> CachedCollectionProperties<'a> {
    pub fn new(storage: &'a dyn StorageInterface) -> Self {
        Self {
            storage,
            cache: HashMap::new(),
        }
    }

    pub async fn get(&mut self, ns: &str) -> Result<CollectionProperties> {
        if let Some(props) = self.cache.get(ns) {
            return Ok(props.clone());
        }
        let props = self
            .storage
            .get_collection_properties(ns)
            .await?
            .unwrap_or_default();
        self.cache.insert(ns.to_string(), props.clone());
        Ok(props)
    }
}

fn hash_namespace(ns: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    ns.hash(&mut hasher);
    hasher.finish() as u32
}

fn hash_document_id(id: &Bson, hasher: &mut DefaultHasher) {
    match id {
        // Numeric ids hash by value so equal numbers of different BSON
        // widths land in the same slot.
        Bson::Int32(v) => (*v as i64).hash(hasher),
        Bson::Int64(v) => v.hash(hasher),
        Bson::Double(v) if v.fract() == 0.0 => (*v as i64).hash(hasher),
        Bson::Double(v) => v.to_bits().hash(hasher),
        Bson::String(s) => s.hash(hasher),
        Bson::ObjectId(oid) => oid.bytes().hash(hasher),
        Bson::Boolean(b) => b.hash(hasher),
        other => other.to_string().hash(hasher),
    }
}

fn mix_id_hash(ns_hash: u32, id: &Bson) -> u32 {
    let mut hasher = DefaultHasher::new();
    ns_hash.hash(&mut hasher);
    hash_document_id(id, &mut hasher);
    hasher.finish() as u32
}

/// Assign each op in the batch to one of `num_writers` slots.
///
/// Ops on the same document go to the same slot when id hashing is safe;
/// ops on capped or collation-restricted collections stay together per
/// namespace so their insertion order is preserved. Capped-collection
/// inserts are flagged so workers never bulk-insert them.
pub async fn fill_writer_vectors(
    batch: &OpQueue,
    num_writers: usize,
    engine: EngineCapabilities,
    storage: &dyn StorageInterface,
) -> Result<Vec<Vec<usize>>> {
    let mut writer_vectors: Vec<Vec<usize>> = vec![Vec::new(); num_writers];
    let mut properties = CachedCollectionProperties::new(storage);

    for (index, op) in batch.entries().iter().enumerate() {
        let mut hash = hash_namespace(&op.ns);

        if op.is_crud() {
            let props = properties.get(&op.ns).await?;

            // Mixing in the document id buys parallelism inside a single
            // collection, but only when the engine locks per document, the
            // collection is not capped (insertion order must hold), and the
            // default collation is simple (id hashing is not
            // collation-aware).
            if engine.supports_doc_locking && !props.is_capped && props.collation.is_none() {
                if let Some(id) = op.id_for_partition() {
                    hash = mix_id_hash(hash, id);
                }
            }

            if op.op_type == OpType::Insert && props.is_capped {
                // Flag before any worker sees the op so it is never
                // bulk-inserted.
                op.mark_for_capped_collection();
            }
        }

        let writer = &mut writer_vectors[hash as usize % num_writers];
        if writer.is_empty() {
            writer.reserve(8); // skip a few growth rounds
        }
        writer.push(index);
    }

    Ok(writer_vectors)
}

#[cfg(test)]
mod tests {
    use mongodb::bson::{doc, Timestamp};

    use super::*;
    use crate::oplog::OpQueue;
    use crate::testing::MemStorage;

    fn push_insert(batch: &mut OpQueue, ns: &str, id: i32) {
        batch.push(doc! {
            "ts": Timestamp { time: id as u32 + 1, increment: 0 },
            "v": 2_i64,
            "op": "i",
            "ns": ns,
            "o": { "_id": id },
        });
    }

    fn push_update(batch: &mut OpQueue, ns: &str, id: i32) {
        batch.push(doc! {
            "ts": Timestamp { time: id as u32 + 1, increment: 1 },
            "v": 2_i64,
            "op": "u",
            "ns": ns,
            "o2": { "_id": id },
            "o": { "x": 1 },
        });
    }

    fn slot_of(vectors: &[Vec<usize>], index: usize) -> usize {
        vectors
            .iter()
            .position(|slot| slot.contains(&index))
            .expect("op was not assigned")
    }

    #[tokio::test]
    async fn same_document_lands_in_same_slot() {
        let storage = MemStorage::new();
        let mut batch = OpQueue::new();
        push_insert(&mut batch, "db.c", 7);
        push_update(&mut batch, "db.c", 7);

        for doc_locking in [true, false] {
            let engine = EngineCapabilities {
                supports_doc_locking: doc_locking,
                ..EngineCapabilities::default()
            };
            let vectors = fill_writer_vectors(&batch, 8, engine, &storage)
                .await
                .unwrap();
            assert_eq!(slot_of(&vectors, 0), slot_of(&vectors, 1));
        }
    }

    #[tokio::test]
    async fn capped_collection_ops_stay_together_and_are_flagged() {
        let storage = MemStorage::new();
        storage.set_capped("db.cap");

        let mut batch = OpQueue::new();
        for id in 0..1000 {
            push_insert(&mut batch, "db.cap", id);
        }
        for id in 0..1000 {
            push_insert(&mut batch, "db.nc", id + 1000);
        }

        let vectors = fill_writer_vectors(&batch, 4, EngineCapabilities::default(), &storage)
            .await
            .unwrap();

        // All capped-collection ops land in exactly one slot, in order.
        let capped_slot = slot_of(&vectors, 0);
        let capped_ops: Vec<usize> = vectors[capped_slot]
            .iter()
            .copied()
            .filter(|&i| i < 1000)
            .collect();
        assert_eq!(capped_ops, (0..1000).collect::<Vec<_>>());
        for slot in 0..4 {
            if slot != capped_slot {
                assert!(vectors[slot].iter().all(|&i| i >= 1000));
            }
        }

        // Distinct-id ops on the non-capped collection spread out.
        let mut populated = 0;
        for slot in &vectors {
            if slot.iter().any(|&i| i >= 1000) {
                populated += 1;
            }
        }
        assert_eq!(populated, 4);

        for entry in &batch.entries()[..1000] {
            assert!(entry.is_for_capped_collection());
        }
        for entry in &batch.entries()[1000..] {
            assert!(!entry.is_for_capped_collection());
        }
    }

    #[tokio::test]
    async fn non_simple_collation_restricts_to_namespace_hashing() {
        let storage = MemStorage::new();
        storage.set_collation("db.collated", "fr");

        let mut batch = OpQueue::new();
        for id in 0..64 {
            push_insert(&mut batch, "db.collated", id);
        }

        let vectors = fill_writer_vectors(&batch, 8, EngineCapabilities::default(), &storage)
            .await
            .unwrap();
        let occupied: Vec<&Vec<usize>> = vectors.iter().filter(|s| !s.is_empty()).collect();
        assert_eq!(occupied.len(), 1);
        assert_eq!(occupied[0].len(), 64);
    }

    #[tokio::test]
    async fn numeric_ids_hash_by_value() {
        let storage = MemStorage::new();
        let mut batch = OpQueue::new();
        push_insert(&mut batch, "db.c", 5);
        batch.push(doc! {
            "ts": Timestamp { time: 99, increment: 0 },
            "v": 2_i64,
            "op": "d",
            "ns": "db.c",
            "o": { "_id": 5_i64 },
        });

        let vectors = fill_writer_vectors(&batch, 16, EngineCapabilities::default(), &storage)
            .await
            .unwrap();
        assert_eq!(slot_of(&vectors, 0), slot_of(&vectors, 1));
    }
}
