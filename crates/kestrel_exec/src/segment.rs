//! Storage collaborator interfaces.
//!
//! The engine never owns storage. It leases read-only segments from a
//! `SegmentRegistry`, reads column chunks through `SegmentColumn` handles,
//! and releases every lease exactly once after the run. In-memory
//! implementations ship here for tests and single-process runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use kestrel_common::error::{EngineError, ExecResult};
use kestrel_common::types::{PartitionId, SegmentId};

use crate::column::{ColumnType, Vector};

/// Chunked reader over one stored column. Each handle is an independent
/// cursor; `next_chunk` returns `None` once the column is exhausted.
pub trait SegmentColumn: Send {
    fn col_type(&self) -> ColumnType;
    fn next_chunk(&mut self) -> ExecResult<Option<Vector>>;
}

/// One leased, immutable storage segment.
pub trait Segment: Send + Sync {
    fn id(&self) -> SegmentId;
    fn column_names(&self) -> Vec<String>;
    fn column_type(&self, name: &str) -> Option<ColumnType>;
    /// Open a fresh reader over `name`. `None` if the column does not
    /// exist in this segment.
    fn column(&self, name: &str) -> Option<Box<dyn SegmentColumn>>;
}

impl std::fmt::Debug for dyn Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment").field("id", &self.id()).finish()
    }
}

/// Lease-counting segment lookup.
///
/// `segments` increments the lease count of every returned segment; the
/// caller owes exactly one `release` per returned segment, on every path.
pub trait SegmentRegistry: Send + Sync {
    /// Leased segments of `db.table` restricted to `partitions`. An empty
    /// partition list selects all partitions.
    fn segments(
        &self,
        db: &str,
        table: &str,
        partitions: &[PartitionId],
    ) -> ExecResult<Vec<Arc<dyn Segment>>>;

    fn release(&self, id: SegmentId);
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// One pre-chunked in-memory column.
#[derive(Debug, Clone)]
pub struct MemColumn {
    pub name: String,
    pub col_type: ColumnType,
    pub chunks: Vec<Vector>,
}

impl MemColumn {
    /// Int64-class column from plain values, split into `chunk_rows`
    /// chunks. `chunk_rows == 0` keeps everything in one chunk.
    pub fn int64s(
        name: impl Into<String>,
        col_type: ColumnType,
        values: &[i64],
        chunk_rows: usize,
    ) -> Self {
        let step = if chunk_rows == 0 {
            values.len().max(1)
        } else {
            chunk_rows
        };
        let chunks = values
            .chunks(step)
            .map(|c| Vector::from_i64s(c.to_vec()))
            .collect();
        Self {
            name: name.into(),
            col_type,
            chunks,
        }
    }

    pub fn strings(name: impl Into<String>, values: &[&str], chunk_rows: usize) -> Self {
        let step = if chunk_rows == 0 {
            values.len().max(1)
        } else {
            chunk_rows
        };
        let chunks = values.chunks(step).map(Vector::from_strings).collect();
        Self {
            name: name.into(),
            col_type: ColumnType::String,
            chunks,
        }
    }
}

struct MemColumnReader {
    col_type: ColumnType,
    chunks: VecDeque<Vector>,
}

impl SegmentColumn for MemColumnReader {
    fn col_type(&self) -> ColumnType {
        self.col_type
    }

    fn next_chunk(&mut self) -> ExecResult<Option<Vector>> {
        Ok(self.chunks.pop_front())
    }
}

/// Immutable in-memory segment.
pub struct MemSegment {
    id: SegmentId,
    columns: Vec<MemColumn>,
}

impl MemSegment {
    pub fn new(columns: Vec<MemColumn>) -> Arc<Self> {
        Arc::new(Self {
            id: SegmentId::new(),
            columns,
        })
    }
}

impl Segment for MemSegment {
    fn id(&self) -> SegmentId {
        self.id
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.col_type)
    }

    fn column(&self, name: &str) -> Option<Box<dyn SegmentColumn>> {
        let col = self.columns.iter().find(|c| c.name == name)?;
        Some(Box::new(MemColumnReader {
            col_type: col.col_type,
            chunks: col.chunks.iter().cloned().collect(),
        }))
    }
}

/// In-memory registry with real lease accounting.
#[derive(Default)]
pub struct MemSegmentRegistry {
    tables: Mutex<HashMap<(String, String), Vec<(PartitionId, Arc<MemSegment>)>>>,
    leases: Mutex<HashMap<SegmentId, usize>>,
}

impl MemSegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        db: impl Into<String>,
        table: impl Into<String>,
        partition: PartitionId,
        segment: Arc<MemSegment>,
    ) {
        self.tables
            .lock()
            .entry((db.into(), table.into()))
            .or_default()
            .push((partition, segment));
    }

    /// Current lease count for a segment. Test observability.
    pub fn lease_count(&self, id: SegmentId) -> usize {
        self.leases.lock().get(&id).copied().unwrap_or(0)
    }
}

impl SegmentRegistry for MemSegmentRegistry {
    fn segments(
        &self,
        db: &str,
        table: &str,
        partitions: &[PartitionId],
    ) -> ExecResult<Vec<Arc<dyn Segment>>> {
        let tables = self.tables.lock();
        let entries = tables
            .get(&(db.to_string(), table.to_string()))
            .ok_or_else(|| EngineError::Storage(format!("unknown table {db}.{table}")))?;
        let mut out: Vec<Arc<dyn Segment>> = Vec::new();
        let mut leases = self.leases.lock();
        for (part, seg) in entries {
            if partitions.is_empty() || partitions.contains(part) {
                *leases.entry(seg.id()).or_insert(0) += 1;
                out.push(seg.clone());
            }
        }
        Ok(out)
    }

    fn release(&self, id: SegmentId) {
        let mut leases = self.leases.lock();
        match leases.get_mut(&id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    leases.remove(&id);
                }
            }
            _ => {
                tracing::warn!(segment_id = %id, "release of segment with no outstanding lease");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_one_segment() -> (MemSegmentRegistry, SegmentId) {
        let seg = MemSegment::new(vec![MemColumn::int64s(
            "ts",
            ColumnType::Timestamp,
            &[1, 2, 3, 4, 5],
            2,
        )]);
        let id = seg.id();
        let reg = MemSegmentRegistry::new();
        reg.insert("logs", "events", PartitionId(0), seg);
        (reg, id)
    }

    #[test]
    fn test_lease_acquire_and_release() {
        let (reg, id) = registry_with_one_segment();
        assert_eq!(reg.lease_count(id), 0);
        let segs = reg.segments("logs", "events", &[]).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(reg.lease_count(id), 1);
        reg.release(id);
        assert_eq!(reg.lease_count(id), 0);
    }

    #[test]
    fn test_partition_filter() {
        let seg0 = MemSegment::new(vec![MemColumn::int64s("v", ColumnType::Int64, &[1], 0)]);
        let seg1 = MemSegment::new(vec![MemColumn::int64s("v", ColumnType::Int64, &[2], 0)]);
        let reg = MemSegmentRegistry::new();
        reg.insert("db", "t", PartitionId(0), seg0);
        reg.insert("db", "t", PartitionId(1), seg1.clone());
        let segs = reg.segments("db", "t", &[PartitionId(1)]).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].id(), seg1.id());
    }

    #[test]
    fn test_unknown_table_is_storage_error() {
        let reg = MemSegmentRegistry::new();
        let err = reg.segments("db", "missing", &[]).unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }

    #[test]
    fn test_reader_chunks() {
        let (reg, _) = registry_with_one_segment();
        let segs = reg.segments("logs", "events", &[]).unwrap();
        let mut reader = segs[0].column("ts").unwrap();
        assert_eq!(reader.col_type(), ColumnType::Timestamp);
        let c1 = reader.next_chunk().unwrap().unwrap();
        assert_eq!(c1.len(), 2);
        let c2 = reader.next_chunk().unwrap().unwrap();
        assert_eq!(c2.len(), 2);
        let c3 = reader.next_chunk().unwrap().unwrap();
        assert_eq!(c3.len(), 1);
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_missing_column_is_none() {
        let (reg, _) = registry_with_one_segment();
        let segs = reg.segments("logs", "events", &[]).unwrap();
        assert!(segs[0].column("nope").is_none());
    }
}
