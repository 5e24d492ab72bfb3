//! Splitting change sets into size-bounded parts and putting them back
//! together.
//!
//! `split` preserves the builder's ordering exactly: rows are packed
//! greedily, a part is cut only when adding the next row would overflow the
//! size bound, so a table's contiguous run never spans more parts than
//! needed. `reassemble` is the inverse and fails loudly on missing,
//! duplicated, or inconsistent parts.

use crate::part::{BatchPart, PartPayload};
use rowsync_core::{ChangeSet, RowChange, SyncError, SyncResult};
use tracing::debug;
use uuid::Uuid;

fn serialized_size(row: &RowChange) -> SyncResult<usize> {
    serde_json::to_vec(row)
        .map(|v| v.len())
        .map_err(|e| SyncError::Payload(format!("sizing row: {e}")))
}

/// Slice `change_set` into parts whose serialized payloads stay under
/// `max_part_size_bytes`. A single row larger than the bound still gets a
/// part of its own; an empty change set yields exactly one empty last part
/// so the receiver always sees `is_last`.
pub fn split(change_set: &ChangeSet, max_part_size_bytes: usize) -> SyncResult<Vec<BatchPart>> {
    let batch_id = Uuid::new_v4();

    let mut groups: Vec<Vec<RowChange>> = Vec::new();
    let mut current: Vec<RowChange> = Vec::new();
    let mut current_size = 0usize;

    for row in &change_set.rows {
        let row_size = serialized_size(row)?;
        if !current.is_empty() && current_size + row_size > max_part_size_bytes {
            groups.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += row_size;
        current.push(row.clone());
    }
    if !current.is_empty() || groups.is_empty() {
        groups.push(current);
    }

    let part_count = groups.len() as u32;
    let mut parts = Vec::with_capacity(groups.len());
    for (index, rows) in groups.into_iter().enumerate() {
        let payload = PartPayload::new(change_set.scope.clone(), rows).to_bytes()?;
        parts.push(BatchPart {
            batch_id,
            part_index: index as u32,
            part_count,
            is_last: index as u32 == part_count - 1,
            payload,
        });
    }

    debug!(
        batch_id = %batch_id,
        scope = %change_set.scope,
        rows = change_set.rows.len(),
        parts = parts.len(),
        "split change set"
    );
    Ok(parts)
}

/// Reconstruct the originating change set from a complete set of parts.
///
/// Any missing index in `[0, part_count)` is an `IncompleteBatch` carrying
/// the missing indexes; duplicates and cross-batch mixtures are malformed.
pub fn reassemble(parts: &[BatchPart]) -> SyncResult<ChangeSet> {
    let first = parts
        .first()
        .ok_or_else(|| SyncError::Payload("reassemble called with no parts".into()))?;
    let batch_id = first.batch_id;
    let part_count = first.part_count;

    let mut slots: Vec<Option<&BatchPart>> = vec![None; part_count as usize];
    for part in parts {
        if part.batch_id != batch_id {
            return Err(SyncError::Payload(format!(
                "part {} belongs to batch {}, expected {batch_id}",
                part.part_index, part.batch_id
            )));
        }
        if part.part_count != part_count {
            return Err(SyncError::Payload(format!(
                "part {} disagrees on part count ({} vs {part_count})",
                part.part_index, part.part_count
            )));
        }
        let slot = slots
            .get_mut(part.part_index as usize)
            .ok_or_else(|| SyncError::Payload(format!("part index {} out of range", part.part_index)))?;
        if slot.is_some() {
            return Err(SyncError::Payload(format!(
                "duplicate part index {}",
                part.part_index
            )));
        }
        *slot = Some(part);
    }

    let missing: Vec<u32> = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_none())
        .map(|(i, _)| i as u32)
        .collect();
    if !missing.is_empty() {
        return Err(SyncError::IncompleteBatch { batch_id, missing });
    }

    let mut scope = None;
    let mut rows = Vec::new();
    for (index, part) in slots.into_iter().flatten().enumerate() {
        if part.is_last != (index as u32 == part_count - 1) {
            return Err(SyncError::Payload(format!(
                "part {index} carries a wrong is_last flag"
            )));
        }
        let payload = PartPayload::from_bytes(&part.payload)?;
        match &scope {
            None => scope = Some(payload.scope),
            Some(s) if *s != payload.scope => {
                return Err(SyncError::Payload(format!(
                    "part {index} is for scope '{}', expected '{s}'",
                    payload.scope
                )))
            }
            Some(_) => {}
        }
        rows.extend(payload.rows);
    }

    Ok(ChangeSet::new(scope.unwrap_or_default(), rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rowsync_core::{RowKey, RowOp, Value, Watermark};

    fn sample_rows(n: usize) -> Vec<RowChange> {
        (0..n)
            .map(|i| {
                if i % 4 == 3 {
                    RowChange::delete("item", RowKey::single(i as i64), Watermark(100 + i as u64))
                } else {
                    RowChange::upsert(
                        "item",
                        RowKey::single(i as i64),
                        vec![Value::Integer(i as i64), format!("row-{i}").into()],
                        Watermark(100 + i as u64),
                    )
                }
            })
            .collect()
    }

    #[test]
    fn empty_change_set_yields_single_last_part() {
        let parts = split(&ChangeSet::new("default", vec![]), 1024).unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_last);
        assert!(parts[0].rows().unwrap().is_empty());
    }

    #[test]
    fn roundtrip_preserves_order() {
        let cs = ChangeSet::new("default", sample_rows(20));
        let parts = split(&cs, 256).unwrap();
        assert!(parts.len() > 1, "expected multiple parts");
        assert_eq!(reassemble(&parts).unwrap(), cs);
    }

    #[test]
    fn oversized_row_gets_own_part() {
        let big = RowChange::upsert(
            "item",
            RowKey::single(1i64),
            vec![1i64.into(), "x".repeat(4096).into()],
            Watermark(1),
        );
        let small = RowChange::delete("item", RowKey::single(2i64), Watermark(2));
        let cs = ChangeSet::new("default", vec![big, small]);
        let parts = split(&cs, 64).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(reassemble(&parts).unwrap(), cs);
    }

    #[test]
    fn missing_part_is_incomplete_batch() {
        let cs = ChangeSet::new("default", sample_rows(20));
        let mut parts = split(&cs, 256).unwrap();
        let dropped = parts.remove(1);
        match reassemble(&parts).unwrap_err() {
            SyncError::IncompleteBatch { missing, .. } => {
                assert_eq!(missing, vec![dropped.part_index]);
            }
            other => panic!("expected IncompleteBatch, got {other}"),
        }
    }

    #[test]
    fn duplicate_part_is_rejected() {
        let cs = ChangeSet::new("default", sample_rows(8));
        let mut parts = split(&cs, 128).unwrap();
        parts.push(parts[0].clone());
        assert!(matches!(
            reassemble(&parts).unwrap_err(),
            SyncError::Payload(_)
        ));
    }

    #[test]
    fn foreign_part_is_rejected() {
        let a = split(&ChangeSet::new("default", sample_rows(4)), 64).unwrap();
        let b = split(&ChangeSet::new("default", sample_rows(4)), 64).unwrap();
        let mut mixed = a.clone();
        mixed[0] = b[0].clone();
        assert!(matches!(
            reassemble(&mixed).unwrap_err(),
            SyncError::Payload(_)
        ));
    }

    proptest! {
        /// Round-trip holds for any part size at least one row's size.
        #[test]
        fn split_reassemble_roundtrip(n in 0usize..40, max_size in 64usize..2048) {
            let cs = ChangeSet::new("default", sample_rows(n));
            let parts = split(&cs, max_size).unwrap();
            prop_assert!(!parts.is_empty());
            let back = reassemble(&parts).unwrap();
            prop_assert_eq!(back, cs);
        }

        /// Part indexes are contiguous, counts agree, only the final part is
        /// marked last.
        #[test]
        fn part_metadata_is_consistent(n in 0usize..40, max_size in 64usize..2048) {
            let cs = ChangeSet::new("default", sample_rows(n));
            let parts = split(&cs, max_size).unwrap();
            let count = parts.len() as u32;
            for (i, part) in parts.iter().enumerate() {
                prop_assert_eq!(part.part_index, i as u32);
                prop_assert_eq!(part.part_count, count);
                prop_assert_eq!(part.is_last, i as u32 == count - 1);
            }
        }

        /// No part except a single-row overflow exceeds the size bound.
        #[test]
        fn parts_respect_size_bound(n in 1usize..40, max_size in 128usize..2048) {
            let cs = ChangeSet::new("default", sample_rows(n));
            for part in split(&cs, max_size).unwrap() {
                let rows = part.rows().unwrap();
                if rows.len() > 1 {
                    let total: usize = rows
                        .iter()
                        .map(|r| serde_json::to_vec(r).unwrap().len())
                        .sum();
                    prop_assert!(total <= max_size);
                }
            }
        }

        /// RowOp mix never changes across the round-trip.
        #[test]
        fn ops_survive_roundtrip(n in 0usize..40) {
            let cs = ChangeSet::new("default", sample_rows(n));
            let parts = split(&cs, 200).unwrap();
            let back = reassemble(&parts).unwrap();
            let deletes = |c: &ChangeSet| c.rows.iter().filter(|r| r.op == RowOp::Delete).count();
            prop_assert_eq!(deletes(&back), deletes(&cs));
        }
    }
}
