#![allow(missing_docs)]

use quire::{ArrayOptions, QuireError, Result, SegArray};

/// 4 elements of u64 per segment.
fn small_options() -> ArrayOptions {
    ArrayOptions::new().segment_bytes(32)
}

fn array_of(values: &[u64]) -> Result<SegArray<u64>> {
    let array = SegArray::new(small_options())?;
    for &v in values {
        array.push(v)?;
    }
    Ok(array)
}

fn contents(array: &SegArray<u64>) -> Vec<u64> {
    let mut out = vec![0u64; array.len()];
    array.read_into(0, &mut out).unwrap();
    out
}

/// Walks the directory and checks the contiguity and size invariants.
fn assert_invariants(array: &SegArray<u64>) {
    let mut running = 0;
    for ordinal in 0..array.segment_count() {
        let info = array.segment_info(ordinal).unwrap();
        assert_eq!(
            info.first_index, running,
            "segment {ordinal} breaks contiguity"
        );
        assert!(info.used_count > 0, "segment {ordinal} left empty");
        running += info.used_count;
    }
    assert_eq!(running, array.len(), "segment occupancy disagrees with len");
}

#[test]
fn sequential_append_fills_segments_in_order() -> Result<()> {
    let array = array_of(&(0..10).collect::<Vec<_>>())?;
    assert_eq!(array.segment_capacity(), 4);
    assert_eq!(array.len(), 10);
    assert_eq!(array.segment_count(), 3);
    for (ordinal, (first, count)) in [(0, 4), (4, 4), (8, 2)].iter().enumerate() {
        let info = array.segment_info(ordinal)?;
        assert_eq!(info.first_index, *first);
        assert_eq!(info.used_count, *count);
    }
    assert_eq!(contents(&array), (0..10).collect::<Vec<_>>());
    assert_invariants(&array);
    Ok(())
}

#[test]
fn delete_across_segment_boundaries() -> Result<()> {
    let array = array_of(&(0..10).collect::<Vec<_>>())?;
    // Removes indices 2..7; the middle segment is wholly consumed.
    array.remove(2, 5)?;
    assert_eq!(array.len(), 5);
    assert_eq!(contents(&array), vec![0, 1, 7, 8, 9]);
    assert_invariants(&array);
    Ok(())
}

#[test]
fn insert_then_delete_restores_surrounding_elements() -> Result<()> {
    let original: Vec<u64> = (100..120).collect();
    let array = array_of(&original)?;
    for &(index, n) in &[(0usize, 3usize), (7, 2), (11, 6), (20, 1)] {
        array.insert(index, n)?;
        assert_eq!(array.len(), original.len() + n);
        array.remove(index, n)?;
        assert_eq!(array.len(), original.len());
        assert_eq!(contents(&array), original, "insert({index},{n}) not undone");
        assert_invariants(&array);
    }
    Ok(())
}

#[test]
fn insert_spills_into_neighbor_free_space() -> Result<()> {
    // Segments {4, 4, 2}: the middle segment is full, the last has room.
    let array = array_of(&(0..10).collect::<Vec<_>>())?;
    let before_segments = array.segment_count();
    array.insert(6, 2)?;
    assert_eq!(array.len(), 12);
    // The insert fits by redistributing into the following segment, without
    // allocating a new one.
    assert_eq!(array.segment_count(), before_segments);
    let expect = vec![0, 1, 2, 3, 4, 5, 0, 0, 6, 7, 8, 9];
    assert_eq!(contents(&array), expect);
    assert_invariants(&array);
    Ok(())
}

#[test]
fn large_insert_splits_into_new_segments() -> Result<()> {
    let array = array_of(&(0..12).collect::<Vec<_>>())?;
    let before_segments = array.segment_count();
    array.insert(5, 9)?;
    assert_eq!(array.len(), 21);
    assert!(array.segment_count() > before_segments);
    let mut expect: Vec<u64> = (0..5).collect();
    expect.extend(std::iter::repeat(0).take(9));
    expect.extend(5..12);
    assert_eq!(contents(&array), expect);
    assert_invariants(&array);
    Ok(())
}

#[test]
fn insert_past_end_extends_with_defaults() -> Result<()> {
    let array = array_of(&[1, 2, 3])?;
    array.insert(7, 2)?;
    assert_eq!(array.len(), 9);
    assert_eq!(contents(&array), vec![1, 2, 3, 0, 0, 0, 0, 0, 0]);
    assert_invariants(&array);
    Ok(())
}

#[test]
fn deleting_the_head_reanchors_at_zero() -> Result<()> {
    let array = array_of(&(0..10).collect::<Vec<_>>())?;
    array.remove(0, 4)?;
    assert_eq!(array.segment_info(0)?.first_index, 0);
    assert_eq!(contents(&array), (4..10).collect::<Vec<_>>());
    assert_invariants(&array);
    Ok(())
}

#[test]
fn deleting_everything_leaves_an_empty_array() -> Result<()> {
    let array = array_of(&(0..10).collect::<Vec<_>>())?;
    array.remove(0, 10)?;
    assert_eq!(array.len(), 0);
    assert!(array.is_empty());
    assert_eq!(array.segment_count(), 0);
    // The array is still usable afterwards.
    array.push(42)?;
    assert_eq!(contents(&array), vec![42]);
    Ok(())
}

#[test]
fn out_of_range_access_is_rejected() -> Result<()> {
    let array = array_of(&[1, 2, 3])?;
    assert!(matches!(
        array.get(3).unwrap_err(),
        QuireError::OutOfRange { index: 3, len: 3 }
    ));
    assert!(matches!(
        array.remove(1, 5).unwrap_err(),
        QuireError::OutOfRange { .. }
    ));
    Ok(())
}

#[test]
fn layout_changes_are_rejected_once_populated() -> Result<()> {
    let array = array_of(&[1])?;
    assert!(matches!(
        array.set_segment_bytes(64).unwrap_err(),
        QuireError::LayoutFrozen
    ));
    assert!(matches!(
        array.set_tail_count(2).unwrap_err(),
        QuireError::LayoutFrozen
    ));
    Ok(())
}

#[test]
fn tail_slots_follow_their_elements() -> Result<()> {
    let array: SegArray<u64, u32> =
        SegArray::new(ArrayOptions::new().segment_bytes(64).tail_count(2))?;
    for i in 0..10u64 {
        let at = array.push(i)?;
        array.set_tail(at, 0, (i * 10) as u32)?;
        array.set_tail(at, 1, (i * 10 + 1) as u32)?;
    }
    array.insert(4, 3)?;
    assert_eq!(*array.tail(8, 0)?, 50);
    assert_eq!(*array.tail(8, 1)?, 51);
    assert_eq!(*array.tail(4, 0)?, 0);
    array.remove(4, 3)?;
    for i in 0..10 {
        assert_eq!(*array.tail(i as usize, 0)?, (i * 10) as u32);
    }
    assert!(matches!(
        array.tail(0, 2).unwrap_err(),
        QuireError::InvalidArgument(_)
    ));
    Ok(())
}

#[test]
fn centered_segments_accept_appends() -> Result<()> {
    // Without the sequential-insert hint free space is split around the
    // middle; appends must still fill segments completely.
    let array: SegArray<u64> = SegArray::new(small_options().sequential_insert(false))?;
    for i in 0..9 {
        array.push(i)?;
    }
    assert_eq!(array.len(), 9);
    assert_eq!(contents(&array), (0..9).collect::<Vec<_>>());
    assert_invariants(&array);
    Ok(())
}
