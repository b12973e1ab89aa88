#![allow(missing_docs)]

use quire::{ArrayOptions, MemoryStore, QuireError, Result, SegArray};

/// 4 elements of u64 per segment.
fn small_array(values: std::ops::Range<u64>) -> Result<SegArray<u64>> {
    let array = SegArray::new(ArrayOptions::new().segment_bytes(32))?;
    for v in values {
        array.push(v)?;
    }
    Ok(array)
}

#[test]
fn walks_across_segment_boundaries() -> Result<()> {
    let array = small_array(0..10)?;
    let mut cursor = array.cursor(0)?;
    for expected in 0..10u64 {
        assert!(cursor.is_bound());
        assert_eq!(cursor.index(), expected as usize);
        assert_eq!(cursor.get()?, expected);
        cursor.next()?;
    }
    assert!(cursor.is_past_end());
    assert_eq!(cursor.index(), 10);
    Ok(())
}

#[test]
fn stepping_back_from_past_end_lands_on_the_last_element() -> Result<()> {
    let array = small_array(0..10)?;
    let mut cursor = array.cursor(10)?;
    assert!(cursor.is_past_end());
    cursor.prev()?;
    assert!(cursor.is_bound());
    assert_eq!(cursor.index(), 9);
    assert_eq!(cursor.get()?, 9);
    Ok(())
}

#[test]
fn random_access_seeks_resolve_through_the_directory() -> Result<()> {
    let array = small_array(0..20)?;
    let mut cursor = array.cursor(0)?;
    cursor.seek(13)?;
    assert_eq!(cursor.get()?, 13);
    cursor.seek(-9)?;
    assert_eq!(cursor.get()?, 4);
    cursor.seek(16)?;
    assert!(cursor.is_past_end());
    assert!(matches!(
        cursor.seek(5).unwrap_err(),
        QuireError::OutOfRange { .. }
    ));
    assert!(matches!(
        array.cursor(0)?.seek(-1).unwrap_err(),
        QuireError::InvalidArgument(_)
    ));
    Ok(())
}

#[test]
fn dereferencing_past_end_is_rejected() -> Result<()> {
    let array = small_array(0..4)?;
    let cursor = array.cursor(4)?;
    assert!(matches!(
        cursor.value().unwrap_err(),
        QuireError::OutOfRange { .. }
    ));
    Ok(())
}

#[test]
fn writes_through_the_cursor_land_in_the_array() -> Result<()> {
    let array = small_array(0..10)?;
    let mut cursor = array.cursor(5)?;
    cursor.set(500)?;
    assert_eq!(*array.get(5)?, 500);
    cursor.next()?;
    *cursor.value_mut()? += 100;
    assert_eq!(*array.get(6)?, 106);
    Ok(())
}

#[test]
fn insert_through_a_cursor_repositions_it() -> Result<()> {
    let array = small_array(0..10)?;
    let mut cursor = array.cursor(6)?;
    cursor.insert(3)?;
    assert_eq!(array.len(), 13);
    assert_eq!(cursor.index(), 6);
    assert_eq!(cursor.get()?, 0);
    // The displaced element follows the inserted run.
    cursor.seek(3)?;
    assert_eq!(cursor.get()?, 6);
    Ok(())
}

#[test]
fn remove_through_a_cursor_repositions_it() -> Result<()> {
    let array = small_array(0..10)?;
    let mut cursor = array.cursor(3)?;
    cursor.remove(5)?;
    assert_eq!(array.len(), 5);
    assert_eq!(cursor.index(), 3);
    assert_eq!(cursor.get()?, 8);
    // Removing the rest leaves the cursor past the end.
    cursor.remove(2)?;
    assert!(cursor.is_past_end());
    assert!(matches!(
        cursor.remove(1).unwrap_err(),
        QuireError::InvalidArgument(_)
    ));
    Ok(())
}

#[test]
fn append_through_a_past_end_cursor() -> Result<()> {
    let array = small_array(0..4)?;
    let mut cursor = array.cursor(4)?;
    cursor.insert(2)?;
    assert_eq!(array.len(), 6);
    assert_eq!(cursor.index(), 4);
    cursor.set(44)?;
    assert_eq!(*array.get(4)?, 44);
    Ok(())
}

#[test]
fn structural_edits_outside_the_cursor_invalidate_it() -> Result<()> {
    let array = small_array(0..10)?;
    let cursor = array.cursor(2)?;
    array.insert(0, 1)?;
    assert!(matches!(
        cursor.value().unwrap_err(),
        QuireError::StaleCursor
    ));
    // Rebinding yields a usable cursor again.
    let fresh = array.cursor(3)?;
    assert_eq!(fresh.get()?, 2);
    Ok(())
}

#[test]
fn clones_pin_independently() -> Result<()> {
    let store = MemoryStore::new();
    let array: SegArray<u64> = SegArray::with_store(
        ArrayOptions::new()
            .segment_bytes(32)
            .max_resident_segments(Some(2)),
        store,
    )?;
    for i in 0..12 {
        array.push(i)?;
    }
    let first = array.cursor(0)?;
    let second = first.clone();
    drop(first);
    // The clone still pins segment 0: pressure elsewhere cannot evict it.
    for i in 4..12 {
        let _ = *array.get(i)?;
    }
    assert!(array.is_resident(0)?);
    assert_eq!(second.get()?, 0);
    Ok(())
}

#[test]
fn cursor_advance_faults_cold_segments_in() -> Result<()> {
    let store = MemoryStore::new();
    let array: SegArray<u64> = SegArray::with_store(
        ArrayOptions::new()
            .segment_bytes(32)
            .max_resident_segments(Some(2)),
        store,
    )?;
    for i in 0..20 {
        array.push(i)?;
    }
    let mut cursor = array.cursor(0)?;
    let mut seen = Vec::new();
    while cursor.is_bound() {
        seen.push(cursor.get()?);
        cursor.next()?;
    }
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
    assert!(array.stats().faults > 0);
    Ok(())
}
