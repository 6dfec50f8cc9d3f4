use crate::multiboot::{MEMORY_AVAILABLE, MEMORY_RESERVED, MemMapEntry};

use super::frames::FrameAllocator;
use super::paging::{PAGE_MASK, PageDirectory, PageFlags};
use super::{PAGE_SIZE, page_to_addr};

fn available(addr: u64, len: u64) -> MemMapEntry {
    MemMapEntry {
        size: 20,
        addr,
        len,
        kind: MEMORY_AVAILABLE,
    }
}

fn reserved(addr: u64, len: u64) -> MemMapEntry {
    MemMapEntry {
        size: 20,
        addr,
        len,
        kind: MEMORY_RESERVED,
    }
}

/// 64 MiB of RAM, kernel in frame 0: sixteen frames, fifteen free.
#[test]
fn boot_with_64mib_leaves_fifteen_frames() {
    let mut frames = FrameAllocator::new();
    frames.init(64 * 1024, &[available(0, 64 * 1024 * 1024)], 0);

    assert_eq!(frames.num_frames(), 16);
    assert_eq!(frames.num_free(), 15);
    assert_eq!(frames.num_used(), 1);
    assert!(frames.is_used(0));
}

#[test]
fn counts_always_add_up() {
    let mut frames = FrameAllocator::new();
    frames.init(64 * 1024, &[available(0, 64 * 1024 * 1024)], 0);

    assert_eq!(frames.num_used() + frames.num_free(), frames.num_frames());
    let frame = frames.next_free().unwrap();
    frames.mark_used(frame);
    assert_eq!(frames.num_used() + frames.num_free(), frames.num_frames());
}

#[test]
fn mark_roundtrip_preserves_usage() {
    let mut frames = FrameAllocator::new();
    frames.init(64 * 1024, &[available(0, 64 * 1024 * 1024)], 0);

    let used_before = frames.num_used();
    let frame = frames.next_free().unwrap();
    frames.mark_used(frame);
    frames.mark_free(frame);
    assert_eq!(frames.num_used(), used_before);
}

#[test]
fn next_free_is_first_fit() {
    let mut frames = FrameAllocator::new();
    frames.init(64 * 1024, &[available(0, 64 * 1024 * 1024)], 0);

    assert_eq!(frames.next_free(), Some(1));
    frames.mark_used(1);
    frames.mark_used(2);
    assert_eq!(frames.next_free(), Some(3));
    frames.mark_free(1);
    assert_eq!(frames.next_free(), Some(1));
}

#[test]
fn next_free_none_when_exhausted() {
    let mut frames = FrameAllocator::new();
    frames.init(8 * 1024, &[available(0, 8 * 1024 * 1024)], 0);

    assert_eq!(frames.num_frames(), 2);
    frames.mark_used(1);
    assert_eq!(frames.next_free(), None);
}

/// Regions may abut; a reserved region overlapping an available one wins.
#[test]
fn reserved_regions_win_on_overlap() {
    let mut frames = FrameAllocator::new();
    frames.init(
        64 * 1024,
        &[
            available(0, 64 * 1024 * 1024),
            reserved(8 * 1024 * 1024, 4 * 1024 * 1024),
        ],
        0,
    );

    assert!(frames.is_used(2));
    assert!(!frames.is_used(1));
    assert!(!frames.is_used(3));
}

#[test]
fn frames_not_covered_by_the_map_stay_unusable() {
    let mut frames = FrameAllocator::new();
    frames.init(64 * 1024, &[available(0, 32 * 1024 * 1024)], 0);

    assert_eq!(frames.num_frames(), 16);
    assert!(!frames.is_used(7));
    assert!(frames.is_used(8));
    assert!(frames.is_used(15));
}

#[test]
#[should_panic(expected = "already in use")]
fn double_mark_used_is_fatal() {
    let mut frames = FrameAllocator::new();
    frames.init(64 * 1024, &[available(0, 64 * 1024 * 1024)], 0);
    frames.mark_used(1);
    frames.mark_used(1);
}

#[test]
fn map_then_unmap_roundtrip() {
    let mut dir = PageDirectory::empty();
    let vaddr = page_to_addr(3);
    let paddr = page_to_addr(5);

    assert!(!dir.is_mapped(vaddr));
    dir.map(vaddr, paddr, PageFlags::USER);
    assert!(dir.is_mapped(vaddr));
    assert_eq!(dir.physical_of(vaddr), paddr);
    dir.unmap(vaddr);
    assert!(!dir.is_mapped(vaddr));
}

#[test]
fn mapped_addresses_stay_page_aligned() {
    let mut dir = PageDirectory::empty();
    dir.map(page_to_addr(2), page_to_addr(9), PageFlags::empty());

    assert_eq!(dir.physical_of(page_to_addr(2)) % PAGE_SIZE, 0);
    assert_eq!(dir.physical_of(page_to_addr(2)) & !PAGE_MASK, 0);
}

#[test]
fn free_entry_scan_respects_lower_bound() {
    let mut dir = PageDirectory::empty();
    assert_eq!(dir.next_free_entry(0), Some(0));
    assert_eq!(dir.next_free_entry(1), Some(1));

    dir.map(page_to_addr(1), page_to_addr(1), PageFlags::empty());
    assert_eq!(dir.next_free_entry(1), Some(2));
    assert_eq!(dir.num_free_entries(), 1023);
}

#[test]
fn duplicate_carries_every_mapping() {
    let mut dir = PageDirectory::empty();
    dir.map(page_to_addr(1), page_to_addr(1), PageFlags::empty());
    dir.map(page_to_addr(4), page_to_addr(7), PageFlags::USER);

    let copy = dir.duplicate();
    assert!(copy.is_mapped(page_to_addr(1)));
    assert!(copy.is_mapped(page_to_addr(4)));
    assert_eq!(copy.physical_of(page_to_addr(4)), page_to_addr(7));
    assert_eq!(copy.num_free_entries(), dir.num_free_entries());
}

#[test]
#[should_panic(expected = "already mapped")]
fn mapping_a_mapped_entry_is_fatal() {
    let mut dir = PageDirectory::empty();
    dir.map(page_to_addr(1), page_to_addr(1), PageFlags::empty());
    dir.map(page_to_addr(1), page_to_addr(2), PageFlags::empty());
}

#[test]
#[should_panic(expected = "GLOBAL")]
fn requesting_the_global_bit_is_fatal() {
    let mut dir = PageDirectory::empty();
    dir.map(page_to_addr(1), page_to_addr(1), PageFlags::GLOBAL);
}

#[test]
#[should_panic(expected = "not 4MB aligned")]
fn unaligned_map_is_fatal() {
    let mut dir = PageDirectory::empty();
    dir.map(0x1000, page_to_addr(1), PageFlags::empty());
}
