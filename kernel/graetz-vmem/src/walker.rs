//! # Hierarchical Table Walker
//!
//! Descends the translation tree one level per step. At each level the
//! walker extracts the level's bit-slice of the virtual address, reads the
//! entry at that index, and either follows the physical address it carries
//! or (on a write walk) installs a fresh next-level table obtained from the
//! page-allocator oracle.
//!
//! The root table is borrowed directly — an address-space object starts
//! with its root — while every deeper table is reached by its *physical*
//! address, re-expressed through the [`PhysMapper`] describing the
//! virtual-to-physical translation currently in force.
//!
//! Returned entry references are valid for the caller's current operation
//! only; the walker retains nothing.

use crate::addresses::{PhysAddr, VirtAddr};
use crate::arch::{EntryKind, MmuArch, TableEntry, level_index};
use crate::{PageAllocator, PhysMapper};

/// Why a write walk could not reach its target level.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum WalkError {
    /// The allocator oracle is exhausted.
    OutOfMemory,
    /// A large-page leaf already covers the address at a directory level.
    LargeLeafInPath,
}

/// Walk down to `target_level` for `virt`, allocating missing intermediate
/// tables, and return the entry slot there.
///
/// `target_level = 0` addresses the root slot itself (large-page
/// installation); the leaf level addresses a small-page slot.
pub(crate) fn walk_mut<'t, A, M, P>(
    root: &'t mut [A::Entry],
    mapper: &M,
    alloc: &mut P,
    virt: VirtAddr,
    target_level: usize,
) -> Result<&'t mut A::Entry, WalkError>
where
    A: MmuArch,
    M: PhysMapper,
    P: PageAllocator,
{
    let mut level = 0;
    let mut entry: &'t mut A::Entry = &mut root[level_index::<A>(virt, 0)];
    loop {
        if level == target_level {
            return Ok(entry);
        }
        let table = match entry.kind(level) {
            EntryKind::Empty => {
                let table = alloc.allocate_page().ok_or(WalkError::OutOfMemory)?;
                // The oracle hands out zero-initialized pages, so the new
                // table starts with every entry empty.
                *entry = A::Entry::new_table(table, level);
                table
            }
            EntryKind::Table => entry
                .physical_address(level)
                .expect("populated table entry carries an address"),
            EntryKind::LargeLeaf => return Err(WalkError::LargeLeafInPath),
            EntryKind::Leaf => unreachable!("leaf entries exist only at the leaf level"),
        };
        level += 1;
        let slot = entry_slot::<A>(table, level_index::<A>(virt, level));
        entry = unsafe { mapper.phys_to_mut::<A::Entry>(slot) };
    }
}

/// Walk to the populated entry covering `virt` without allocating.
///
/// Returns the entry slot and the level it was found at (a directory level
/// for a large-page leaf), or `None` when any entry on the path is empty.
pub(crate) fn walk_existing<'t, A, M>(
    root: &'t mut [A::Entry],
    mapper: &M,
    virt: VirtAddr,
) -> Option<(&'t mut A::Entry, usize)>
where
    A: MmuArch,
    M: PhysMapper,
{
    let mut level = 0;
    let mut entry: &'t mut A::Entry = &mut root[level_index::<A>(virt, 0)];
    loop {
        let table = match entry.kind(level) {
            EntryKind::Empty => return None,
            EntryKind::Leaf | EntryKind::LargeLeaf => return Some((entry, level)),
            EntryKind::Table => entry
                .physical_address(level)
                .expect("populated table entry carries an address"),
        };
        level += 1;
        let slot = entry_slot::<A>(table, level_index::<A>(virt, level));
        entry = unsafe { mapper.phys_to_mut::<A::Entry>(slot) };
    }
}

/// Read-only walk. Returns the populated entry covering `virt` together
/// with the level it terminated at (early for a large-page leaf), or `None`
/// when any entry on the path is empty.
pub(crate) fn lookup<A, M>(root: &[A::Entry], mapper: &M, virt: VirtAddr) -> Option<(A::Entry, usize)>
where
    A: MmuArch,
    M: PhysMapper,
{
    let mut level = 0;
    let mut entry: A::Entry = root[level_index::<A>(virt, 0)];
    loop {
        let table = match entry.kind(level) {
            EntryKind::Empty => return None,
            EntryKind::Leaf | EntryKind::LargeLeaf => return Some((entry, level)),
            EntryKind::Table => entry
                .physical_address(level)
                .expect("populated table entry carries an address"),
        };
        level += 1;
        let slot = entry_slot::<A>(table, level_index::<A>(virt, level));
        entry = *unsafe { mapper.phys_to_mut::<A::Entry>(slot) };
    }
}

/// Physical address of the `index`-th entry in the table at `table`.
fn entry_slot<A: MmuArch>(table: PhysAddr, index: usize) -> PhysAddr {
    table + (index * size_of::<A::Entry>()) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Armv7, Ia32, leaf_level};
    use crate::attrs::PageAttrs;
    use crate::emulated::{BumpAlloc, EmulatedMemory};
    use crate::arch::RootTable;

    fn fresh_root<A: MmuArch>() -> A::Root {
        A::Root::NEW
    }

    #[test]
    fn write_walk_allocates_each_missing_level() {
        let mem = EmulatedMemory::new();
        let mut alloc = BumpAlloc::new(0x0200_0000, 0x0210_0000);
        let mut root = fresh_root::<Ia32>();

        let va = VirtAddr::new(0xD000_0000);
        let leaf = walk_mut::<Ia32, _, _>(
            root.entries_mut(),
            &mem,
            &mut alloc,
            va,
            leaf_level::<Ia32>(),
        )
        .expect("walk");
        assert!(leaf.is_empty());
        assert_eq!(alloc.count(), 1, "one intermediate table for a 2-level walk");

        // A second walk to a neighboring page reuses the same table.
        let va2 = VirtAddr::new(0xD000_1000);
        let _ = walk_mut::<Ia32, _, _>(
            root.entries_mut(),
            &mem,
            &mut alloc,
            va2,
            leaf_level::<Ia32>(),
        )
        .expect("walk");
        assert_eq!(alloc.count(), 1);
    }

    #[test]
    fn read_walk_stops_at_empty() {
        let mem = EmulatedMemory::new();
        let root = fresh_root::<Armv7>();
        assert_eq!(
            lookup::<Armv7, _>(root.entries(), &mem, VirtAddr::new(0x1234_5000)),
            None
        );
    }

    #[test]
    fn write_walk_reports_exhaustion() {
        let mem = EmulatedMemory::new();
        let mut alloc = BumpAlloc::new(0x0200_0000, 0x0200_0000); // zero pages
        let mut root = fresh_root::<Ia32>();
        let err = walk_mut::<Ia32, _, _>(
            root.entries_mut(),
            &mem,
            &mut alloc,
            VirtAddr::new(0xD000_0000),
            leaf_level::<Ia32>(),
        )
        .unwrap_err();
        assert_eq!(err, WalkError::OutOfMemory);
    }

    #[test]
    fn write_walk_refuses_to_pierce_a_large_leaf() {
        let mem = EmulatedMemory::new();
        let mut alloc = BumpAlloc::new(0x0200_0000, 0x0210_0000);
        let mut root = fresh_root::<Ia32>();

        let attrs = PageAttrs::PRESENT | PageAttrs::WRITABLE | PageAttrs::LARGE;
        let idx = level_index::<Ia32>(VirtAddr::new(0xE000_0000), 0);
        root.entries_mut()[idx] =
            <Ia32 as MmuArch>::Entry::new_leaf(PhysAddr::new(0x4000_0000), attrs, 0);

        let err = walk_mut::<Ia32, _, _>(
            root.entries_mut(),
            &mem,
            &mut alloc,
            VirtAddr::new(0xE012_3000),
            leaf_level::<Ia32>(),
        )
        .unwrap_err();
        assert_eq!(err, WalkError::LargeLeafInPath);
    }

    #[test]
    fn read_walk_terminates_early_on_large_leaf() {
        let mem = EmulatedMemory::new();
        let mut root = fresh_root::<Armv7>();
        let attrs = PageAttrs::PRESENT | PageAttrs::LARGE;
        let idx = level_index::<Armv7>(VirtAddr::new(0xE010_0000), 0);
        root.entries_mut()[idx] =
            <Armv7 as MmuArch>::Entry::new_leaf(PhysAddr::new(0x4010_0000), attrs, 0);

        let (entry, level) = lookup::<Armv7, _>(root.entries(), &mem, VirtAddr::new(0xE012_3000))
            .expect("section covers the address");
        assert_eq!(level, 0);
        assert_eq!(entry.physical_address(0), Some(PhysAddr::new(0x4010_0000)));
    }
}
