//! # Virtual Address Space
//!
//! An [`AddressSpace`] *is* its top-level translation table: the storage at
//! the start of the object is the root, page-aligned as the hardware
//! requires. The kernel's instance is a statically reserved singleton (see
//! the bootstrap module); further spaces for future tasks start out in the
//! `Adjusted` state via [`AddressSpace::new`].
//!
//! ## State machine
//!
//! ```text
//! Nascent ──adjust_table_addresses()──► Adjusted ──activate()──► Active
//! ```
//!
//! The kernel space is born `Nascent`: its root entries hold *virtual*
//! placeholder addresses of the image-resident boot tables. The one-shot
//! adjustment pass rewrites them to physical addresses; activation loads
//! the root into the translation-root register. Once a space is `Active`,
//! every address stored in its entries is a real physical address.

use graetz_info::layout;
use thiserror::Error;

use crate::addresses::{PhysAddr, VirtAddr};
use crate::arch::{EntryKind, MmuArch, RootTable, TableEntry, leaf_level, level_index, level_span};
use crate::attrs::PageAttrs;
use crate::walker;
use crate::{PageAllocator, PhysMapper};

/// Failure modes of [`AddressSpace::map`] and [`AddressSpace::unmap`].
///
/// A failed `map` leaves the prefix of the range that was already
/// processed in place; callers needing all-or-nothing semantics unmap the
/// prefix themselves.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum MapError {
    /// Misaligned address or size, zero size, or the range wraps past the
    /// top of the address space.
    #[error("invalid address range (alignment, size, or wrap-around)")]
    InvalidArgument,

    /// The page allocator was exhausted while installing an intermediate
    /// table.
    #[error("out of memory while allocating a translation table")]
    OutOfMemory,

    /// The range overlaps an existing mapping with a different target or
    /// different attributes.
    #[error("mapping conflicts with an existing entry")]
    Conflict,
}

/// Lifecycle state of an address space; see the module documentation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpaceState {
    /// Root entries hold linker-produced virtual placeholder addresses
    /// (kernel space only).
    Nascent,
    /// Every stored address is physical; the space is ready for
    /// activation.
    Adjusted,
    /// Loaded in the translation-root register of the calling CPU.
    Active,
}

/// A complete mapping from virtual to physical addresses, realized as a
/// tree of page tables rooted in this object's first field.
#[repr(C)]
pub struct AddressSpace<A: MmuArch> {
    /// The storage at the start of the object is the root table.
    root: A::Root,
    state: SpaceState,
    /// Kernel space: the statically linked image window shortcuts apply.
    kernel: bool,
}

impl<A: MmuArch> AddressSpace<A> {
    /// The kernel address space in its build-produced, not yet adjusted
    /// state. Used once, for the singleton.
    #[must_use]
    pub const fn nascent_kernel() -> Self {
        Self {
            root: A::Root::NEW,
            state: SpaceState::Nascent,
            kernel: true,
        }
    }

    /// An empty non-kernel space. There are no placeholder addresses to
    /// rewrite, so it starts out `Adjusted`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            root: A::Root::NEW,
            state: SpaceState::Adjusted,
            kernel: false,
        }
    }

    /// The architecture's translation granule.
    #[must_use]
    pub const fn page_size(&self) -> u32 {
        A::PAGE_SIZE
    }

    #[must_use]
    pub const fn state(&self) -> SpaceState {
        self.state
    }

    /// Whether this space is the one loaded in the translation-root
    /// register. For the kernel singleton this coincides with "paging is
    /// enabled".
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.state, SpaceState::Active)
    }

    /// Install the build-produced root entries for the kernel window: one
    /// next-level table per large-page span, referenced by its link-time
    /// (virtual) address. Part of establishing the `Nascent` state.
    pub fn link_boot_tables(&mut self, tables: &[VirtAddr]) {
        debug_assert_eq!(self.state, SpaceState::Nascent);
        for (i, table) in tables.iter().enumerate() {
            let va = VirtAddr::new(layout::KERNEL_CODE + i as u32 * A::LARGE_PAGE_SIZE);
            let slot = level_index::<A>(va, 0);
            debug_assert!(self.root.entries()[slot].is_empty());
            // The table address is still virtual; adjust_table_addresses
            // rewrites it before the walker ever follows it.
            self.root.entries_mut()[slot] = A::Entry::new_table(PhysAddr::new(table.as_u32()), 0);
        }
    }

    /// Rewrite the placeholder virtual addresses in the root to physical
    /// ones by subtracting the kernel relocation delta. Called exactly once
    /// during bootstrap, before paging is enabled.
    pub fn adjust_table_addresses(&mut self) {
        debug_assert_eq!(self.state, SpaceState::Nascent);
        for entry in self.root.entries_mut() {
            if entry.is_empty() {
                continue;
            }
            let placeholder = entry
                .physical_address(0)
                .expect("populated root entry carries an address")
                .as_u32();
            debug_assert!(layout::in_kernel_window(placeholder));
            entry.set_physical_address(
                PhysAddr::new(placeholder - layout::KERNEL_RELOCATION_DELTA),
                0,
            );
        }
        self.state = SpaceState::Adjusted;
    }

    /// Map `[virt, virt + size)` to `[phys, phys + size)`.
    ///
    /// `virt`, `phys` and `size` must be page-aligned, `size` non-zero, and
    /// neither end may wrap past the top of the address space (a range
    /// ending exactly at the top is fine). Mappings at or above the kernel
    /// half additionally become *global*. Spans where both addresses are
    /// large-page-aligned and at least one large page remains are installed
    /// as directory-level leaves without touching the allocator.
    ///
    /// Re-mapping a page to the identical target with identical attributes
    /// is a no-op; any differing overlap fails with [`MapError::Conflict`]
    /// and leaves the first mapping intact.
    pub fn map<M: PhysMapper, P: PageAllocator>(
        &mut self,
        mapper: &M,
        alloc: &mut P,
        virt: VirtAddr,
        phys: PhysAddr,
        size: u32,
        writable: bool,
        user: bool,
    ) -> Result<(), MapError> {
        log::trace!(
            "map({virt}, {phys}, {size:#x}, writable={writable}, user={user}) @ {:p}",
            self
        );
        debug_assert_ne!(self.state, SpaceState::Nascent);
        Self::check_range(virt.as_u32(), size)?;
        Self::check_range(phys.as_u32(), size)?;

        let mut offset = 0;
        while offset < size {
            let va = VirtAddr::new(virt.as_u32() + offset);
            let pa = PhysAddr::new(phys.as_u32() + offset);
            let remaining = size - offset;

            let mut attrs = PageAttrs::PRESENT;
            attrs.set(PageAttrs::WRITABLE, writable);
            attrs.set(PageAttrs::USER, user);
            // The kernel half is mapped identically everywhere; keeping its
            // entries across translation-root switches is a pure TLB win.
            attrs.set(PageAttrs::GLOBAL, va.as_u32() >= layout::KERNEL_CODE);

            let large_fits = va.is_aligned(A::LARGE_PAGE_SIZE)
                && pa.is_aligned(A::LARGE_PAGE_SIZE)
                && remaining >= A::LARGE_PAGE_SIZE;
            let step = if large_fits && self.map_large(va, pa, attrs)? {
                A::LARGE_PAGE_SIZE
            } else {
                self.map_small(mapper, alloc, va, pa, attrs)?;
                A::PAGE_SIZE
            };
            offset += step;
        }
        Ok(())
    }

    /// Install one large-page leaf in the root, or report `Ok(false)` when
    /// a table already hangs there and the span has to be mapped with small
    /// pages instead.
    fn map_large(&mut self, va: VirtAddr, pa: PhysAddr, attrs: PageAttrs) -> Result<bool, MapError> {
        let slot = &mut self.root.entries_mut()[level_index::<A>(va, 0)];
        match slot.kind(0) {
            EntryKind::Empty => {
                *slot = A::Entry::new_leaf(pa, attrs | PageAttrs::LARGE, 0);
                Ok(true)
            }
            EntryKind::LargeLeaf => {
                if slot.same_mapping(A::Entry::new_leaf(pa, attrs | PageAttrs::LARGE, 0)) {
                    Ok(true)
                } else {
                    Err(MapError::Conflict)
                }
            }
            EntryKind::Table => Ok(false),
            EntryKind::Leaf => unreachable!("leaf entries exist only at the leaf level"),
        }
    }

    fn map_small<M: PhysMapper, P: PageAllocator>(
        &mut self,
        mapper: &M,
        alloc: &mut P,
        va: VirtAddr,
        pa: PhysAddr,
        attrs: PageAttrs,
    ) -> Result<(), MapError> {
        let level = leaf_level::<A>();
        let slot = walker::walk_mut::<A, M, P>(self.root.entries_mut(), mapper, alloc, va, level)
            .map_err(|e| match e {
                walker::WalkError::OutOfMemory => MapError::OutOfMemory,
                walker::WalkError::LargeLeafInPath => MapError::Conflict,
            })?;
        let entry = A::Entry::new_leaf(pa, attrs, level);
        if slot.is_empty() {
            *slot = entry;
            Ok(())
        } else if slot.same_mapping(entry) {
            // Identical re-map; nothing to write, nothing to flush.
            Ok(())
        } else {
            Err(MapError::Conflict)
        }
    }

    /// Remove the mappings covering `[virt, virt + size)`.
    ///
    /// Pages with no mapping are skipped. A range that covers part of a
    /// large-page leaf without covering all of it fails with
    /// [`MapError::Conflict`]. Cleared entries of the active space are
    /// flushed from the TLB page by page.
    pub fn unmap<M: PhysMapper>(
        &mut self,
        mapper: &M,
        virt: VirtAddr,
        size: u32,
    ) -> Result<(), MapError> {
        log::trace!("unmap({virt}, {size:#x}) @ {:p}", self);
        Self::check_range(virt.as_u32(), size)?;
        let active = self.is_active();

        let mut offset = 0;
        while offset < size {
            let va = VirtAddr::new(virt.as_u32() + offset);
            let remaining = size - offset;
            let step = match walker::walk_existing::<A, M>(self.root.entries_mut(), mapper, va) {
                None => A::PAGE_SIZE,
                Some((entry, level)) if level == leaf_level::<A>() => {
                    *entry = A::Entry::EMPTY;
                    if active {
                        A::flush_tlb_page(va);
                    }
                    A::PAGE_SIZE
                }
                Some((entry, _)) => {
                    if !va.is_aligned(A::LARGE_PAGE_SIZE) || remaining < A::LARGE_PAGE_SIZE {
                        return Err(MapError::Conflict);
                    }
                    *entry = A::Entry::EMPTY;
                    if active {
                        A::flush_tlb_page(va);
                    }
                    A::LARGE_PAGE_SIZE
                }
            };
            offset += step;
        }
        Ok(())
    }

    /// Translate a virtual address.
    ///
    /// Two shortcuts precede the table walk: an address inside the
    /// statically linked kernel window translates by the relocation delta
    /// regardless of table contents, and while paging is off every address
    /// translates to itself. Otherwise the walker resolves the address;
    /// `None` means no mapping covers it.
    #[must_use]
    pub fn translate<M: PhysMapper>(&self, mapper: &M, virt: VirtAddr) -> Option<PhysAddr> {
        if self.kernel && layout::in_kernel_window(virt.as_u32()) {
            return Some(PhysAddr::new(
                virt.as_u32() - layout::KERNEL_RELOCATION_DELTA,
            ));
        }
        if !self.is_active() {
            return Some(PhysAddr::new(virt.as_u32()));
        }
        let (entry, level) = walker::lookup::<A, M>(self.root.entries(), mapper, virt)?;
        let base = entry.physical_address(level)?;
        let span = level_span::<A>(level);
        Some(PhysAddr::new(base.as_u32() + (virt.as_u32() & (span - 1))))
    }

    /// Find a virtual address that maps to `phys`, searching the tables
    /// from the top. The kernel image answers without a walk; everything
    /// else is a reverse scan, so this is a diagnostic aid rather than a
    /// fast path.
    #[must_use]
    pub fn virt_addr_of<M: PhysMapper>(&self, mapper: &M, phys: PhysAddr) -> Option<VirtAddr> {
        if !self.is_active() {
            return Some(VirtAddr::new(phys.as_u32()));
        }
        if self.kernel && layout::in_kernel_image_phys(phys.as_u32()) {
            return Some(VirtAddr::new(
                phys.as_u32() + layout::KERNEL_RELOCATION_DELTA,
            ));
        }
        let page = phys.as_u32() & !(A::PAGE_SIZE - 1);
        let leaf = leaf_level::<A>();
        for (i, entry) in self.root.entries().iter().enumerate().rev() {
            match entry.kind(0) {
                EntryKind::Empty | EntryKind::Leaf => {}
                EntryKind::LargeLeaf => {
                    let base = entry.physical_address(0)?.as_u32();
                    if phys.as_u32() >= base && phys.as_u32() - base < A::LARGE_PAGE_SIZE {
                        let va = (i as u32) * A::LARGE_PAGE_SIZE + (phys.as_u32() - base);
                        return Some(VirtAddr::new(va));
                    }
                }
                EntryKind::Table => {
                    let table = entry
                        .physical_address(0)
                        .expect("populated table entry carries an address");
                    let count = 1usize << A::LEVEL_BITS[leaf];
                    for j in (0..count).rev() {
                        let slot = table + (j * size_of::<A::Entry>()) as u32;
                        let leaf_entry = *unsafe { mapper.phys_to_mut::<A::Entry>(slot) };
                        if leaf_entry.kind(leaf) == EntryKind::Leaf
                            && leaf_entry.physical_address(leaf).map(PhysAddr::as_u32) == Some(page)
                        {
                            let va = (i as u32) * A::LARGE_PAGE_SIZE
                                + (j as u32) * A::PAGE_SIZE
                                + (phys.as_u32() & (A::PAGE_SIZE - 1));
                            return Some(VirtAddr::new(va));
                        }
                    }
                }
            }
        }
        None
    }

    /// Load this space's root into the translation-root register of the
    /// calling CPU.
    ///
    /// # Safety
    /// The space must be `Adjusted` (or already `Active`), the currently
    /// executing code and stack must stay mapped under this root, and on
    /// the first activation the MMU-enable ritual of the bootstrap must
    /// follow immediately.
    pub unsafe fn activate(&mut self) {
        debug_assert_ne!(self.state, SpaceState::Nascent);
        let root = self.root_phys();
        log::trace!("activate @ {:p}: root {root}", self);
        unsafe { A::load_translation_root(root) };
        self.state = SpaceState::Active;
    }

    /// Physical address of the root table. Before relocation the object is
    /// reached through its physical alias, afterwards through the kernel
    /// window; both cases reduce to window arithmetic.
    fn root_phys(&self) -> PhysAddr {
        let va = core::ptr::from_ref(&self.root) as usize as u32;
        if layout::in_kernel_window(va) {
            PhysAddr::new(va - layout::KERNEL_RELOCATION_DELTA)
        } else {
            PhysAddr::new(va)
        }
    }

    /// Leaf base address, decoded attributes and terminating level for a
    /// virtual address, without any shortcut. Diagnostics only.
    #[cfg(any(test, feature = "verbose"))]
    pub(crate) fn lookup_raw<M: PhysMapper>(
        &self,
        mapper: &M,
        virt: VirtAddr,
    ) -> Option<(PhysAddr, PageAttrs, usize)> {
        let (entry, level) = walker::lookup::<A, M>(self.root.entries(), mapper, virt)?;
        Some((entry.physical_address(level)?, entry.attrs(level), level))
    }

    pub(crate) fn root_entries(&self) -> &[A::Entry] {
        self.root.entries()
    }

    /// Alignment and wrap screening shared by `map` and `unmap`. The
    /// inclusive last byte keeps a range ending exactly at the top of the
    /// address space valid.
    fn check_range(base: u32, size: u32) -> Result<(), MapError> {
        if size == 0
            || base & (A::PAGE_SIZE - 1) != 0
            || size & (A::PAGE_SIZE - 1) != 0
            || base.checked_add(size - 1).is_none()
        {
            return Err(MapError::InvalidArgument);
        }
        Ok(())
    }
}

impl<A: MmuArch> Default for AddressSpace<A> {
    fn default() -> Self {
        Self::new()
    }
}
