//! # IA-32 (80386+) Paging
//!
//! Two translation levels. The top 10 bits of a virtual address index the
//! page directory, the next 10 the page table, the low 12 are the in-page
//! offset:
//!
//! ```text
//! | 31‒22     | 21‒12      | 11‒0   |
//! | directory | page table | offset |
//! ```
//!
//! A directory entry with the page-size bit set maps a 4 MiB page directly
//! (requires `CR4.PSE`). Both entry flavors share one bit layout; the upper
//! 20 bits carry the physical address, the lower 12 the attributes, so the
//! two never overlap.
//!
//! The translation root lives in `CR3`; paging and supervisor write
//! protection are the `PG` and `WP` bits of `CR0`.

use bitfield_struct::bitfield;

use super::{EntryKind, MmuArch, RootTable, TableEntry};
use crate::addresses::{PhysAddr, VirtAddr};
use crate::attrs::PageAttrs;

#[cfg(target_arch = "x86")]
use graetz_registers::{Cr0, Cr3, Cr4, LoadRegisterUnsafe, StoreRegisterUnsafe};

/// A directory or page-table entry.
///
/// The same word works at both levels; `large_page` is only meaningful in a
/// directory entry (in a leaf PTE that bit position is PAT, which this
/// kernel leaves clear).
#[bitfield(u32)]
pub struct Ia32Entry {
    /// Physically present in memory.
    pub present: bool,

    /// Write access allowed.
    pub writable: bool,

    /// Accessible by user code.
    pub user: bool,

    /// Write-through caching enabled.
    pub write_through: bool,

    /// Caching disabled.
    pub no_cache: bool,

    /// Set by the processor on a read of memory in the page.
    pub accessed: bool,

    /// Set by the processor on a write to memory in the page.
    pub dirty: bool,

    /// Directory entry describes a 4 MiB page instead of a page table.
    pub large_page: bool,

    /// Entry is not replaced when a new translation root is loaded.
    pub global: bool,

    /// Available to the operating system; defined but not yet consumed.
    #[bits(3)]
    pub os_available: u8,

    /// Physical address bits 31..12.
    #[bits(20)]
    frame: u32,
}

impl PartialEq for Ia32Entry {
    fn eq(&self, other: &Self) -> bool {
        self.into_bits() == other.into_bits()
    }
}

impl Eq for Ia32Entry {}

impl Ia32Entry {
    const fn address_align(level: usize) -> u32 {
        if level == 0 {
            Ia32::LARGE_PAGE_SIZE
        } else {
            Ia32::PAGE_SIZE
        }
    }
}

impl TableEntry for Ia32Entry {
    const EMPTY: Self = Self::new();

    // accessed | dirty
    const VOLATILE_MASK: u32 = 0x60;

    fn is_empty(self) -> bool {
        !self.present()
    }

    fn kind(self, level: usize) -> EntryKind {
        if !self.present() {
            EntryKind::Empty
        } else if level == 0 {
            if self.large_page() {
                EntryKind::LargeLeaf
            } else {
                EntryKind::Table
            }
        } else {
            EntryKind::Leaf
        }
    }

    fn physical_address(self, _level: usize) -> Option<PhysAddr> {
        if self.is_empty() {
            return None;
        }
        Some(PhysAddr::new(self.frame() << 12))
    }

    fn set_physical_address(&mut self, pa: PhysAddr, level: usize) {
        debug_assert!(!self.is_empty());
        let align = if self.kind(level) == EntryKind::LargeLeaf {
            Ia32::LARGE_PAGE_SIZE
        } else {
            Ia32::PAGE_SIZE
        };
        debug_assert!(pa.is_aligned(align));
        self.set_frame(pa.as_u32() >> 12);
    }

    fn new_table(pa: PhysAddr, level: usize) -> Self {
        debug_assert!(level < super::leaf_level::<Ia32>());
        debug_assert!(pa.is_aligned(Ia32::PAGE_SIZE));
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame(pa.as_u32() >> 12)
    }

    fn new_leaf(pa: PhysAddr, attrs: PageAttrs, level: usize) -> Self {
        let large = attrs.contains(PageAttrs::LARGE);
        debug_assert!(!large || level == 0, "large leaves live at directory level");
        debug_assert!(pa.is_aligned(Self::address_align(if large { 0 } else { 1 })));
        Self::new()
            .with_present(true)
            .with_writable(attrs.contains(PageAttrs::WRITABLE))
            .with_user(attrs.contains(PageAttrs::USER))
            .with_write_through(attrs.contains(PageAttrs::WRITE_THROUGH))
            .with_no_cache(attrs.contains(PageAttrs::NO_CACHE))
            .with_large_page(large)
            .with_global(attrs.contains(PageAttrs::GLOBAL))
            .with_frame(pa.as_u32() >> 12)
    }

    fn attrs(self, level: usize) -> PageAttrs {
        let mut attrs = PageAttrs::empty();
        attrs.set(PageAttrs::PRESENT, self.present());
        attrs.set(PageAttrs::WRITABLE, self.writable());
        attrs.set(PageAttrs::USER, self.user());
        attrs.set(PageAttrs::WRITE_THROUGH, self.write_through());
        attrs.set(PageAttrs::NO_CACHE, self.no_cache());
        attrs.set(PageAttrs::ACCESSED, self.accessed());
        attrs.set(PageAttrs::DIRTY, self.dirty());
        attrs.set(PageAttrs::LARGE, level == 0 && self.large_page());
        attrs.set(PageAttrs::GLOBAL, self.global());
        attrs
    }

    fn raw(self) -> u32 {
        self.into_bits()
    }
}

/// The page directory: 1024 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct Ia32Root([Ia32Entry; 1024]);

impl RootTable for Ia32Root {
    type Entry = Ia32Entry;

    const NEW: Self = Self([Ia32Entry::EMPTY; 1024]);

    fn entries(&self) -> &[Ia32Entry] {
        &self.0
    }

    fn entries_mut(&mut self) -> &mut [Ia32Entry] {
        &mut self.0
    }
}

/// The IA-32 architecture descriptor.
pub struct Ia32;

impl MmuArch for Ia32 {
    const NAME: &'static str = "ia32";

    const LEVEL_BITS: &'static [u32] = &[10, 10];

    const PAGE_SIZE: u32 = 4096;

    const LARGE_PAGE_SIZE: u32 = 4 * 1024 * 1024;

    type Entry = Ia32Entry;
    type Root = Ia32Root;

    unsafe fn load_translation_root(root: PhysAddr) {
        #[cfg(target_arch = "x86")]
        unsafe {
            Cr3::from_directory_phys(root.as_u32(), false, false).store_unsafe();
        }
        #[cfg(not(target_arch = "x86"))]
        let _ = root;
    }

    unsafe fn set_mmu_enabled(enabled: bool) {
        #[cfg(target_arch = "x86")]
        unsafe {
            if enabled {
                // 4 MiB pages and global mappings must be armed before PG.
                Cr4::load_unsafe()
                    .with_pse_page_size_extensions(true)
                    .with_pge_page_global_enable(true)
                    .store_unsafe();
            }
            Cr0::load_unsafe()
                .with_pg_paging(enabled)
                .with_wp_write_protect(enabled)
                .store_unsafe();
        }
        #[cfg(not(target_arch = "x86"))]
        let _ = enabled;
    }

    fn mmu_enabled() -> bool {
        #[cfg(target_arch = "x86")]
        {
            unsafe { Cr0::load_unsafe().pg_paging() }
        }
        #[cfg(not(target_arch = "x86"))]
        {
            false
        }
    }

    fn flush_tlb_page(virt: VirtAddr) {
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!(
                "invlpg ({0})",
                in(reg) virt.as_u32(),
                options(att_syntax, nostack, preserves_flags)
            );
        }
        #[cfg(not(target_arch = "x86"))]
        let _ = virt;
    }

    fn halt() -> ! {
        #[cfg(target_arch = "x86")]
        loop {
            unsafe {
                core::arch::asm!("cli", "hlt", options(nomem, nostack));
            }
        }
        #[cfg(not(target_arch = "x86"))]
        panic!("cpu halted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_encoding_round_trips() {
        let attrs = PageAttrs::PRESENT | PageAttrs::WRITABLE | PageAttrs::GLOBAL;
        let e = Ia32Entry::new_leaf(PhysAddr::new(0x5555_0000), attrs, 1);
        assert_eq!(e.kind(1), EntryKind::Leaf);
        assert_eq!(e.physical_address(1), Some(PhysAddr::new(0x5555_0000)));
        let decoded = e.attrs(1);
        assert!(decoded.contains(PageAttrs::WRITABLE));
        assert!(decoded.contains(PageAttrs::GLOBAL));
        assert!(!decoded.contains(PageAttrs::USER));
        // raw layout: present | writable | global | frame
        assert_eq!(e.raw(), 0x5555_0000 | 0x103);
    }

    #[test]
    fn large_leaf_sets_the_page_size_bit() {
        let attrs = PageAttrs::PRESENT | PageAttrs::WRITABLE | PageAttrs::LARGE;
        let e = Ia32Entry::new_leaf(PhysAddr::new(0x4000_0000), attrs, 0);
        assert_eq!(e.kind(0), EntryKind::LargeLeaf);
        assert!(e.attrs(0).contains(PageAttrs::LARGE));
        assert_eq!(e.raw() & 0x80, 0x80);
    }

    #[test]
    fn table_entries_are_present_and_writable() {
        let e = Ia32Entry::new_table(PhysAddr::new(0x0011_C000), 0);
        assert_eq!(e.kind(0), EntryKind::Table);
        assert_eq!(e.raw(), 0x0011_C000 | 0x3);
    }

    #[test]
    fn address_rewrite_preserves_attributes() {
        let attrs = PageAttrs::PRESENT | PageAttrs::WRITABLE | PageAttrs::USER;
        let mut e = Ia32Entry::new_leaf(PhysAddr::new(0xC001_C000), attrs, 1);
        e.set_physical_address(PhysAddr::new(0x0011_C000), 1);
        assert_eq!(e.physical_address(1), Some(PhysAddr::new(0x0011_C000)));
        assert_eq!(e.attrs(1), attrs);
    }

    #[test]
    fn same_mapping_ignores_hardware_managed_bits() {
        let attrs = PageAttrs::PRESENT | PageAttrs::WRITABLE;
        let clean = Ia32Entry::new_leaf(PhysAddr::new(0x0020_0000), attrs, 1);
        let touched = Ia32Entry::from_bits(clean.raw() | 0x60); // accessed | dirty
        assert!(clean.same_mapping(touched));
        let other = Ia32Entry::new_leaf(PhysAddr::new(0x0030_0000), attrs, 1);
        assert!(!clean.same_mapping(other));
    }

    #[test]
    fn empty_is_all_zero() {
        assert_eq!(Ia32Entry::EMPTY.raw(), 0);
        assert!(Ia32Entry::EMPTY.is_empty());
        assert_eq!(Ia32Entry::EMPTY.kind(0), EntryKind::Empty);
    }
}

/// Continue execution in the high kernel mapping.
///
/// Runs right after paging was switched on, while the identity alias of the
/// kernel image is still mapped. Performs, in order:
///
/// 1. a far jump through the boot code segment so the instruction pointer
///    continues at its high alias,
/// 2. rebases the stack and frame pointers by Δ,
/// 3. rewrites the saved frame links and return addresses of every caller
///    frame, so unwinding out of the bootstrap lands in the high mapping.
///
/// The kernel's own GDT is loaded later by the descriptor-table setup; the
/// boot code segment (selector 0x08) is flat and stays valid across the
/// jump.
///
/// # Safety
/// Must run exactly once, on the boot CPU, with both the identity and the
/// high mapping of the kernel image live and frame pointers enabled.
#[cfg(target_arch = "x86")]
pub(crate) unsafe fn relocate_execution() {
    let delta = graetz_info::KERNEL_RELOCATION_DELTA;
    let fp: u32;
    unsafe {
        core::arch::asm!(
            "ljmpl  $0x08, $2f",
            "2:",
            "addl   {delta}, %esp",
            "addl   {delta}, %ebp",
            "movl   %ebp, {fp}",
            delta = in(reg) delta,
            fp = out(reg) fp,
            options(att_syntax)
        );
        // The frame chain was pushed before the rebase; walk it through the
        // identity alias.
        let low_fp = (fp - delta) as usize;
        let top = (low_fp & !(Ia32::PAGE_SIZE as usize - 1)) + Ia32::PAGE_SIZE as usize;
        crate::bootstrap::relocate_frames(low_fp as *mut usize, top as *const usize, delta as usize);
    }
}
