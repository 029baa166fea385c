//! # ARMv7 (Raspberry Pi) Short-Descriptor Paging
//!
//! Two translation levels with `TTBCR.N = 0`. The top 12 bits of a virtual
//! address index the first-level table (4096 entries, 16 KiB-aligned), the
//! next 8 a coarse second-level table (256 entries), the low 12 are the
//! in-page offset:
//!
//! ```text
//! | 31‒20       | 19‒12  | 11‒0   |
//! | first level | coarse | offset |
//! ```
//!
//! A first-level *section* descriptor maps 1 MiB directly; a *coarse*
//! descriptor points at a second-level table whose *small page* descriptors
//! map 4 KiB each. The descriptor type lives in the low two bits, so the
//! empty pattern is the all-zero word (type `invalid`).
//!
//! Everything runs in domain 0, which the bootstrap sets to *client* so the
//! AP bits in the descriptors are enforced. There are no hardware
//! accessed/dirty bits in this format. A good description of the format is
//! in the ARM Architecture Reference Manual, Memory Management Unit
//! chapter.

use bitfield_struct::bitfield;

use super::{EntryKind, MmuArch, RootTable, TableEntry};
use crate::addresses::{PhysAddr, VirtAddr};
use crate::attrs::PageAttrs;

#[cfg(target_arch = "arm")]
use graetz_registers::{Dacr, LoadRegisterUnsafe, Sctlr, StoreRegisterUnsafe, Ttbr0, dacr};

/// First-level descriptor type: invalid entry.
const TYPE_INVALID: u8 = 0b00;
/// First-level descriptor type: coarse second-level table.
const TYPE_COARSE: u8 = 0b01;
/// First-level descriptor type: 1 MiB section.
const TYPE_SECTION: u8 = 0b10;

/// A 1 MiB section descriptor (first level).
#[bitfield(u32)]
struct SectionDesc {
    /// Descriptor type, `0b10` for a section.
    #[bits(2)]
    desc_type: u8,

    /// B: bufferable (write-back behavior together with C).
    b_bufferable: bool,

    /// C: cacheable.
    c_cacheable: bool,

    /// XN: execute never.
    xn_execute_never: bool,

    /// Domain number; this kernel uses domain 0 throughout.
    #[bits(4)]
    domain: u8,

    /// Implementation defined.
    p_imp: bool,

    /// AP\[1:0\] access permissions.
    #[bits(2)]
    ap: u8,

    /// TEX memory-type extension bits.
    #[bits(3)]
    tex: u8,

    /// AP\[2\]: read-only qualifier.
    apx: bool,

    /// S: shareable.
    s_shareable: bool,

    /// nG: not global; clear means the TLB entry survives a translation
    /// root switch.
    ng_not_global: bool,

    /// Supersection (16 MiB) flag; always clear here.
    supersection: bool,

    /// NS: non-secure.
    ns_non_secure: bool,

    /// Physical section base, bits 31..20.
    #[bits(12)]
    base: u32,
}

/// A coarse second-level-table descriptor (first level).
#[bitfield(u32)]
struct CoarseDesc {
    /// Descriptor type, `0b01` for a coarse table.
    #[bits(2)]
    desc_type: u8,

    /// PXN / NS / SBZ on this profile.
    #[bits(3)]
    imp: u8,

    /// Domain number.
    #[bits(4)]
    domain: u8,

    /// Implementation defined.
    p_imp: bool,

    /// Physical table base, bits 31..10 (1 KiB-aligned).
    #[bits(22)]
    base: u32,
}

/// A 4 KiB small-page descriptor (second level).
#[bitfield(u32)]
struct SmallPageDesc {
    /// XN: execute never.
    xn_execute_never: bool,

    /// Set for a small page; clear (with bit 0) would be invalid or a
    /// 64 KiB large page, which this kernel does not emit.
    small: bool,

    /// B: bufferable.
    b_bufferable: bool,

    /// C: cacheable.
    c_cacheable: bool,

    /// AP\[1:0\] access permissions.
    #[bits(2)]
    ap: u8,

    /// TEX memory-type extension bits.
    #[bits(3)]
    tex: u8,

    /// AP\[2\]: read-only qualifier.
    apx: bool,

    /// S: shareable.
    s_shareable: bool,

    /// nG: not global.
    ng_not_global: bool,

    /// Physical page base, bits 31..12.
    #[bits(20)]
    base: u32,
}

/// Encode (AP2, AP\[1:0\]) from the writable/user pair.
const fn access_permissions(writable: bool, user: bool) -> (bool, u8) {
    match (writable, user) {
        (true, false) => (false, 0b01),
        (false, false) => (true, 0b01),
        (true, true) => (false, 0b11),
        (false, true) => (true, 0b10),
    }
}

/// Decode the writable/user pair from (AP2, AP\[1:0\]).
const fn decode_permissions(apx: bool, ap: u8) -> (bool, bool) {
    match (apx, ap) {
        (false, 0b01) => (true, false),
        (true, 0b01) => (false, false),
        (false, 0b11) => (true, true),
        (true, 0b10) => (false, true),
        // Anything else is a pattern this kernel never writes.
        _ => (false, false),
    }
}

/// One ARMv7 translation-table entry, dispatching on the descriptor type
/// and the table level.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Armv7Entry(u32);

impl core::fmt::Debug for Armv7Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Armv7Entry({:#010x})", self.0)
    }
}

impl Armv7Entry {
    const fn desc_type(self) -> u8 {
        (self.0 & 0b11) as u8
    }

    fn cache_bits(attrs: PageAttrs) -> (bool, bool) {
        // Default is write-back cacheable; NO_CACHE strips both bits,
        // WRITE_THROUGH keeps C without B.
        if attrs.contains(PageAttrs::NO_CACHE) {
            (false, false)
        } else if attrs.contains(PageAttrs::WRITE_THROUGH) {
            (true, false)
        } else {
            (true, true)
        }
    }
}

impl TableEntry for Armv7Entry {
    const EMPTY: Self = Self(0);

    // No hardware-managed accessed/dirty bits in the short-descriptor
    // format.
    const VOLATILE_MASK: u32 = 0;

    fn is_empty(self) -> bool {
        self.desc_type() == TYPE_INVALID
    }

    fn kind(self, level: usize) -> EntryKind {
        if level == 0 {
            match self.desc_type() {
                TYPE_COARSE => EntryKind::Table,
                TYPE_SECTION => EntryKind::LargeLeaf,
                _ => EntryKind::Empty,
            }
        } else if self.0 & 0b10 != 0 {
            EntryKind::Leaf
        } else {
            // Invalid, or the 64 KiB large-page format this kernel never
            // writes.
            debug_assert_eq!(self.desc_type(), TYPE_INVALID);
            EntryKind::Empty
        }
    }

    fn physical_address(self, level: usize) -> Option<PhysAddr> {
        match self.kind(level) {
            EntryKind::Empty => None,
            EntryKind::Table => Some(PhysAddr::new(CoarseDesc::from_bits(self.0).base() << 10)),
            EntryKind::LargeLeaf => Some(PhysAddr::new(SectionDesc::from_bits(self.0).base() << 20)),
            EntryKind::Leaf => Some(PhysAddr::new(SmallPageDesc::from_bits(self.0).base() << 12)),
        }
    }

    fn set_physical_address(&mut self, pa: PhysAddr, level: usize) {
        match self.kind(level) {
            EntryKind::Table => {
                debug_assert!(pa.is_aligned(1 << 10));
                self.0 = CoarseDesc::from_bits(self.0).with_base(pa.as_u32() >> 10).into_bits();
            }
            EntryKind::LargeLeaf => {
                debug_assert!(pa.is_aligned(Armv7::LARGE_PAGE_SIZE));
                self.0 = SectionDesc::from_bits(self.0).with_base(pa.as_u32() >> 20).into_bits();
            }
            EntryKind::Leaf => {
                debug_assert!(pa.is_aligned(Armv7::PAGE_SIZE));
                self.0 = SmallPageDesc::from_bits(self.0).with_base(pa.as_u32() >> 12).into_bits();
            }
            EntryKind::Empty => debug_assert!(false, "empty entry carries no address"),
        }
    }

    fn new_table(pa: PhysAddr, level: usize) -> Self {
        debug_assert_eq!(level, 0);
        debug_assert!(pa.is_aligned(1 << 10));
        Self(
            CoarseDesc::new()
                .with_desc_type(TYPE_COARSE)
                .with_domain(0)
                .with_base(pa.as_u32() >> 10)
                .into_bits(),
        )
    }

    fn new_leaf(pa: PhysAddr, attrs: PageAttrs, level: usize) -> Self {
        let (apx, ap) = access_permissions(
            attrs.contains(PageAttrs::WRITABLE),
            attrs.contains(PageAttrs::USER),
        );
        let (c, b) = Self::cache_bits(attrs);
        let ng = !attrs.contains(PageAttrs::GLOBAL);
        if attrs.contains(PageAttrs::LARGE) {
            debug_assert_eq!(level, 0, "sections live at the first level");
            debug_assert!(pa.is_aligned(Armv7::LARGE_PAGE_SIZE));
            Self(
                SectionDesc::new()
                    .with_desc_type(TYPE_SECTION)
                    .with_b_bufferable(b)
                    .with_c_cacheable(c)
                    .with_domain(0)
                    .with_ap(ap)
                    .with_apx(apx)
                    .with_ng_not_global(ng)
                    .with_base(pa.as_u32() >> 20)
                    .into_bits(),
            )
        } else {
            debug_assert_eq!(level, super::leaf_level::<Armv7>());
            debug_assert!(pa.is_aligned(Armv7::PAGE_SIZE));
            Self(
                SmallPageDesc::new()
                    .with_small(true)
                    .with_b_bufferable(b)
                    .with_c_cacheable(c)
                    .with_ap(ap)
                    .with_apx(apx)
                    .with_ng_not_global(ng)
                    .with_base(pa.as_u32() >> 12)
                    .into_bits(),
            )
        }
    }

    fn attrs(self, level: usize) -> PageAttrs {
        let mut attrs = PageAttrs::empty();
        let (apx, ap, c, b, ng) = match self.kind(level) {
            EntryKind::Empty => return attrs,
            EntryKind::Table => {
                attrs.insert(PageAttrs::PRESENT);
                return attrs;
            }
            EntryKind::LargeLeaf => {
                let d = SectionDesc::from_bits(self.0);
                attrs.insert(PageAttrs::LARGE);
                (d.apx(), d.ap(), d.c_cacheable(), d.b_bufferable(), d.ng_not_global())
            }
            EntryKind::Leaf => {
                let d = SmallPageDesc::from_bits(self.0);
                (d.apx(), d.ap(), d.c_cacheable(), d.b_bufferable(), d.ng_not_global())
            }
        };
        let (writable, user) = decode_permissions(apx, ap);
        attrs.insert(PageAttrs::PRESENT);
        attrs.set(PageAttrs::WRITABLE, writable);
        attrs.set(PageAttrs::USER, user);
        attrs.set(PageAttrs::GLOBAL, !ng);
        attrs.set(PageAttrs::NO_CACHE, !c);
        attrs.set(PageAttrs::WRITE_THROUGH, c && !b);
        attrs
    }

    fn raw(self) -> u32 {
        self.0
    }
}

/// The first-level translation table: 4096 entries, 16 KiB-aligned as
/// `TTBR0` requires.
#[repr(C, align(16384))]
pub struct Armv7Root([Armv7Entry; 4096]);

impl RootTable for Armv7Root {
    type Entry = Armv7Entry;

    const NEW: Self = Self([Armv7Entry::EMPTY; 4096]);

    fn entries(&self) -> &[Armv7Entry] {
        &self.0
    }

    fn entries_mut(&mut self) -> &mut [Armv7Entry] {
        &mut self.0
    }
}

/// The ARMv7 architecture descriptor.
pub struct Armv7;

impl MmuArch for Armv7 {
    const NAME: &'static str = "armv7";

    const LEVEL_BITS: &'static [u32] = &[12, 8];

    const PAGE_SIZE: u32 = 4096;

    const LARGE_PAGE_SIZE: u32 = 1024 * 1024;

    type Entry = Armv7Entry;
    type Root = Armv7Root;

    unsafe fn load_translation_root(root: PhysAddr) {
        #[cfg(target_arch = "arm")]
        unsafe {
            Ttbr0::from_table_phys(root.as_u32()).store_unsafe();
            // Full TLB invalidate; nothing from the previous root may
            // linger.
            core::arch::asm!("mcr p15, 0, {}, c8, c7, 0", in(reg) 0u32, options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "arm"))]
        let _ = root;
    }

    unsafe fn set_mmu_enabled(enabled: bool) {
        #[cfg(target_arch = "arm")]
        unsafe {
            if enabled {
                // Domain 0 to client so descriptor permissions are checked.
                Dacr::new().with_d0(dacr::DOMAIN_CLIENT).store_unsafe();
            }
            Sctlr::load_unsafe().with_m_mmu_enable(enabled).store_unsafe();
        }
        #[cfg(not(target_arch = "arm"))]
        let _ = enabled;
    }

    fn mmu_enabled() -> bool {
        #[cfg(target_arch = "arm")]
        {
            unsafe { Sctlr::load_unsafe().m_mmu_enable() }
        }
        #[cfg(not(target_arch = "arm"))]
        {
            false
        }
    }

    fn flush_tlb_page(virt: VirtAddr) {
        #[cfg(target_arch = "arm")]
        unsafe {
            // TLBIMVA: invalidate by modified virtual address.
            core::arch::asm!(
                "mcr p15, 0, {}, c8, c7, 1",
                in(reg) virt.as_u32() & !(Self::PAGE_SIZE - 1),
                options(nostack, preserves_flags)
            );
        }
        #[cfg(not(target_arch = "arm"))]
        let _ = virt;
    }

    fn halt() -> ! {
        #[cfg(target_arch = "arm")]
        loop {
            unsafe {
                core::arch::asm!("cpsid if", "wfi", options(nomem, nostack));
            }
        }
        #[cfg(not(target_arch = "arm"))]
        panic!("cpu halted");
    }
}

/// Continue execution in the high kernel mapping; the ARM counterpart of
/// the IA-32 far jump. Loads the high alias of a local label into `pc`,
/// rebases `sp` and the frame pointer, then rewrites the saved frame
/// records (each `{fp, lr}` pair) through the identity alias.
///
/// # Safety
/// Must run exactly once, on the boot CPU, with both the identity and the
/// high mapping of the kernel image live and frame pointers enabled.
#[cfg(target_arch = "arm")]
pub(crate) unsafe fn relocate_execution() {
    let delta = graetz_info::KERNEL_RELOCATION_DELTA;
    let fp: u32;
    unsafe {
        core::arch::asm!(
            "ldr {tmp}, =2f",
            "bx  {tmp}",
            "2:",
            "add sp, sp, {delta}",
            "add r11, r11, {delta}",
            "mov {fp}, r11",
            delta = in(reg) delta,
            tmp = out(reg) _,
            fp = out(reg) fp,
        );
        let low_fp = (fp - delta) as usize;
        let top = (low_fp & !(Armv7::PAGE_SIZE as usize - 1)) + Armv7::PAGE_SIZE as usize;
        crate::bootstrap::relocate_frames(low_fp as *mut usize, top as *const usize, delta as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_encoding() {
        let attrs = PageAttrs::PRESENT | PageAttrs::WRITABLE | PageAttrs::GLOBAL | PageAttrs::LARGE;
        let e = Armv7Entry::new_leaf(PhysAddr::new(0x4010_0000), attrs, 0);
        assert_eq!(e.kind(0), EntryKind::LargeLeaf);
        assert_eq!(e.physical_address(0), Some(PhysAddr::new(0x4010_0000)));
        let decoded = e.attrs(0);
        assert!(decoded.contains(PageAttrs::WRITABLE));
        assert!(decoded.contains(PageAttrs::GLOBAL));
        assert!(!decoded.contains(PageAttrs::USER));
        assert!(decoded.contains(PageAttrs::LARGE));
    }

    #[test]
    fn small_page_encoding() {
        let attrs = PageAttrs::PRESENT | PageAttrs::USER;
        let e = Armv7Entry::new_leaf(PhysAddr::new(0x0020_3000), attrs, 1);
        assert_eq!(e.kind(1), EntryKind::Leaf);
        assert_eq!(e.physical_address(1), Some(PhysAddr::new(0x0020_3000)));
        let decoded = e.attrs(1);
        assert!(!decoded.contains(PageAttrs::WRITABLE));
        assert!(decoded.contains(PageAttrs::USER));
        assert!(!decoded.contains(PageAttrs::GLOBAL), "nG must be set");
    }

    #[test]
    fn coarse_table_encoding() {
        let e = Armv7Entry::new_table(PhysAddr::new(0x0011_8000), 0);
        assert_eq!(e.kind(0), EntryKind::Table);
        assert_eq!(e.physical_address(0), Some(PhysAddr::new(0x0011_8000)));
    }

    #[test]
    fn empty_is_all_zero() {
        assert_eq!(Armv7Entry::EMPTY.raw(), 0);
        assert!(Armv7Entry::EMPTY.is_empty());
        assert_eq!(Armv7Entry::EMPTY.kind(0), EntryKind::Empty);
        assert_eq!(Armv7Entry::EMPTY.kind(1), EntryKind::Empty);
    }

    #[test]
    fn address_rewrite_preserves_attributes() {
        let attrs = PageAttrs::PRESENT | PageAttrs::WRITABLE | PageAttrs::LARGE;
        let mut e = Armv7Entry::new_leaf(PhysAddr::new(0xC010_0000), attrs, 0);
        e.set_physical_address(PhysAddr::new(0x0010_0000), 0);
        assert_eq!(e.physical_address(0), Some(PhysAddr::new(0x0010_0000)));
        assert!(e.attrs(0).contains(PageAttrs::WRITABLE));
    }
}
