//! # Paging Bootstrap
//!
//! The one-shot procedure that takes the CPU from identity-mapped physical
//! execution into the high-half virtual kernel. It runs with the MMU off,
//! executing from the low alias of the image, and ends with execution,
//! stack and saved return addresses all pointing into the window at
//! [`layout::KERNEL_CODE`].
//!
//! The steps, in order:
//!
//! 1. reach the kernel address-space singleton through its *physical*
//!    alias and establish its build-produced nascent state (root entries
//!    holding the link-time addresses of the image-resident boot tables),
//! 2. rewrite those placeholders to physical addresses
//!    ([`AddressSpace::adjust_table_addresses`]),
//! 3. identity-map the kernel image, so the instruction after MMU-enable
//!    still fetches,
//! 4. map the image high: text and constants read-only, data writable,
//! 5. load the translation root and switch the MMU on,
//! 6. jump to the high alias, rebase the stack registers and rewrite every
//!    saved frame link and return address on the boot stack,
//! 7. tear the identity alias back down.
//!
//! Any failure before the MMU is on is fatal; there is nowhere to return
//! to, so the CPU halts.

use core::sync::atomic::{AtomicBool, Ordering};

use graetz_info::{BootDataPtr, layout};
use graetz_sync::SpinLock;

use crate::address_space::{AddressSpace, MapError};
use crate::addresses::{PhysAddr, VirtAddr};
use crate::arch::{BootArch, MmuArch};
use crate::{PageAllocator, PhysMapper};

#[cfg(target_arch = "arm")]
use crate::arch::armv7::relocate_execution;
#[cfg(target_arch = "x86")]
use crate::arch::ia32::relocate_execution;

/// The kernel's address space type on this machine.
pub type KernelSpace = AddressSpace<BootArch>;

/// The singleton kernel address space, statically reserved in the image.
///
/// Its `map` contract is single-writer; the lock is what serializes the
/// writers once more than one CPU exists.
pub static KERNEL_SPACE: SpinLock<KernelSpace> = SpinLock::new(KernelSpace::nascent_kernel());

/// The kernel address space.
#[must_use]
pub fn kernel() -> &'static SpinLock<KernelSpace> {
    &KERNEL_SPACE
}

/// Second-level tables for the kernel window, reserved in the image so the
/// high mapping never needs the allocator. One table covers one
/// large-page span.
const BOOT_TABLE_COUNT: usize =
    layout::KERNEL_IMAGE_SIZE.div_ceil(BootArch::LARGE_PAGE_SIZE) as usize;

#[repr(C, align(4096))]
struct BootTable([u8; 4096]);

#[unsafe(link_section = ".bss.boot")]
static mut BOOT_TABLES: [BootTable; BOOT_TABLE_COUNT] =
    [const { BootTable([0; 4096]) }; BOOT_TABLE_COUNT];

static INIT_DONE: AtomicBool = AtomicBool::new(false);

/// The virtual-to-physical translation in force for the kernel space.
///
/// While the MMU is off, physical addresses are dereferenced directly;
/// afterwards, addresses inside the image are reached through the high
/// alias. Every table the kernel walker follows lives in the image (the
/// pre-linked boot tables and the boot allocator's pool), so this covers
/// the walk.
pub struct KernelImageMapper;

impl PhysMapper for KernelImageMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
        let va = if BootArch::mmu_enabled() && layout::in_kernel_image_phys(pa.as_u32()) {
            pa.as_u32() + layout::KERNEL_RELOCATION_DELTA
        } else {
            pa.as_u32()
        };
        unsafe { &mut *(va as usize as *mut T) }
    }
}

/// Perform the paging bootstrap exactly once.
///
/// `boot_data` is the bootloader's opaque blob; it is carried through
/// untouched for the bootloader parser. `alloc` is the page oracle the
/// identity mapping draws its intermediate tables from.
///
/// # Safety
/// Must be called once, on the boot CPU, with the MMU off, from code
/// executing in the identity-mapped low alias of the kernel image, with
/// frame pointers enabled.
pub unsafe fn init<P: PageAllocator>(boot_data: BootDataPtr, alloc: &mut P) {
    // Statics live at their linked (high) addresses, which do not
    // translate yet; until the jump they are reached through their
    // physical alias.
    let init_done: &AtomicBool = unsafe { &*phys_alias(&raw const INIT_DONE) };
    if init_done.swap(true, Ordering::AcqRel) {
        log::error!("paging bootstrap ran twice");
        BootArch::halt();
    }

    let mapper = KernelImageMapper;
    {
        let space: &SpinLock<KernelSpace> = unsafe { &*phys_alias(&raw const KERNEL_SPACE) };
        let mut kernel = space.lock();

        kernel.link_boot_tables(&boot_table_placeholders());
        kernel.adjust_table_addresses();
        if let Err(err) = install_kernel_mappings(&mut *kernel, &mapper, alloc) {
            fatal(err);
        }
        unsafe {
            kernel.activate();
            BootArch::set_mmu_enabled(true);
        }
    }

    #[cfg(any(target_arch = "x86", target_arch = "arm"))]
    unsafe {
        relocate_execution();
    }

    // Execution, stack and return addresses are high now; give the log
    // facade its backend so the teardown trace and the dump below reach
    // the debug console. A backend installed earlier stays in place.
    #[cfg(feature = "verbose")]
    let _ = graetz_qemu::BootLogger::install(log::LevelFilter::Trace);

    // The identity alias has served its purpose.
    let mut kernel = KERNEL_SPACE.lock();
    if let Err(err) = kernel.unmap(
        &mapper,
        VirtAddr::new(layout::PHYSICAL_ADDR),
        layout::KERNEL_IMAGE_SIZE,
    ) {
        fatal(err);
    }
    #[cfg(feature = "verbose")]
    kernel.dump(&mapper);
    log::info!(
        "paging enabled ({}), kernel in the high half, boot data @ {boot_data:p}",
        BootArch::NAME
    );
}

/// Map the kernel image the way the transition needs it: the identity
/// alias writable (it is torn down again before anything could abuse it),
/// the high alias split into a read-only and a writable region along the
/// linker's section boundaries.
fn install_kernel_mappings<A: MmuArch, M: PhysMapper, P: PageAllocator>(
    kernel: &mut AddressSpace<A>,
    mapper: &M,
    alloc: &mut P,
) -> Result<(), MapError> {
    kernel.map(
        mapper,
        alloc,
        VirtAddr::new(layout::PHYSICAL_ADDR),
        PhysAddr::new(layout::PHYSICAL_ADDR),
        layout::KERNEL_IMAGE_SIZE,
        true,
        false,
    )?;

    let read_only = layout::KERNEL_READ_WRITE - layout::KERNEL_CODE;
    kernel.map(
        mapper,
        alloc,
        VirtAddr::new(layout::KERNEL_CODE),
        PhysAddr::new(layout::PHYSICAL_ADDR),
        read_only,
        false,
        false,
    )?;
    kernel.map(
        mapper,
        alloc,
        VirtAddr::new(layout::KERNEL_READ_WRITE),
        PhysAddr::new(layout::PHYSICAL_ADDR + read_only),
        layout::KERNEL_END - layout::KERNEL_READ_WRITE,
        true,
        false,
    )?;
    Ok(())
}

/// Rewrite the chain of saved frame records on the boot stack so that
/// returning out of the bootstrap lands in the high mapping.
///
/// `fp` is the innermost frame record, `top` the first address past the
/// stack page; both are expressed in the same (pre-relocation) alias. Each
/// record holds the caller's frame link with the return address one word
/// above — the layout both supported machines produce with frame pointers
/// enabled.
///
/// # Safety
/// Every address in `[fp, top)` reachable over the frame chain must be
/// readable and writable, and both the old and the relocated alias of the
/// stack must be mapped while this runs.
pub(crate) unsafe fn relocate_frames(mut fp: *mut usize, top: *const usize, delta: usize) {
    while (fp as usize) < (top as usize) {
        let link = unsafe { *fp };
        // A null or non-ascending link ends the chain (the outermost boot
        // frame).
        if link == 0 || link <= fp as usize {
            break;
        }
        unsafe {
            *fp = link + delta;
            *fp.add(1) += delta;
        }
        fp = link as *mut usize;
    }
}

/// The physical alias of a linked-high static, valid while the MMU is off.
fn phys_alias<T>(high: *const T) -> *mut T {
    (high as usize - layout::KERNEL_RELOCATION_DELTA as usize) as *mut T
}

/// Link-time addresses of the boot tables; these are the virtual
/// placeholders the nascent root carries.
fn boot_table_placeholders() -> [VirtAddr; BOOT_TABLE_COUNT] {
    let base = (&raw const BOOT_TABLES) as usize;
    core::array::from_fn(|i| VirtAddr::new((base + i * size_of::<BootTable>()) as u32))
}

fn fatal(err: MapError) -> ! {
    log::error!("paging bootstrap failed: {err}");
    BootArch::halt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::SpaceState;
    use crate::arch::{Armv7, Ia32, TableEntry, level_index};
    use crate::attrs::PageAttrs;
    use crate::emulated::{BumpAlloc, EmulatedMemory};

    /// Canonical boot-table placement: inside the writable image region.
    const TABLE_VA: u32 = 0xC001_C000;

    fn bootstrapped_kernel<A: MmuArch>(
        mem: &EmulatedMemory,
        alloc: &mut BumpAlloc,
    ) -> AddressSpace<A> {
        let mut kernel = AddressSpace::<A>::nascent_kernel();
        kernel.link_boot_tables(&[VirtAddr::new(TABLE_VA)]);
        kernel.adjust_table_addresses();
        install_kernel_mappings(&mut kernel, mem, alloc).expect("bootstrap maps");
        unsafe { kernel.activate() };
        kernel
    }

    #[test]
    fn adjustment_rewrites_placeholders_to_physical() {
        let mut kernel = AddressSpace::<Ia32>::nascent_kernel();
        kernel.link_boot_tables(&[VirtAddr::new(TABLE_VA)]);

        let slot = level_index::<Ia32>(VirtAddr::new(layout::KERNEL_CODE), 0);
        let placeholder = kernel.root_entries()[slot];
        assert_eq!(
            placeholder.physical_address(0),
            Some(PhysAddr::new(TABLE_VA)),
            "nascent root carries the virtual address"
        );

        kernel.adjust_table_addresses();
        assert_eq!(kernel.state(), SpaceState::Adjusted);
        let adjusted = kernel.root_entries()[slot];
        assert_eq!(
            adjusted.physical_address(0),
            Some(PhysAddr::new(TABLE_VA - layout::KERNEL_RELOCATION_DELTA))
        );
    }

    #[test]
    fn bootstrap_translations_and_permissions() {
        let mem = EmulatedMemory::new();
        let mut alloc = BumpAlloc::new(0x0200_0000, 0x0210_0000);
        let kernel = bootstrapped_kernel::<Ia32>(&mem, &mut alloc);

        // the statically linked window translates by the relocation delta
        assert_eq!(
            kernel.translate(&mem, VirtAddr::new(0xC000_0000)),
            Some(PhysAddr::new(0x0010_0000))
        );
        assert_eq!(
            kernel.translate(&mem, VirtAddr::new(0xC001_0000)),
            Some(PhysAddr::new(0x0011_0000))
        );
        assert_eq!(
            kernel.translate(&mem, VirtAddr::new(0xC001_FFFF)),
            Some(PhysAddr::new(0x0011_FFFF))
        );

        // code is read-only, data writable, both global
        let (pa, attrs, _) = kernel
            .lookup_raw(&mem, VirtAddr::new(0xC000_0000))
            .expect("code page mapped");
        assert_eq!(pa, PhysAddr::new(0x0010_0000));
        assert!(!attrs.contains(PageAttrs::WRITABLE));
        assert!(attrs.contains(PageAttrs::GLOBAL));

        let (pa, attrs, _) = kernel
            .lookup_raw(&mem, VirtAddr::new(0xC001_0000))
            .expect("data page mapped");
        assert_eq!(pa, PhysAddr::new(0x0011_0000));
        assert!(attrs.contains(PageAttrs::WRITABLE));
        assert!(attrs.contains(PageAttrs::GLOBAL));

        // the identity alias is writable and not global
        let (_, attrs, _) = kernel
            .lookup_raw(&mem, VirtAddr::new(0x0010_0000))
            .expect("identity page mapped");
        assert!(attrs.contains(PageAttrs::WRITABLE));
        assert!(!attrs.contains(PageAttrs::GLOBAL));
    }

    #[test]
    fn identity_alias_is_torn_down_after_relocation() {
        let mem = EmulatedMemory::new();
        let mut alloc = BumpAlloc::new(0x0200_0000, 0x0210_0000);
        let mut kernel = bootstrapped_kernel::<Ia32>(&mem, &mut alloc);

        assert_eq!(
            kernel.translate(&mem, VirtAddr::new(0x0010_0000)),
            Some(PhysAddr::new(0x0010_0000)),
            "identity alive during the transition"
        );

        kernel
            .unmap(
                &mem,
                VirtAddr::new(layout::PHYSICAL_ADDR),
                layout::KERNEL_IMAGE_SIZE,
            )
            .expect("teardown");

        assert_eq!(kernel.translate(&mem, VirtAddr::new(0x0010_0000)), None);
        // the window keeps translating regardless of table contents
        assert_eq!(
            kernel.translate(&mem, VirtAddr::new(0xC000_0000)),
            Some(PhysAddr::new(0x0010_0000))
        );
    }

    #[test]
    fn armv7_bootstrap_translations() {
        let mem = EmulatedMemory::new();
        let mut alloc = BumpAlloc::new(0x0200_0000, 0x0210_0000);
        let kernel = bootstrapped_kernel::<Armv7>(&mem, &mut alloc);

        assert_eq!(
            kernel.translate(&mem, VirtAddr::new(0xC001_FFFF)),
            Some(PhysAddr::new(0x0011_FFFF))
        );
        let (_, attrs, _) = kernel
            .lookup_raw(&mem, VirtAddr::new(0xC000_0000))
            .expect("code page mapped");
        assert!(!attrs.contains(PageAttrs::WRITABLE));
        assert!(attrs.contains(PageAttrs::GLOBAL));
    }

    #[test]
    fn kernel_reverse_lookup_prefers_the_image_window() {
        let mem = EmulatedMemory::new();
        let mut alloc = BumpAlloc::new(0x0200_0000, 0x0210_0000);
        let kernel = bootstrapped_kernel::<Ia32>(&mem, &mut alloc);

        assert_eq!(
            kernel.virt_addr_of(&mem, PhysAddr::new(0x0010_1234)),
            Some(VirtAddr::new(0xC000_1234))
        );
    }

    #[test]
    fn frame_chain_relocation() {
        const WS: usize = size_of::<usize>();
        let delta = 0x0100_0000usize;

        let mut stack = [0usize; 64];
        let base = stack.as_mut_ptr() as usize;
        // three frames: 4 -> 20 -> 40, the outermost with a null link
        stack[4] = base + 20 * WS;
        stack[5] = 0x0010_1234;
        stack[20] = base + 40 * WS;
        stack[21] = 0x0010_2468;
        stack[40] = 0;
        stack[41] = 0x0010_9999;

        let top = (base + 64 * WS) as *const usize;
        unsafe { relocate_frames((base + 4 * WS) as *mut usize, top, delta) };

        assert_eq!(stack[4], base + 20 * WS + delta);
        assert_eq!(stack[5], 0x0010_1234 + delta);
        assert_eq!(stack[20], base + 40 * WS + delta);
        assert_eq!(stack[21], 0x0010_2468 + delta);
        // the outermost frame ends the chain untouched
        assert_eq!(stack[40], 0);
        assert_eq!(stack[41], 0x0010_9999);
    }

    #[test]
    fn frame_chain_stops_at_the_stack_top() {
        const WS: usize = size_of::<usize>();
        let delta = 0x10usize;

        let mut stack = [0usize; 8];
        let base = stack.as_mut_ptr() as usize;
        let top = (base + 8 * WS) as *const usize;
        // the link escapes the stack page; the walk must not follow it
        stack[0] = base + 100 * WS;
        stack[1] = 0x4000;

        unsafe { relocate_frames(base as *mut usize, top, delta) };
        assert_eq!(stack[0], base + 100 * WS + delta);
        assert_eq!(stack[1], 0x4000 + delta);
    }
}
