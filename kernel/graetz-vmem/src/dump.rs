//! Verbose table dump: populated virtual ranges, coalesced.
//!
//! A run of pages coalesces when the virtual and physical addresses are
//! both contiguous and the attributes — minus the volatile
//! dirty/accessed bits and the page-size bit — agree.

use crate::PhysMapper;
use crate::address_space::AddressSpace;
use crate::arch::{EntryKind, MmuArch, TableEntry, leaf_level};
use crate::attrs::PageAttrs;

/// One coalesced mapping run.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct MappingRun {
    pub virt: u32,
    pub phys: u32,
    pub len: u64,
    pub attrs: PageAttrs,
}

impl MappingRun {
    fn extends_to(&self, virt: u32, phys: u32, attrs: PageAttrs) -> bool {
        u64::from(self.virt) + self.len == u64::from(virt)
            && u64::from(self.phys) + self.len == u64::from(phys)
            && self.attrs.normalized() == attrs.normalized()
    }
}

/// Accumulates pages into runs, handing finished runs to the sink.
struct Coalescer {
    run: Option<MappingRun>,
}

impl Coalescer {
    fn push(
        &mut self,
        emit: &mut impl FnMut(MappingRun),
        virt: u32,
        phys: u32,
        len: u32,
        attrs: PageAttrs,
    ) {
        match &mut self.run {
            Some(r) if r.extends_to(virt, phys, attrs) => r.len += u64::from(len),
            _ => {
                self.flush(emit);
                self.run = Some(MappingRun {
                    virt,
                    phys,
                    len: u64::from(len),
                    attrs,
                });
            }
        }
    }

    fn flush(&mut self, emit: &mut impl FnMut(MappingRun)) {
        if let Some(r) = self.run.take() {
            emit(r);
        }
    }
}

/// Attribute summary characters, one per flag, in the order
/// global, large, dirty, accessed, cached, write-through, user/kernel,
/// writable/read-only, present.
struct AttrChars(PageAttrs);

impl core::fmt::Display for AttrChars {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let a = self.0;
        let flag = |set: bool, yes: char| if set { yes } else { '-' };
        write!(
            f,
            "{}{}{}{}{}{}{}{}{}",
            flag(a.contains(PageAttrs::GLOBAL), 'G'),
            flag(a.contains(PageAttrs::LARGE), 'L'),
            flag(a.contains(PageAttrs::DIRTY), 'D'),
            flag(a.contains(PageAttrs::ACCESSED), 'A'),
            flag(!a.contains(PageAttrs::NO_CACHE), 'C'),
            flag(a.contains(PageAttrs::WRITE_THROUGH), 'T'),
            if a.contains(PageAttrs::USER) { 'U' } else { 'K' },
            if a.contains(PageAttrs::WRITABLE) { 'W' } else { 'R' },
            flag(a.contains(PageAttrs::PRESENT), 'P'),
        )
    }
}

impl<A: MmuArch> AddressSpace<A> {
    /// Print every populated range of this space through the `log` facade.
    pub fn dump<M: PhysMapper>(&self, mapper: &M) {
        log::debug!("===========================================");
        log::debug!("paging directory @ {:p}", self);
        self.visit_runs(mapper, |run| {
            let last = u64::from(run.virt) + run.len - 1;
            log::debug!(
                "{:#010x}...{last:#010x} -> {:#010x} {}",
                run.virt,
                run.phys,
                AttrChars(run.attrs)
            );
        });
        log::debug!("===========================================");
    }

    /// Walk the populated leaves in ascending virtual order, handing
    /// coalesced runs to `emit`.
    pub(crate) fn visit_runs<M: PhysMapper>(&self, mapper: &M, mut emit: impl FnMut(MappingRun)) {
        let leaf = leaf_level::<A>();
        let mut co = Coalescer { run: None };

        for (i, entry) in self.root_entries().iter().enumerate() {
            let span_va = i as u32 * A::LARGE_PAGE_SIZE;
            match entry.kind(0) {
                EntryKind::Empty => co.flush(&mut emit),
                EntryKind::LargeLeaf => {
                    let phys = entry
                        .physical_address(0)
                        .expect("populated entry carries an address");
                    co.push(
                        &mut emit,
                        span_va,
                        phys.as_u32(),
                        A::LARGE_PAGE_SIZE,
                        entry.attrs(0),
                    );
                }
                EntryKind::Table => {
                    let table = entry
                        .physical_address(0)
                        .expect("populated entry carries an address");
                    let count = 1usize << A::LEVEL_BITS[leaf];
                    for j in 0..count {
                        let slot = table + (j * size_of::<A::Entry>()) as u32;
                        let leaf_entry = *unsafe { mapper.phys_to_mut::<A::Entry>(slot) };
                        if leaf_entry.kind(leaf) == EntryKind::Leaf {
                            let phys = leaf_entry
                                .physical_address(leaf)
                                .expect("populated entry carries an address");
                            co.push(
                                &mut emit,
                                span_va + j as u32 * A::PAGE_SIZE,
                                phys.as_u32(),
                                A::PAGE_SIZE,
                                leaf_entry.attrs(leaf),
                            );
                        } else {
                            co.flush(&mut emit);
                        }
                    }
                }
                EntryKind::Leaf => unreachable!("leaf entries exist only at the leaf level"),
            }
        }
        co.flush(&mut emit);
    }
}
