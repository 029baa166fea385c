#[cfg(all(feature = "asm", target_arch = "arm"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// SCTLR — ARMv7 System Control Register (CP15 c1, opcode 0).
///
/// Only the bits the paging code manipulates are named; everything else is
/// carried through unchanged.
#[bitfield(u32)]
pub struct Sctlr {
    /// Bit 0 — M: MMU enable.
    pub m_mmu_enable: bool,

    /// Bit 1 — A: strict alignment fault checking.
    pub a_alignment_check: bool,

    /// Bit 2 — C: data and unified cache enable.
    pub c_data_cache: bool,

    /// Bits 3–11 — Implementation defined / reserved; preserved.
    #[bits(9, default = 0)]
    pub passthrough_3_11: u16,

    /// Bit 12 — I: instruction cache enable.
    pub i_instruction_cache: bool,

    /// Bit 13 — V: high exception vectors.
    pub v_high_vectors: bool,

    /// Bits 14–31 — Preserved as loaded, written back unchanged.
    #[bits(18, default = 0)]
    pub passthrough_14_31: u32,
}

#[cfg(all(feature = "asm", target_arch = "arm"))]
impl LoadRegisterUnsafe for Sctlr {
    unsafe fn load_unsafe() -> Self {
        let sctlr: u32;
        unsafe {
            core::arch::asm!("mrc p15, 0, {}, c1, c0, 0", out(reg) sctlr, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(sctlr)
    }
}

#[cfg(all(feature = "asm", target_arch = "arm"))]
impl StoreRegisterUnsafe for Sctlr {
    unsafe fn store_unsafe(self) {
        let sctlr = self.into_bits();
        unsafe {
            core::arch::asm!(
                "mcr p15, 0, {}, c1, c0, 0",
                "isb",
                in(reg) sctlr,
                options(nostack, preserves_flags)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmu_enable_bit() {
        assert_eq!(Sctlr::new().with_m_mmu_enable(true).into_bits(), 1);
    }
}
