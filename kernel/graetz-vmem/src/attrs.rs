//! Architecture-independent page-attribute summary.

bitflags::bitflags! {
    /// The attributes a mapping can carry, abstracted over the two hardware
    /// encodings. The bit positions coincide with the IA-32 entry layout;
    /// the ARMv7 entry types translate to and from this set.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct PageAttrs: u32 {
        /// Entry is populated.
        const PRESENT       = 1 << 0;
        /// Write access allowed.
        const WRITABLE      = 1 << 1;
        /// Accessible from user mode.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const NO_CACHE      = 1 << 4;
        /// Set by the hardware on first access (IA-32 only).
        const ACCESSED      = 1 << 5;
        /// Set by the hardware on first write (IA-32 only).
        const DIRTY         = 1 << 6;
        /// The entry is a large-page leaf at directory level.
        const LARGE         = 1 << 7;
        /// Survives a translation-root reload; used for the kernel half,
        /// which is mapped identically in every address space.
        const GLOBAL        = 1 << 8;
    }
}

impl PageAttrs {
    /// The attribute set with the volatile hardware-managed bits and the
    /// page-size bit removed; two mappings are considered equivalent when
    /// their normalized attributes and targets agree.
    #[must_use]
    pub const fn normalized(self) -> Self {
        self.difference(Self::ACCESSED.union(Self::DIRTY).union(Self::LARGE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_drops_volatile_bits() {
        let a = PageAttrs::PRESENT | PageAttrs::WRITABLE | PageAttrs::DIRTY | PageAttrs::ACCESSED;
        let b = PageAttrs::PRESENT | PageAttrs::WRITABLE;
        assert_eq!(a.normalized(), b.normalized());
        assert_ne!(
            (b | PageAttrs::GLOBAL).normalized(),
            b.normalized(),
            "global must survive normalization"
        );
    }
}
