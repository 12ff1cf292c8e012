//! Busy-wait hint issued by every spin loop in this crate.
//!
//! The instruction is picked per target architecture at build time. Targets
//! without a spin hint get an empty function, so spin loops still work there,
//! they just hammer the cache line a bit harder.

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use core::arch::asm;

/// true if [`cpu_relax`] emits an actual hint instruction on this target
pub const HAS_SPIN_HINT: bool = cfg!(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64",
    all(target_arch = "arm", target_feature = "v6"),
    target_arch = "riscv32",
    target_arch = "riscv64"
));

/// Tell the cpu we are spinning on a lock (`pause` on x86)
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[inline(always)]
pub fn cpu_relax() {
    // SAFETY: `pause` has no operands and touches neither memory nor flags
    unsafe {
        asm!("pause", options(nomem, nostack, preserves_flags));
    }
}

/// Tell the cpu we are spinning on a lock
#[cfg(any(
    target_arch = "aarch64",
    all(target_arch = "arm", target_feature = "v6"),
    target_arch = "riscv32",
    target_arch = "riscv64"
))]
#[inline(always)]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

/// No spin hint on this target, spin loops just retry
#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64",
    all(target_arch = "arm", target_feature = "v6"),
    target_arch = "riscv32",
    target_arch = "riscv64"
)))]
#[inline(always)]
pub fn cpu_relax() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relax_returns() {
        for _ in 0..1000 {
            cpu_relax();
        }
    }

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn hint_available() {
        assert!(HAS_SPIN_HINT);
    }

    // `yield` only exists from armv6 on
    #[test]
    #[cfg(all(target_arch = "arm", not(target_feature = "v6")))]
    fn no_hint_before_armv6() {
        assert!(!HAS_SPIN_HINT);
    }
}
