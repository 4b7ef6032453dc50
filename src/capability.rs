//! Kernel capability checks performed before anything is loaded.
//!
//! The tracer requires Linux >= 4.14. BTF presence is reported for
//! diagnostics only; the loopback offset inference stays the authority
//! on struct offsets either way.

use std::path::Path;

use crate::error::TracerError;

const MIN_MAJOR: u32 = 4;
const MIN_MINOR: u32 = 14;

/// Refuse to start on kernels older than 4.14.
pub fn check_kernel_version() -> Result<(u32, u32), TracerError> {
    let banner = std::fs::read_to_string("/proc/version")
        .map_err(|_| TracerError::KernelVersionUnknown)?;
    let (major, minor) = kernel_release(&banner).ok_or(TracerError::KernelVersionUnknown)?;

    if supported(major, minor) {
        Ok((major, minor))
    } else {
        Err(TracerError::KernelNotSupported(major, minor))
    }
}

#[inline]
fn supported(major: u32, minor: u32) -> bool {
    (major, minor) >= (MIN_MAJOR, MIN_MINOR)
}

/// Kernel release as (major, minor) from a `/proc/version` banner.
///
/// The banner normally opens with the release right away
/// ("Linux version 4.19.90-..."), but vendor builds sometimes put extra
/// words in front, so the release token is taken as whatever follows the
/// "version" keyword, wherever that sits. Release fields may carry
/// non-numeric suffixes ("14-arch1"); only the numeric prefix counts.
pub fn kernel_release(banner: &str) -> Option<(u32, u32)> {
    let mut words = banner.split_whitespace();
    words.find(|w| w.eq_ignore_ascii_case("version"))?;
    let release = words.next()?;

    let mut fields = release.split('.');
    let major: u32 = fields.next()?.parse().ok()?;
    let minor = numeric_prefix(fields.next()?)?;
    Some((major, minor))
}

/// Leading digits of a release field, if any.
fn numeric_prefix(field: &str) -> Option<u32> {
    let end = field
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(field.len());
    field[..end].parse().ok()
}

/// Whether the kernel exports its type info (`/sys/kernel/btf/vmlinux`).
/// Logged at startup; a CO-RE build could use it, the runtime inference
/// does not need it.
pub fn btf_present() -> bool {
    Path::new("/sys/kernel/btf/vmlinux").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_from_stock_banner() {
        let b = "Linux version 4.19.90-2102.2.0.0062.oe1.aarch64 (abuild@obs-worker-004)";
        assert_eq!(kernel_release(b), Some((4, 19)));
    }

    #[test]
    fn release_from_el_kernel() {
        // The oldest release the tracer accepts ships in EL7 variants.
        let b = "Linux version 4.14.0-115.el7a.0.1.aarch64 (mockbuild@arm-buildhost)";
        assert_eq!(kernel_release(b), Some((4, 14)));
    }

    #[test]
    fn release_minor_keeps_numeric_prefix_only() {
        assert_eq!(
            kernel_release("Linux version 5.10.0-60.18.0.50.oe2203.x86_64"),
            Some((5, 10))
        );
        assert_eq!(kernel_release("Linux version 6.1.0-rc3+"), Some((6, 1)));
    }

    #[test]
    fn release_found_after_leading_vendor_words() {
        let b = "Linux (builder@kunpeng-07) version 4.18.0-80.7.1";
        assert_eq!(kernel_release(b), Some((4, 18)));
    }

    #[test]
    fn malformed_banners_yield_none() {
        let bad = [
            "",
            "Linux 4.19.90",
            "Linux version",
            "Linux version x.y",
            "Linux version 5",
        ];
        for b in bad {
            assert_eq!(kernel_release(b), None, "banner {b:?}");
        }
    }

    #[test]
    fn gate_boundary_sits_at_4_14() {
        assert!(supported(4, 14));
        assert!(supported(4, 18));
        assert!(supported(5, 2));
        assert!(supported(6, 6));
        assert!(!supported(4, 13));
        assert!(!supported(3, 10));
    }
}
