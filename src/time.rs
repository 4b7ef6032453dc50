//! Clock plumbing: the kernel stamps records with CLOCK_BOOTTIME
//! nanoseconds; userspace anchors them to wall time via the boot epoch.

fn clock_ns(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ret = unsafe { libc::clock_gettime(clock, &mut ts) };
    if ret != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Wall-clock nanoseconds of the boot instant.
pub fn boot_time_ns() -> u64 {
    let realtime = clock_ns(libc::CLOCK_REALTIME);
    let boottime = clock_ns(libc::CLOCK_BOOTTIME);
    realtime.saturating_sub(boottime)
}

/// Seconds since boot; the unit the kernel maps use for `update_time`.
pub fn uptime_secs() -> u64 {
    clock_ns(libc::CLOCK_BOOTTIME) / 1_000_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_time_is_in_the_past() {
        let boot = boot_time_ns();
        let now = clock_ns(libc::CLOCK_REALTIME);
        assert!(boot > 0);
        assert!(boot < now);
    }

    #[test]
    fn uptime_advances() {
        let a = uptime_secs();
        assert!(a > 0);
        assert!(uptime_secs() >= a);
    }
}
