use logring_core::CallerId;
use std::mem::MaybeUninit;

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Record timestamp: nanoseconds on `CLOCK_MONOTONIC`, or 0 if the clock
/// cannot be read.
pub fn now_ns() -> u64 {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    // SAFETY: `ts` is valid for writes and is only read if the call succeeded.
    let ts = unsafe {
        if libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()) != 0 {
            return 0;
        }
        ts.assume_init()
    };
    ts.tv_sec as u64 * NSEC_PER_SEC + ts.tv_nsec as u64
}

/// Caller ID of the calling thread.
#[cfg(target_os = "linux")]
pub fn current_caller() -> CallerId {
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    CallerId::task(tid as u32)
}

/// Caller ID of the calling process (no portable thread IDs here).
#[cfg(not(target_os = "linux"))]
pub fn current_caller() -> CallerId {
    CallerId::task(std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn clock_advances_across_sleep() {
        let a = now_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(now_ns() - a >= 2_000_000);
    }

    #[test]
    fn threads_get_distinct_callers() {
        let here = current_caller();
        assert!(!here.is_cpu());
        #[cfg(target_os = "linux")]
        {
            let there = std::thread::spawn(current_caller).join().unwrap();
            assert_ne!(here, there);
        }
    }
}
