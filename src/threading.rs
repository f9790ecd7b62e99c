//! CPU affinity and realtime priority helpers for the dispatcher thread.
//!
//! The dispatcher busy-polls, so it must own its CPU: it is pinned to the
//! configured core and raised to the highest `SCHED_FIFO` priority. Both
//! calls degrade to no-ops where the platform or privileges do not allow
//! them; the scheduler still works, just with weaker latency behaviour.

/// Pin the current thread to `core_id`.
///
/// Linux only (`pthread_setaffinity_np`); silently does nothing elsewhere
/// or when the operation is not permitted.
pub fn pin_current_thread(core_id: usize) {
    #[cfg(target_os = "linux")]
    unsafe {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_ZERO};
        let mut set: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(core_id, &mut set);
        let _ = pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
    }
}

/// Raise the current thread to the top realtime priority.
///
/// On Linux this requests `SCHED_FIFO` just below the kernel's ceiling,
/// which needs `CAP_SYS_NICE` (or root); failures are ignored. On macOS the
/// thread is promoted to the user-interactive QoS class instead.
pub fn set_realtime_priority() {
    #[cfg(target_os = "linux")]
    unsafe {
        use libc::{pthread_self, pthread_setschedparam, sched_get_priority_max, sched_param, SCHED_FIFO};
        let mut param: sched_param = std::mem::zeroed();
        let max = sched_get_priority_max(SCHED_FIFO);
        param.sched_priority = if max > 1 { max - 1 } else { 1 };
        let _ = pthread_setschedparam(pthread_self(), SCHED_FIFO, &param);
    }
    #[cfg(target_os = "macos")]
    unsafe {
        const QOS_CLASS_USER_INTERACTIVE: u32 = 0x21;
        extern "C" {
            fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
        }
        let _ = pthread_set_qos_class_self_np(QOS_CLASS_USER_INTERACTIVE, 0);
    }
}
