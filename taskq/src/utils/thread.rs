use std::io;

/// Pins the calling thread to `cpus`.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_affinity(cpus: &[usize]) -> io::Result<()> {
    if cpus.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty cpu set"));
    }

    // Safety: cpu_set_t is a plain bitmask, all zeroes is the empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };

    for &cpu in cpus {
        if cpu >= libc::CPU_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cpu {cpu} is out of range"),
            ));
        }
        // Safety: `cpu` is within the bounds of the set.
        unsafe { libc::CPU_SET(cpu, &mut set) };
    }

    // Safety: pid 0 targets the calling thread, `set` outlives the call.
    let ret = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_affinity(_cpus: &[usize]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "cpu affinity is only supported on linux",
    ))
}

/// Sets the niceness of the calling thread. On Linux niceness is a per-thread
/// attribute, addressed by the thread id.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_nice(nice: i32) -> io::Result<()> {
    // Safety: plain syscalls on the calling thread.
    let ret = unsafe {
        let tid = libc::gettid();
        libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice)
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_nice(_nice: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "per-thread priority is only supported on linux",
    ))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::thread;

    fn current_nice() -> i32 {
        unsafe { libc::getpriority(libc::PRIO_PROCESS, libc::gettid() as libc::id_t) }
    }

    #[test]
    fn test_raise_nice_on_own_thread() {
        // Raising niceness never needs privileges, and only affects this thread.
        let before = thread::spawn(current_nice).join().unwrap();

        let after = thread::spawn(move || {
            set_current_thread_nice(before + 1).unwrap();
            current_nice()
        })
        .join()
        .unwrap();

        assert_eq!(after, (before + 1).min(19));
    }

    #[test]
    fn test_affinity_rejects_bad_input() {
        assert!(set_current_thread_affinity(&[]).is_err());
        assert!(set_current_thread_affinity(&[libc::CPU_SETSIZE as usize]).is_err());
    }

    #[test]
    fn test_affinity_to_allowed_cpu() {
        // Pin to a cpu the process is already allowed on.
        let cpu = unsafe { libc::sched_getcpu() };
        assert!(cpu >= 0);

        thread::spawn(move || {
            set_current_thread_affinity(&[cpu as usize]).unwrap();
            assert_eq!(unsafe { libc::sched_getcpu() }, cpu);
        })
        .join()
        .unwrap();
    }
}
