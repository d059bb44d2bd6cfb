// SPDX-License-Identifier: GPL-2.0
use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/// Lift RLIMIT_MEMLOCK so map creation works on kernels that still charge
/// BPF memory against it. Failure is returned for the caller to log.
pub fn try_set_rlimit_infinity() -> std::io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Pin the calling thread to `cpu`.
pub fn pin_current_thread(cpu: usize) -> std::io::Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(())
}

/// Wait until `fd` is readable or `timeout` elapses. Returns `Ok(true)` when
/// readable; EINTR is reported as a timeout so callers re-check shutdown.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> std::io::Result<bool> {
    let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, timeout) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN))),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sched::sched_getaffinity;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn wait_readable_times_out_then_fires() {
        let (mut a, b) = UnixStream::pair().unwrap();
        assert!(!wait_readable(b.as_fd(), Duration::from_millis(10)).unwrap());
        a.write_all(b"x").unwrap();
        assert!(wait_readable(b.as_fd(), Duration::from_millis(1000)).unwrap());
    }

    #[test]
    fn wait_readable_fires_on_peer_close() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(wait_readable(b.as_fd(), Duration::from_millis(1000)).unwrap());
    }

    #[test]
    fn pin_current_thread_restricts_affinity() {
        std::thread::spawn(|| {
            let allowed = sched_getaffinity(Pid::from_raw(0)).unwrap();
            let cpu = (0..CpuSet::count()).find(|&c| allowed.is_set(c).unwrap()).unwrap();
            pin_current_thread(cpu).unwrap();
            let now = sched_getaffinity(Pid::from_raw(0)).unwrap();
            for c in 0..CpuSet::count() {
                assert_eq!(now.is_set(c).unwrap(), c == cpu);
            }
        })
        .join()
        .unwrap();
    }

    #[test]
    fn pin_current_thread_rejects_out_of_range_cpu() {
        assert!(pin_current_thread(CpuSet::count()).is_err());
    }
}
