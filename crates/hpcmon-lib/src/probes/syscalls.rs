//! x86_64 syscall numbering and classification

use std::borrow::Cow;

/// Names for syscall numbers 0..=100, indexed by number
const LOW_TABLE: [&str; 101] = [
    "read", "write", "open", "close", "stat", "fstat", "lstat", "poll", "lseek", "mmap",
    "mprotect", "munmap", "brk", "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "ioctl",
    "pread64", "pwrite64", "readv", "writev", "access", "pipe", "select", "sched_yield",
    "mremap", "msync", "mincore", "madvise", "shmget", "shmat", "shmctl", "dup", "dup2",
    "pause", "nanosleep", "getitimer", "alarm", "setitimer", "getpid", "sendfile", "socket",
    "connect", "accept", "sendto", "recvfrom", "sendmsg", "recvmsg", "shutdown", "bind",
    "listen", "getsockname", "getpeername", "socketpair", "setsockopt", "getsockopt", "clone",
    "fork", "vfork", "execve", "exit", "wait4", "kill", "uname", "semget", "semop", "semctl",
    "shmdt", "msgget", "msgsnd", "msgrcv", "msgctl", "fcntl", "flock", "fsync", "fdatasync",
    "truncate", "ftruncate", "getdents", "getcwd", "chdir", "fchdir", "rename", "mkdir",
    "rmdir", "creat", "link", "unlink", "symlink", "readlink", "chmod", "fchmod", "chown",
    "fchown", "lchown", "umask", "gettimeofday", "getrlimit", "getrusage", "sysinfo", "times",
];

/// Frequently seen syscalls above the dense range
const HIGH_TABLE: &[(u32, &str)] = &[
    (186, "gettid"),
    (202, "futex"),
    (217, "getdents64"),
    (228, "clock_gettime"),
    (230, "clock_nanosleep"),
    (231, "exit_group"),
    (232, "epoll_wait"),
    (233, "epoll_ctl"),
    (257, "openat"),
    (262, "newfstatat"),
    (270, "pselect6"),
    (271, "ppoll"),
    (281, "epoll_pwait"),
    (288, "accept4"),
    (291, "epoll_create1"),
    (292, "dup3"),
    (293, "pipe2"),
    (295, "preadv"),
    (296, "pwritev"),
    (299, "recvmmsg"),
    (302, "prlimit64"),
    (307, "sendmmsg"),
    (318, "getrandom"),
    (332, "statx"),
    (435, "clone3"),
];

/// Coarse category used to attribute syscall time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallClass {
    Io,
    Net,
    Other,
}

pub fn classify(id: u32) -> SyscallClass {
    match id {
        // read/write/open/close/stat family, positioned and vectored I/O, lseek, sync
        0..=6 | 8 | 17..=20 | 40 | 74..=77 | 217 | 257 | 262 | 295 | 296 | 332 => {
            SyscallClass::Io
        }
        41..=55 | 288 | 299 | 307 => SyscallClass::Net,
        _ => SyscallClass::Other,
    }
}

pub fn is_io(id: u32) -> bool {
    classify(id) == SyscallClass::Io
}

pub fn is_net(id: u32) -> bool {
    classify(id) == SyscallClass::Net
}

/// Render a syscall number; unknown numbers become `syscall_<id>`
pub fn name(id: u32) -> Cow<'static, str> {
    if let Some(known) = LOW_TABLE.get(id as usize).copied() {
        return Cow::Borrowed(known);
    }
    match HIGH_TABLE.iter().find(|(nr, _)| *nr == id) {
        Some(&(_, known)) => Cow::Borrowed(known),
        None => Cow::Owned(format!("syscall_{id}")),
    }
}

/// Reverse lookup, also accepting the `syscall_<id>` form
pub fn id_of(name: &str) -> Option<u32> {
    if let Some(pos) = LOW_TABLE.iter().position(|n| *n == name) {
        return Some(pos as u32);
    }
    if let Some((nr, _)) = HIGH_TABLE.iter().find(|(_, n)| *n == name) {
        return Some(*nr);
    }
    name.strip_prefix("syscall_")?.parse().ok()
}
