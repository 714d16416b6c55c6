//! UID/GID queries for the calling process

/// Get current real UID
pub fn get_uid() -> u32 {
    unsafe { libc::getuid() }
}

/// Get current effective UID
pub fn get_euid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Get current real GID
pub fn get_gid() -> u32 {
    unsafe { libc::getgid() }
}

/// Get current effective GID
pub fn get_egid() -> u32 {
    unsafe { libc::getegid() }
}

/// Check if running with an effective uid of root
pub fn is_root() -> bool {
    get_euid() == 0
}

/// True when the process was started by root, even if it has since dropped
/// its effective identity
pub fn started_elevated() -> bool {
    get_uid() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_queries_are_consistent() {
        assert_eq!(is_root(), get_euid() == 0);
        assert_eq!(started_elevated(), get_uid() == 0);
    }

    #[test]
    fn test_gid_queries_do_not_panic() {
        let _ = get_gid();
        let _ = get_egid();
    }
}
