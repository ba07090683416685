use nix::unistd::{sysconf, SysconfVar};
use std::env;

lazy_static! {
    static ref SYSTEM_PAGE_SIZE: usize = page_size_init();
}

/// Set for children spawned under supervision so that nested invocations can
/// detect the situation.
pub fn running_under_scb() -> bool {
    env::var("RUNNING_UNDER_SCB").is_ok()
}

fn page_size_init() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) => sz as usize,
        _ => 4096,
    }
}

pub fn page_size() -> usize {
    *SYSTEM_PAGE_SIZE
}

pub fn ceil_page_size(size: usize) -> usize {
    (size + page_size() - 1) & !(page_size() - 1)
}

pub fn is_page_aligned(size: usize) -> bool {
    size & (page_size() - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_align() {
        let p = page_size();
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(p));
        assert!(!is_page_aligned(p + 1));
        assert_eq!(p, ceil_page_size(1));
        assert_eq!(p, ceil_page_size(p));
        assert_eq!(2 * p, ceil_page_size(p + 1));
    }
}
