use std::{
    fmt::{Display, Formatter, Result},
    ops::{Add, Sub},
};

/// An address in the supervised process's address space that is known to be
/// code, e.g. a syscall site or a trampoline entry. Never dereferenced on
/// this side of the trust boundary.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RemoteCodePtr {
    ptr: usize,
}

impl Default for RemoteCodePtr {
    fn default() -> Self {
        RemoteCodePtr::null()
    }
}

impl RemoteCodePtr {
    pub fn null() -> RemoteCodePtr {
        RemoteCodePtr { ptr: 0 }
    }

    pub fn from_val(val: usize) -> RemoteCodePtr {
        RemoteCodePtr { ptr: val }
    }

    pub fn as_usize(&self) -> usize {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }

    /// Value as it appears in a register, e.g. in `seccomp_data`'s
    /// instruction pointer field.
    pub fn register_value(&self) -> usize {
        self.ptr
    }

    /// Classic BPF loads are 32-bit wide, so filter programs compare against
    /// the low word of the instruction pointer. Making the truncation
    /// explicit here keeps the builder honest about it.
    pub fn low_word(&self) -> u32 {
        self.ptr as u32
    }
}

impl Display for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Add<usize> for RemoteCodePtr {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        Self::from_val(self.as_usize() + delta)
    }
}

impl Sub<usize> for RemoteCodePtr {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        Self::from_val(self.as_usize() - delta)
    }
}

impl Sub<RemoteCodePtr> for RemoteCodePtr {
    type Output = isize;

    fn sub(self, rhs: RemoteCodePtr) -> Self::Output {
        self.as_usize() as isize - rhs.as_usize() as isize
    }
}

impl From<usize> for RemoteCodePtr {
    fn from(addr: usize) -> Self {
        RemoteCodePtr::from_val(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_test() {
        let a = RemoteCodePtr::null();
        assert_eq!(0, a.as_usize());
        assert!(a.is_null());
    }

    #[test]
    fn low_word_truncates() {
        let a = RemoteCodePtr::from_val(0x1234_7000_0002);
        assert_eq!(0x7000_0002, a.low_word());
        assert_eq!("0x123470000002", format!("{}", a));
    }

    #[test]
    fn arithmetic() {
        let a = RemoteCodePtr::from_val(0x7000_0000);
        assert_eq!(0x7000_0002, (a + 2).as_usize());
        assert_eq!(2isize, (a + 2) - a);
    }
}
