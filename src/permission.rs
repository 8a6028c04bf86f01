//! Wraps the OS page-protection primitive and reflects the change into
//! the owning `PageEntry` (§4.E).

use crate::error::{DsmError, Result};
use crate::page::{PageState, PageTable};
use crate::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

impl Protection {
    fn to_prot(self) -> libc::c_int {
        match self {
            Protection::None => libc::PROT_NONE,
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }

    fn page_state(self) -> PageState {
        match self {
            Protection::None => PageState::Invalid,
            Protection::Read => PageState::ReadOnly,
            Protection::ReadWrite => PageState::ReadWrite,
        }
    }
}

/// Reserves `len` bytes (rounded to a page boundary by the caller) at
/// an OS-chosen address with no access, per §4.F step 1.
pub fn reserve(len: usize) -> Result<usize> {
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(DsmError::Memory(format!("mmap({len}) failed: {}", std::io::Error::last_os_error())));
        }
        Ok(ptr as usize)
    }
}

/// Reserves `len` bytes at a *specific* address, used by remote nodes
/// reconstructing the same SVAS mapping the allocator broadcast.
pub fn reserve_at(addr: usize, len: usize) -> Result<usize> {
    unsafe {
        let ptr = libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(DsmError::Memory(format!(
                "mmap(MAP_FIXED @ {addr:#x}, {len}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(ptr as usize)
    }
}

pub fn unreserve(addr: usize, len: usize) -> Result<()> {
    unsafe {
        if libc::munmap(addr as *mut libc::c_void, len) != 0 {
            return Err(DsmError::Memory(format!("munmap failed: {}", std::io::Error::last_os_error())));
        }
    }
    Ok(())
}

/// Applies `prot` to the page-aligned page starting at `addr` and, if
/// that address falls inside `table`, reflects the new state into the
/// entry. If the address is not in the table the permission change
/// still occurs — only the state update is skipped (§4.E).
pub fn set_protection(table: Option<&PageTable>, addr: usize, prot: Protection) -> Result<()> {
    let page_addr = addr & !(PAGE_SIZE - 1);
    let rc = unsafe { libc::mprotect(page_addr as *mut libc::c_void, PAGE_SIZE, prot.to_prot()) };
    if rc != 0 {
        return Err(DsmError::Permission(format!(
            "mprotect({page_addr:#x}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    if let Some(table) = table {
        if let Some(entry) = table.entry_for_addr(page_addr) {
            entry.set_state(prot.page_state());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_unreserve_roundtrip() {
        let addr = reserve(PAGE_SIZE * 4).unwrap();
        assert_ne!(addr, 0);
        unreserve(addr, PAGE_SIZE * 4).unwrap();
    }

    #[test]
    fn set_protection_upgrades_and_writes() {
        let len = PAGE_SIZE;
        let addr = reserve(len).unwrap();
        set_protection(None, addr, Protection::ReadWrite).unwrap();
        unsafe {
            let p = addr as *mut u8;
            *p = 0xAB;
            assert_eq!(*p, 0xAB);
        }
        unreserve(addr, len).unwrap();
    }
}
