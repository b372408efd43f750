//! Software interrupt entry for the system call stub.
//!
//! A single call is exposed: number 0, `write(buf_ptr, buf_len)`, which
//! validates the buffer against the user partition and copies the bytes to
//! the serial sink. Calling convention: number in `rax`, arguments in
//! `rdi`/`rsi`, result in `rax`.

use amd64::PrivLvl;

use crate::addr::VAddr;
use crate::memm::pmm::{self, PartitionVmm};
use crate::out;

use super::{register_software, Context, SYSCALL_VECTOR};

pub const SYS_WRITE: u64 = 0;

/// Error result returned in `rax`.
pub const EFAULT: u64 = u64::MAX;
pub const ENOSYS: u64 = u64::MAX - 1;

/// Open the `int 0x80` gate. DPL 3: the whole point is that userland can
/// raise it.
pub fn install() {
    register_software(SYSCALL_VECTOR, PrivLvl::Ring3, handle);
}

fn handle(ctx: &mut Context) {
    ctx.regs.rax = match ctx.regs.rax {
        SYS_WRITE => sys_write(pmm::vmm(), VAddr(ctx.regs.rdi), ctx.regs.rsi),
        other => {
            log::warn!("unknown syscall {} from {:#x}", other, ctx.rip);
            ENOSYS
        }
    };
}

/// `write(buf_ptr, buf_len)`: the buffer must lie entirely within the user
/// address partition.
fn sys_write(vmm: &PartitionVmm, buf: VAddr, len: u64) -> u64 {
    if !vmm.user_range_valid(buf, len) {
        return EFAULT;
    }

    let bytes = unsafe { core::slice::from_raw_parts(buf.as_ptr::<u8>(), len as usize) };
    out::write_bytes(bytes);
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memm::pmm::{USER_BASE, USER_END};

    #[test]
    fn write_rejects_buffers_outside_the_user_partition() {
        let vmm = PartitionVmm::new();
        // kernel pointer
        assert!(!vmm.user_range_valid(VAddr(0xFFFF_FFFF_C000_0000), 16));
        // straddles the upper bound
        assert!(!vmm.user_range_valid(VAddr(USER_END - 8), 16));
        // wraps
        assert!(!vmm.user_range_valid(VAddr(USER_BASE), u64::MAX));
        // in bounds
        assert!(vmm.user_range_valid(VAddr(USER_BASE), 16));
    }
}
