// 可执行内存的页保护切换与指令缓存刷新
use crate::error::HookError;
use crate::log;
#[cfg(target_arch = "x86_64")]
use std::sync::atomic::{Ordering, fence};

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
    if size == 0 { 4096 } else { size }
}

// 覆盖 [addr, addr+len) 的页对齐区间
fn page_span(addr: usize, len: usize) -> (usize, usize) {
    let page_size = page_size();
    let mask = !(page_size - 1);
    let start = addr & mask;
    let end = (addr + len.max(1) + page_size - 1) & mask;
    (start, end - start)
}

pub fn protect(addr: usize, len: usize, prot: i32) -> Result<(), HookError> {
    let (start, span) = page_span(addr, len);
    let result = unsafe { libc::mprotect(start as *mut libc::c_void, span, prot) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        log::error(format_args!("mprotect 0x{start:x}+0x{span:x} failed: {err}"));
        return Err(HookError::Synthesis(format!("mprotect failed: {err}")));
    }
    Ok(())
}

// aarch64: 逐行清理 dcache 再逐行无效化 icache，最后 dsb+isb 同步
// x86_64: 硬件保证缓存一致性，仅需内存屏障
pub fn flush_instruction_cache_range(start: usize, end: usize) {
    if start >= end {
        return;
    }

    #[cfg(target_arch = "aarch64")]
    {
        let (dcache_line, icache_line) = cache_line_size();
        let mut addr = start & !(dcache_line - 1);
        while addr < end {
            unsafe {
                core::arch::asm!("dc cvau, {}", in(reg) addr, options(nostack, preserves_flags));
            }
            addr += dcache_line;
        }
        unsafe {
            core::arch::asm!("dsb ish", options(nostack, preserves_flags));
        }

        let mut addr = start & !(icache_line - 1);
        while addr < end {
            unsafe {
                core::arch::asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags));
            }
            addr += icache_line;
        }
        unsafe {
            core::arch::asm!("dsb ish", options(nostack, preserves_flags));
            core::arch::asm!("isb", options(nostack, preserves_flags));
        }
    }

    #[cfg(target_arch = "x86_64")]
    {
        fence(Ordering::SeqCst);
    }
}

// CTR_EL0 -> (dcache 行, icache 行)
#[cfg(target_arch = "aarch64")]
fn cache_line_size() -> (usize, usize) {
    let ctr_el0: usize;
    unsafe {
        core::arch::asm!("mrs {}, ctr_el0", out(reg) ctr_el0, options(nomem, nostack, preserves_flags));
    }
    let dcache_line = 4usize << ((ctr_el0 >> 16) & 0x0f);
    let icache_line = 4usize << (ctr_el0 & 0x0f);
    (dcache_line.max(4), icache_line.max(4))
}
