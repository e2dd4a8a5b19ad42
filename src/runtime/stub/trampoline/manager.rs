// trampoline 页池：每个 trampoline 独占一页，释放后经过冷却期才允许复用
use crate::error::HookError;
use crate::log;
use crate::runtime::state::MutexPoisonRecover;
use once_cell::sync::Lazy;
use std::ptr;
use std::sync::Mutex;

use super::{TRAMPO_DELAY_SEC, now_sec, trampo_size};

struct PageSlot {
    addr: usize,
    in_use: bool,
    // 0 表示从未释放
    freed_at: u64,
}

struct TrampolinePool {
    page_size: usize,
    slots: Vec<PageSlot>,
}

impl TrampolinePool {
    fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        Self {
            page_size: if page_size == 0 { 4096 } else { page_size },
            slots: Vec::new(),
        }
    }

    fn cooled(slot: &PageSlot, now: u64) -> bool {
        slot.freed_at == 0 || now.saturating_sub(slot.freed_at) > TRAMPO_DELAY_SEC
    }

    fn alloc(&mut self) -> Result<usize, HookError> {
        if trampo_size() > self.page_size {
            return Err(HookError::Synthesis("trampoline larger than a page".into()));
        }
        let now = now_sec();
        self.reclaim(now);

        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| !slot.in_use && Self::cooled(slot, now))
        {
            slot.in_use = true;
            return Ok(slot.addr);
        }

        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                self.page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            log::error(format_args!("mmap trampoline page failed: {err}"));
            return Err(HookError::Synthesis(format!("mmap failed: {err}")));
        }
        let addr = raw as usize;
        self.slots.push(PageSlot {
            addr,
            in_use: true,
            freed_at: 0,
        });
        Ok(addr)
    }

    fn free(&mut self, addr: usize) {
        let now = now_sec();
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.addr == addr) {
            slot.in_use = false;
            slot.freed_at = now;
        }
        self.reclaim(now);
    }

    // 归还超过冷却期的空闲页，至少保留一页
    fn reclaim(&mut self, now: u64) {
        let mut idx = 0;
        while idx < self.slots.len() && self.slots.len() > 1 {
            let slot = &self.slots[idx];
            if slot.in_use || slot.freed_at == 0 || !Self::cooled(slot, now) {
                idx += 1;
                continue;
            }
            let slot = self.slots.swap_remove(idx);
            unsafe {
                libc::munmap(slot.addr as *mut libc::c_void, self.page_size);
            }
        }
    }
}

static POOL: Lazy<Mutex<TrampolinePool>> = Lazy::new(|| Mutex::new(TrampolinePool::new()));

pub(super) fn alloc_trampo() -> Result<usize, HookError> {
    POOL.lock_or_poison().alloc()
}

pub(super) fn free_trampo(addr: usize) {
    POOL.lock_or_poison().free(addr);
}
