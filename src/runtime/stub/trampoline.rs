// 原生 trampoline：汇编模板 + 数据槽，复制到独立的可执行页中
// 模板保存 JNI 参数寄存器到 RegisterFrame，调用 lsp_stub_entry，再从帧中取回返回值
use crate::android::memory;
use crate::error::HookError;
use crate::log;
use crate::runtime::chain::panic_message;
use crate::runtime::state::MutexPoisonRecover;
use crate::runtime::value::MethodHandle;
use std::collections::HashMap;
use std::mem::size_of;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use super::layout::RegisterFrame;
use super::{CodeSynthesizer, Stub};

const TRAMPO_ALIGN: usize = 16;
// 释放后的冷却期，防止仍在执行旧 trampoline 的线程读到被复用的页
const TRAMPO_DELAY_SEC: u64 = 5;
const TRAMPO_DATA_SLOTS: usize = 3;

mod manager;

// 栈帧：[fp, lr] + RegisterFrame(gpr 0x40, fpr 0x40, stack_args 0x8)，总长 0xa0
#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    r#"
    .text
    .global lsp_stub_trampo_template_start
    .global lsp_stub_trampo_template_data
    .type lsp_stub_trampo_template_start, %function
lsp_stub_trampo_template_start:
    stp   x29, x30, [sp, #-0xa0]!
    mov   x29, sp
    stp   x0, x1, [sp, #0x10]
    stp   x2, x3, [sp, #0x20]
    stp   x4, x5, [sp, #0x30]
    stp   x6, x7, [sp, #0x40]
    stp   d0, d1, [sp, #0x50]
    stp   d2, d3, [sp, #0x60]
    stp   d4, d5, [sp, #0x70]
    stp   d6, d7, [sp, #0x80]
    add   x16, sp, #0xa0
    str   x16, [sp, #0x90]

    ldr   x0, stub_ptr
    ldr   x1, method_ptr
    add   x2, sp, #0x10
    ldr   x16, entry_fn
    blr   x16

    ldr   x0, [sp, #0x10]
    ldr   d0, [sp, #0x50]
    ldp   x29, x30, [sp], #0xa0
    ret

    .balign 8
lsp_stub_trampo_template_data:
entry_fn:
    .quad 0
stub_ptr:
    .quad 0
method_ptr:
    .quad 0
"#
);

// x86_64：rbp 帧 + 144 字节 RegisterFrame，调用前保持 16 字节对齐
#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    r#"
    .text
    .global lsp_stub_trampo_template_start
    .global lsp_stub_trampo_template_data
    .type lsp_stub_trampo_template_start, @function
lsp_stub_trampo_template_start:
    pushq   %rbp
    movq    %rsp, %rbp
    subq    $144, %rsp
    movq    %rdi,    (%rsp)
    movq    %rsi,   8(%rsp)
    movq    %rdx,  16(%rsp)
    movq    %rcx,  24(%rsp)
    movq    %r8,   32(%rsp)
    movq    %r9,   40(%rsp)
    movsd   %xmm0, 64(%rsp)
    movsd   %xmm1, 72(%rsp)
    movsd   %xmm2, 80(%rsp)
    movsd   %xmm3, 88(%rsp)
    movsd   %xmm4, 96(%rsp)
    movsd   %xmm5, 104(%rsp)
    movsd   %xmm6, 112(%rsp)
    movsd   %xmm7, 120(%rsp)
    leaq    16(%rbp), %rax
    movq    %rax, 128(%rsp)

    movq    stub_ptr(%rip), %rdi
    movq    method_ptr(%rip), %rsi
    movq    %rsp, %rdx
    call    *entry_fn(%rip)

    movq      (%rsp), %rax
    movsd   64(%rsp), %xmm0
    movq    %rbp, %rsp
    popq    %rbp
    ret

    .balign 8
lsp_stub_trampo_template_data:
entry_fn:
    .quad 0
stub_ptr:
    .quad 0
method_ptr:
    .quad 0
"#,
    options(att_syntax)
);

unsafe extern "C" {
    static lsp_stub_trampo_template_start: u8;
    static lsp_stub_trampo_template_data: u8;
}

// 汇编模板调用的 Rust 入口，panic 不能越过 FFI 边界
unsafe extern "C" fn lsp_stub_entry(stub: *const Stub, method: usize, frame: *mut RegisterFrame) {
    if stub.is_null() || frame.is_null() {
        return;
    }
    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        (*stub).enter(MethodHandle(method), &mut *frame)
    }));
    if let Err(payload) = result {
        log::error(format_args!(
            "stub dispatch panicked for method 0x{method:x}: {}",
            panic_message(payload.as_ref())
        ));
        unsafe {
            (*frame).gpr[0] = 0;
            (*frame).fpr[0] = 0;
        }
    }
}

fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

fn template_code_size() -> usize {
    let start = ptr::addr_of!(lsp_stub_trampo_template_start) as usize;
    let data = ptr::addr_of!(lsp_stub_trampo_template_data) as usize;
    data.saturating_sub(start)
}

fn trampo_size() -> usize {
    align_up(
        template_code_size() + size_of::<usize>() * TRAMPO_DATA_SLOTS,
        TRAMPO_ALIGN,
    )
}

fn now_sec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

// 复制模板代码、填充数据槽、刷新 icache、切换为 RX
unsafe fn init_trampo(trampo: usize, stub: usize, method: usize) -> Result<(), HookError> {
    let code_size = template_code_size();
    if code_size == 0 {
        return Err(HookError::Synthesis("empty trampoline template".into()));
    }
    let total = code_size + size_of::<usize>() * TRAMPO_DATA_SLOTS;
    memory::protect(trampo, total, libc::PROT_READ | libc::PROT_WRITE)?;

    unsafe {
        let start = ptr::addr_of!(lsp_stub_trampo_template_start);
        ptr::copy_nonoverlapping(start, trampo as *mut u8, code_size);
        let data_ptr = (trampo + code_size) as *mut usize;
        ptr::write_unaligned(data_ptr, lsp_stub_entry as usize);
        ptr::write_unaligned(data_ptr.add(1), stub);
        ptr::write_unaligned(data_ptr.add(2), method);
    }

    memory::flush_instruction_cache_range(trampo, trampo + total);
    memory::protect(trampo, total, libc::PROT_READ | libc::PROT_EXEC)
}

// 设备上的 CodeSynthesizer，持有 Stub 引用直到 trampoline 释放
#[derive(Default)]
pub struct NativeSynthesizer {
    live: Mutex<HashMap<usize, Arc<Stub>>>,
}

impl NativeSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CodeSynthesizer for NativeSynthesizer {
    fn synthesize(&self, stub: &Arc<Stub>, method: MethodHandle) -> Result<usize, HookError> {
        let trampo = manager::alloc_trampo()?;
        if let Err(err) = unsafe { init_trampo(trampo, Arc::as_ptr(stub) as usize, method.0) } {
            manager::free_trampo(trampo);
            return Err(err);
        }
        self.live.lock_or_poison().insert(trampo, Arc::clone(stub));
        log::debug(format_args!("trampoline 0x{trampo:x} for method {method}"));
        Ok(trampo)
    }

    fn release(&self, entry: usize) {
        if self.live.lock_or_poison().remove(&entry).is_some() {
            manager::free_trampo(entry);
        }
    }
}
