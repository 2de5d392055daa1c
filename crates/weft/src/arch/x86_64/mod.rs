//! x86_64 context switching
//!
//! Naked-function inline assembly, stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register frame per the System V AMD64 ABI.
///
/// Field order is load-bearing: the assembly below addresses fields by
/// fixed byte offsets.
#[repr(C)]
#[derive(Default)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Initialize a fresh fiber context.
///
/// When first switched to, execution begins in the entry trampoline, which
/// calls `entry_fn(entry_arg)`. The entry function must never return.
///
/// # Safety
///
/// `ctx` must point to valid `Context` memory and `stack_top` must be the
/// upper end of a live, writable stack mapping.
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry_fn: extern "C" fn(usize) -> !,
    entry_arg: usize,
) {
    // 16-align so the trampoline's `call` leaves the entry function with a
    // conformant frame (rsp % 16 == 8 at function entry).
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as usize as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function performs the terminal context switch itself; control
/// never comes back here.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Voluntary context switch.
///
/// Saves the callee-saved frame of the caller into `save` and resumes the
/// frame stored in `load`. Returns when something later switches back into
/// `save`.
///
/// # Safety
///
/// Both pointers must reference valid `Context` memory; `load` must hold a
/// frame produced by `init_context` or a previous save.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save callee-saved registers into `save` (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from `load` (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the saved resume point
        "jmp rax",
        // Resume point for the frame saved above
        "1:",
        "ret",
    );
}
