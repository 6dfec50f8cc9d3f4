//! Trap frame and the per-vector entry trampolines.
//!
//! Every vector funnels into `trap_common`, which lays a [`Registers`]
//! record out on the active kernel stack, loads the kernel data segments
//! and calls [`trap_entry`]. The scheduler switches tasks by rewriting that
//! record in place before the restore path returns through `iretd`.

use static_assertions::const_assert_eq;

use crate::{interrupts, println};

/// Saved CPU state, in the exact layout the trampolines produce.
///
/// The field offsets are a contract with the assembly below; they are
/// frozen by the assertions that follow.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct Registers {
    pub gs: u16,
    pub fs: u16,
    pub es: u16,
    pub ds: u16,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Stack pointer at the time the general registers were pushed; for a
    /// ring-0 interrupt it addresses the `int_no` slot of this very frame.
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub int_no: u32,
    pub err_code: u32,
    // Pushed by the processor. An inter-privilege iret additionally pops
    // the user stack pointer and SS.
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub useresp: u32,
    pub ss: u32,
}

const_assert_eq!(core::mem::offset_of!(Registers, gs), 0);
const_assert_eq!(core::mem::offset_of!(Registers, fs), 2);
const_assert_eq!(core::mem::offset_of!(Registers, es), 4);
const_assert_eq!(core::mem::offset_of!(Registers, ds), 6);
const_assert_eq!(core::mem::offset_of!(Registers, edi), 8);
const_assert_eq!(core::mem::offset_of!(Registers, esi), 12);
const_assert_eq!(core::mem::offset_of!(Registers, ebp), 16);
const_assert_eq!(core::mem::offset_of!(Registers, esp), 20);
const_assert_eq!(core::mem::offset_of!(Registers, ebx), 24);
const_assert_eq!(core::mem::offset_of!(Registers, edx), 28);
const_assert_eq!(core::mem::offset_of!(Registers, ecx), 32);
const_assert_eq!(core::mem::offset_of!(Registers, eax), 36);
const_assert_eq!(core::mem::offset_of!(Registers, int_no), 40);
const_assert_eq!(core::mem::offset_of!(Registers, err_code), 44);
const_assert_eq!(core::mem::offset_of!(Registers, eip), 48);
const_assert_eq!(core::mem::offset_of!(Registers, cs), 52);
const_assert_eq!(core::mem::offset_of!(Registers, eflags), 56);
const_assert_eq!(core::mem::offset_of!(Registers, useresp), 60);
const_assert_eq!(core::mem::offset_of!(Registers, ss), 64);
const_assert_eq!(core::mem::size_of::<Registers>(), 68);

impl Registers {
    pub const fn zeroed() -> Self {
        Registers {
            gs: 0,
            fs: 0,
            es: 0,
            ds: 0,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            int_no: 0,
            err_code: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
            useresp: 0,
            ss: 0,
        }
    }

    pub fn dump(&self) {
        println!(
            "gs:     {:#x} fs:       {:#x} es:     {:#x} ds:  {:#x} cs: {:#x}",
            self.gs, self.fs, self.es, self.ds, self.cs
        );
        println!(
            "eax:    {:#x} ebx:      {:#x} ecx:    {:#x} edx: {:#x}",
            self.eax, self.ebx, self.ecx, self.edx
        );
        println!(
            "edi:    {:#x} esi:      {:#x} ebp:    {:#x} esp: {:#x}",
            self.edi, self.esi, self.ebp, self.esp
        );
        println!("int_no: {:#x} err_code: {:#x}", self.int_no, self.err_code);
        println!(
            "eip:    {:#x} eflags:   {:#x} usersp: {:#x} ss:  {:#x}",
            self.eip, self.eflags, self.useresp, self.ss
        );
    }
}

/// Rust landing point for every trap. Called by `trap_common` with a
/// pointer to the frame it just built; whatever the frame holds when this
/// returns is the state the CPU resumes with.
#[unsafe(no_mangle)]
pub extern "C" fn trap_entry(frame: *mut Registers) {
    let regs = unsafe { &mut *frame };
    interrupts::dispatch(regs);
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod trampolines {
    use crate::gdt;
    use crate::interrupts::idt;

    // Trampolines for every installed vector. Vectors whose exception
    // pushes no error code push a dummy zero so the frame layout is
    // uniform. Field offsets used below match the Registers assertions.
    core::arch::global_asm!(
        r#"
        .macro ISR_NOERR num
        .global isr\num
        isr\num:
            push 0
            push \num
            jmp trap_common
        .endm

        .macro ISR_ERR num
        .global isr\num
        isr\num:
            push \num
            jmp trap_common
        .endm

        ISR_NOERR 0
        ISR_NOERR 1
        ISR_NOERR 2
        ISR_NOERR 3
        ISR_NOERR 4
        ISR_NOERR 5
        ISR_NOERR 6
        ISR_NOERR 7
        ISR_ERR   8
        ISR_NOERR 9
        ISR_ERR   10
        ISR_ERR   11
        ISR_ERR   12
        ISR_ERR   13
        ISR_ERR   14
        ISR_NOERR 15
        ISR_NOERR 16
        ISR_ERR   17
        ISR_NOERR 18
        ISR_NOERR 19
        ISR_NOERR 20
        ISR_NOERR 21
        ISR_NOERR 22
        ISR_NOERR 23
        ISR_NOERR 24
        ISR_NOERR 25
        ISR_NOERR 26
        ISR_NOERR 27
        ISR_NOERR 28
        ISR_NOERR 29
        ISR_NOERR 30
        ISR_NOERR 31
        ISR_NOERR 32
        ISR_NOERR 33
        ISR_NOERR 34
        ISR_NOERR 35
        ISR_NOERR 36
        ISR_NOERR 37
        ISR_NOERR 38
        ISR_NOERR 39
        ISR_NOERR 40
        ISR_NOERR 41
        ISR_NOERR 42
        ISR_NOERR 43
        ISR_NOERR 44
        ISR_NOERR 45
        ISR_NOERR 46
        ISR_NOERR 47
        ISR_NOERR 128

        trap_common:
            pushad
            sub esp, 8
            mov word ptr [esp], gs
            mov word ptr [esp + 2], fs
            mov word ptr [esp + 4], es
            mov word ptr [esp + 6], ds
            mov ax, 0x10
            mov ds, ax
            mov es, ax
            mov fs, ax
            mov gs, ax
            cld
            mov eax, esp
            push eax
            call trap_entry
            add esp, 4
            mov esi, esp

        // esi points at the (possibly rewritten) Registers frame. A ring-3
        // resume rebuilds the five-word iret frame here; a ring-0 resume
        // re-adopts the target task's own stack, whose iret frame is still
        // in place at its saved esp.
        frame_restore:
            mov gs, word ptr [esi]
            mov fs, word ptr [esi + 2]
            mov es, word ptr [esi + 4]
            test byte ptr [esi + 52], 3
            jz 1f

            push dword ptr [esi + 64]       // ss
            push dword ptr [esi + 60]       // useresp
            push dword ptr [esi + 56]       // eflags
            push dword ptr [esi + 52]       // cs
            push dword ptr [esi + 48]       // eip
            mov eax, [esi + 36]
            mov ebx, [esi + 24]
            mov ecx, [esi + 32]
            mov edx, [esi + 28]
            mov edi, [esi + 8]
            mov ebp, [esi + 16]
            mov ds, word ptr [esi + 6]
            mov esi, [esi + 12]
            iretd

        1:
            mov eax, [esi + 56]             // eflags, IF forced on by the scheduler
            mov edx, [esi + 20]             // saved esp -> int_no slot of the target frame
            mov [edx + 16], eax             // patch eflags in the on-stack iret frame
            mov esp, edx
            add esp, 8                      // skip int_no and err_code
            mov eax, [esi + 36]
            mov ebx, [esi + 24]
            mov ecx, [esi + 32]
            mov edx, [esi + 28]
            mov edi, [esi + 8]
            mov ebp, [esi + 16]
            mov ds, word ptr [esi + 6]
            mov esi, [esi + 12]
            iretd
        "#
    );

    macro_rules! declare_trampolines {
        ($($name:ident => $vector:expr),* $(,)?) => {
            unsafe extern "C" {
                $(fn $name();)*
            }

            fn gates() -> impl Iterator<Item = (u8, u32)> {
                [$(($vector as u8, $name as usize as u32)),*].into_iter()
            }
        };
    }

    declare_trampolines! {
        isr0 => 0, isr1 => 1, isr2 => 2, isr3 => 3, isr4 => 4, isr5 => 5,
        isr6 => 6, isr7 => 7, isr8 => 8, isr9 => 9, isr10 => 10, isr11 => 11,
        isr12 => 12, isr13 => 13, isr14 => 14, isr15 => 15, isr16 => 16,
        isr17 => 17, isr18 => 18, isr19 => 19, isr20 => 20, isr21 => 21,
        isr22 => 22, isr23 => 23, isr24 => 24, isr25 => 25, isr26 => 26,
        isr27 => 27, isr28 => 28, isr29 => 29, isr30 => 30, isr31 => 31,
        isr32 => 32, isr33 => 33, isr34 => 34, isr35 => 35, isr36 => 36,
        isr37 => 37, isr38 => 38, isr39 => 39, isr40 => 40, isr41 => 41,
        isr42 => 42, isr43 => 43, isr44 => 44, isr45 => 45, isr46 => 46,
        isr47 => 47,
    }

    unsafe extern "C" {
        fn isr128();
    }

    /// Gate type: 32-bit interrupt gate, present.
    const GATE_FLAGS: u8 = 0x8E;
    /// DPL 3, so `int 0x80` is reachable from user mode.
    const DPL_USER: u8 = 0x60;

    /// Point every vector's IDT gate at its trampoline.
    pub fn install() {
        for (vector, handler) in gates() {
            idt::set_gate(vector, handler, gdt::KERNEL_CODE, GATE_FLAGS);
        }
        idt::set_gate(
            crate::interrupts::SYSCALL_VECTOR,
            isr128 as usize as u32,
            gdt::KERNEL_CODE,
            GATE_FLAGS | DPL_USER,
        );
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use trampolines::install;

/// Host builds have no IDT to populate.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn install() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_is_frozen() {
        // The asserts above are compile-time; this pins the documented size
        // in a place a failing refactor will surface loudly.
        assert_eq!(core::mem::size_of::<Registers>(), 68);
    }
}
