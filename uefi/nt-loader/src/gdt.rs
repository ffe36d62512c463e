//! CPU descriptor tables for the kernel: GDT with the selector layout NT
//! expects, the 64-bit TSS, and a copy of the firmware IDT.

use crate::context::BootContext;
use bitfield_struct::bitfield;
use loader_vmem::{FrameAlloc, MemoryKind, PAGE_SIZE, PhysAddr, VirtAddr};
use log::debug;
use uefi::Status;

// Selectors of the x86-64 kernel GDT.
pub const KGDT_NULL: u16 = 0x00;
pub const KGDT_R0_CODE: u16 = 0x10;
pub const KGDT_R0_DATA: u16 = 0x18;
pub const KGDT_R3_CMCODE: u16 = 0x20;
pub const KGDT_R3_DATA: u16 = 0x28;
pub const KGDT_R3_CODE: u16 = 0x30;
pub const KGDT_TSS: u16 = 0x40;
pub const KGDT_R3_CMTEB: u16 = 0x50;
pub const KGDT_R0_LDT: u16 = 0x60;

const TYPE_CODE: u8 = 0x1a;
const TYPE_DATA: u8 = 0x12;
const TYPE_TSS: u8 = 0x09;

/// 64-bit task state segment. `packed(4)` keeps the historical layout with
/// the stack pointers at offset 4.
#[repr(C, packed(4))]
pub struct Ktss64 {
    pub reserved0: u32,
    pub rsp0: u64,
    pub rsp1: u64,
    pub rsp2: u64,
    pub reserved1: u64,
    pub ist: [u64; 7],
    pub reserved2: u64,
    pub reserved3: u16,
    pub io_map_base: u16,
}

const _: () = assert!(size_of::<Ktss64>() == 0x68);

#[bitfield(u64)]
struct GdtEntry {
    #[bits(16)]
    limit_low: u16,
    #[bits(16)]
    base_low: u16,
    #[bits(8)]
    base_mid: u8,
    #[bits(5)]
    descriptor_type: u8,
    #[bits(2)]
    dpl: u8,
    present: bool,
    #[bits(4)]
    limit_high: u8,
    avl: bool,
    long: bool,
    default_big: bool,
    granularity: bool,
    #[bits(8)]
    base_high: u8,
}

/// The tables, in identity-mapped memory, plus their kernel addresses.
pub struct DescriptorTables {
    pub gdt: PhysAddr,
    pub gdt_va: VirtAddr,
    pub idt: PhysAddr,
    pub idt_va: VirtAddr,
    pub tss: PhysAddr,
    pub tss_va: VirtAddr,
}

fn set_entry(
    gdt: PhysAddr,
    selector: u16,
    base: u32,
    mut limit: u32,
    descriptor_type: u8,
    dpl: u8,
    default_big: bool,
    long: bool,
) {
    let mut entry = GdtEntry::new()
        .with_base_low((base & 0xffff) as u16)
        .with_base_mid(((base >> 16) & 0xff) as u8)
        .with_base_high(((base >> 24) & 0xff) as u8)
        .with_descriptor_type(descriptor_type & 0x1f)
        .with_dpl(dpl & 3)
        .with_present(descriptor_type != 0)
        .with_default_big(default_big)
        .with_long(long);

    if limit >= 0x10_0000 {
        limit >>= 12;
        entry = entry.with_granularity(true);
    }
    entry = entry
        .with_limit_low((limit & 0xffff) as u16)
        .with_limit_high(((limit >> 16) & 0xf) as u8);

    unsafe {
        core::ptr::write_unaligned(
            (gdt.as_u64() as usize + selector as usize) as *mut u64,
            entry.into_bits(),
        );
    }
}

/// Build the GDT around an already-mapped TSS and map all three tables.
pub fn build_descriptor_tables(ctx: &mut BootContext) -> Result<DescriptorTables, Status> {
    // TSS page first; the GDT points at its virtual address.
    let tss = ctx
        .memory
        .alloc_frame()
        .ok_or(Status::OUT_OF_RESOURCES)?;
    let tss_va = ctx
        .map_at_cursor(tss, 1, MemoryKind::MemoryData)
        .map_err(|_| Status::OUT_OF_RESOURCES)?;

    let gdt = ctx
        .memory
        .alloc_frame()
        .ok_or(Status::OUT_OF_RESOURCES)?;

    set_entry(gdt, KGDT_NULL, 0, 0, 0, 0, false, false);
    set_entry(gdt, KGDT_R0_CODE, 0, 0, TYPE_CODE, 0, false, true);
    set_entry(gdt, KGDT_R0_DATA, 0, 0, TYPE_DATA, 0, false, true);
    set_entry(gdt, KGDT_R3_CMCODE, 0, 0xffff_ffff, TYPE_CODE, 3, true, false);
    set_entry(gdt, KGDT_R3_DATA, 0, 0xffff_ffff, TYPE_DATA, 3, true, false);
    set_entry(gdt, KGDT_R3_CODE, 0, 0, TYPE_CODE, 3, false, true);
    set_entry(gdt, KGDT_R3_CMTEB, 0, 0xfff, TYPE_DATA, 3, true, false);
    set_entry(gdt, KGDT_R0_LDT, 0, 0xffff_ffff, TYPE_CODE, 0, true, false);

    // The TSS descriptor takes 16 bytes; the upper half holds bits 63..32
    // of the (virtual) base.
    let tss_base = tss_va.as_u64();
    set_entry(
        gdt,
        KGDT_TSS,
        (tss_base & 0xffff_ffff) as u32,
        size_of::<Ktss64>() as u32 - 1,
        TYPE_TSS,
        0,
        false,
        false,
    );
    unsafe {
        core::ptr::write_unaligned(
            (gdt.as_u64() as usize + KGDT_TSS as usize + 8) as *mut u64,
            tss_base >> 32,
        );
    }

    let gdt_va = ctx
        .map_at_cursor(gdt, 1, MemoryKind::MemoryData)
        .map_err(|_| Status::OUT_OF_RESOURCES)?;

    // IDT: a private copy of the firmware's handlers, mapped for the
    // earliest kernel faults.
    let idt = ctx
        .memory
        .alloc_frame()
        .ok_or(Status::OUT_OF_RESOURCES)?;
    let (firmware_idt_base, firmware_idt_limit) = current_idt();
    let copy_len = (usize::from(firmware_idt_limit) + 1).min(PAGE_SIZE as usize);
    unsafe {
        core::ptr::copy_nonoverlapping(
            firmware_idt_base as *const u8,
            idt.as_ptr(),
            copy_len,
        );
    }
    let idt_va = ctx
        .map_at_cursor(idt, 1, MemoryKind::MemoryData)
        .map_err(|_| Status::OUT_OF_RESOURCES)?;

    debug!("GDT at {gdt_va}, IDT at {idt_va}, TSS at {tss_va}");
    Ok(DescriptorTables {
        gdt,
        gdt_va,
        idt,
        idt_va,
        tss,
        tss_va,
    })
}

#[repr(C, packed)]
struct TableRegister {
    limit: u16,
    base: u64,
}

fn current_idt() -> (u64, u16) {
    let mut register = TableRegister { limit: 0, base: 0 };
    unsafe {
        core::arch::asm!("sidt [{}]", in(reg) &raw mut register, options(nostack));
    }
    (register.base, register.limit)
}

/// Install the new tables: `lgdt`, `lidt`, segment reload, `ltr`.
///
/// # Safety
/// The tables must be valid and identity-reachable; interrupts are expected
/// to be disabled around the reload.
pub unsafe fn install(tables: &DescriptorTables) {
    let gdtr = TableRegister {
        limit: (PAGE_SIZE - 1) as u16,
        base: tables.gdt.as_u64(),
    };
    let idtr = TableRegister {
        limit: (PAGE_SIZE - 1) as u16,
        base: tables.idt.as_u64(),
    };

    unsafe {
        core::arch::asm!(
            "cli",
            "lgdt [{gdtr}]",
            "lidt [{idtr}]",
            // Reload the data selectors.
            "mov ax, {data}",
            "mov ds, ax",
            "mov es, ax",
            "mov ss, ax",
            "xor eax, eax",
            "mov fs, ax",
            "mov gs, ax",
            // Far-return to reload CS.
            "lea rax, [rip + 2f]",
            "push {code}",
            "push rax",
            "retfq",
            "2:",
            "ltr {tss:x}",
            gdtr = in(reg) &raw const gdtr,
            idtr = in(reg) &raw const idtr,
            data = const KGDT_R0_DATA as i32,
            code = const KGDT_R0_CODE as i32,
            tss = in(reg) KGDT_TSS,
            out("rax") _,
        );
    }
}
