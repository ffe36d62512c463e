//! The final stretch: stacks, descriptor tables, PCR, shared data page,
//! pointer emission, page tables, and the jump that never returns.
//!
//! Everything here runs identity-mapped. Once the new CR3 is loaded the
//! identity map survives only until the kernel installs its own tables, so
//! the jump happens immediately after the switch.

use crate::context::BootContext;
use crate::debug::Kdnet;
use crate::gdt::{self, DescriptorTables, Ktss64};
use crate::logger::ConsoleLogger;
use crate::memory::IdentityMapper;
use loader_block::{Generation, KERNEL_STACK_PAGES, LoaderStore, OsVersion};
use loader_vmem::{
    FrameAlloc, KI_USER_SHARED_DATA, MemoryKind, PAGE_SIZE, PageAllocator, PhysAddr, VirtAddr,
    long_mode,
};
use log::info;
use uefi::Status;

/// Fixed arena the page tables are carved from, pre-declared in the memory
/// plan so the kernel never reuses those frames.
pub struct PageTableArena {
    next: u64,
    end: u64,
}

/// Generous upper bound: one PT per 2 MiB of kernel-range mappings plus the
/// directory chain and the identity map's directories.
const ARENA_PAGES: u64 = 768;

impl PageTableArena {
    pub fn reserve(ctx: &mut BootContext) -> Result<Self, Status> {
        let base = ctx
            .memory
            .alloc_pages(ARENA_PAGES)
            .ok_or(Status::OUT_OF_RESOURCES)?;
        ctx.mappings
            .add(None, base, ARENA_PAGES, MemoryKind::MemoryData)
            .map_err(|_| Status::OUT_OF_RESOURCES)?;
        Ok(Self {
            next: base.as_u64(),
            end: base.as_u64() + ARENA_PAGES * PAGE_SIZE,
        })
    }
}

impl FrameAlloc for PageTableArena {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        if self.next + PAGE_SIZE > self.end {
            return None;
        }
        let frame = PhysAddr::new(self.next);
        self.next += PAGE_SIZE;
        // SAFETY: the arena is an exclusive identity-mapped allocation.
        unsafe {
            core::ptr::write_bytes(frame.as_ptr(), 0, PAGE_SIZE as usize);
        }
        Some(frame)
    }
}

/// Kernel stack layout produced by [`allocate_kernel_stacks`].
pub struct KernelStacks {
    /// The midpoint the block's `KernelStack` gets (read as top, written as
    /// bottom by different kernel paths).
    pub kernel_stack: VirtAddr,
    /// Top of the startup stack for `TSS.Rsp0`.
    pub rsp0: VirtAddr,
}

/// Allocate and map the startup stacks with the per-release overcommit, and
/// fill the TSS stack pointers.
pub fn allocate_kernel_stacks(
    ctx: &mut BootContext,
    version: &OsVersion,
    tss: PhysAddr,
) -> Result<KernelStacks, Status> {
    // Twice the stack plus a guard page, so the block's single pointer
    // satisfies both the mark-as-bottom and use-as-top consumers, plus the
    // ISR overcommit newer kernels expect.
    let mut pages = (KERNEL_STACK_PAGES + 1) * 2;
    pages += match version.generation {
        Generation::Win10 => 800,
        Generation::Win81 => 4,
        _ => 0,
    };

    let backing = ctx
        .memory
        .alloc_pages(pages)
        .ok_or(Status::OUT_OF_RESOURCES)?;
    let va = ctx
        .map_at_cursor(backing, pages, MemoryKind::StartupKernelStack)
        .map_err(|_| Status::OUT_OF_RESOURCES)?;
    let kernel_stack = va.add((KERNEL_STACK_PAGES + 1) * PAGE_SIZE);

    // A dedicated startup stack for Rsp0 and one per interrupt stack slot.
    let tss_ref = unsafe { &mut *(tss.as_u64() as *mut Ktss64) };
    let stack_pages = KERNEL_STACK_PAGES + 1;

    let backing = ctx
        .memory
        .alloc_pages(stack_pages)
        .ok_or(Status::OUT_OF_RESOURCES)?;
    let va = ctx
        .map_at_cursor(backing, stack_pages, MemoryKind::StartupKernelStack)
        .map_err(|_| Status::OUT_OF_RESOURCES)?;
    let rsp0 = va.add(stack_pages * PAGE_SIZE);
    tss_ref.rsp0 = rsp0.as_u64();

    for ist in 0..7 {
        let backing = ctx
            .memory
            .alloc_pages(stack_pages)
            .ok_or(Status::OUT_OF_RESOURCES)?;
        let va = ctx
            .map_at_cursor(backing, stack_pages, MemoryKind::StartupKernelStack)
            .map_err(|_| Status::OUT_OF_RESOURCES)?;
        tss_ref.ist[ist] = va.add(stack_pages * PAGE_SIZE).as_u64();
    }

    Ok(KernelStacks { kernel_stack, rsp0 })
}

/// KPCR pages; the PRCB is embedded at this offset on x86-64.
const PCR_PAGES: u64 = 8;
const PRCB_OFFSET: u64 = 0x180;

pub struct Pcr {
    pub va: VirtAddr,
    pub prcb: VirtAddr,
}

pub fn allocate_pcr(ctx: &mut BootContext) -> Result<Pcr, Status> {
    let backing = ctx
        .memory
        .alloc_pages(PCR_PAGES)
        .ok_or(Status::OUT_OF_RESOURCES)?;
    // SAFETY: fresh exclusive allocation.
    unsafe {
        core::ptr::write_bytes(backing.as_ptr(), 0, (PCR_PAGES * PAGE_SIZE) as usize);
    }
    let va = ctx
        .map_at_cursor(backing, PCR_PAGES, MemoryKind::StartupPcrPage)
        .map_err(|_| Status::OUT_OF_RESOURCES)?;
    Ok(Pcr {
        va,
        prcb: va.add(PRCB_OFFSET),
    })
}

/// The zeroed `KI_USER_SHARED_DATA` page at its architectural address.
pub fn allocate_user_shared_data(ctx: &mut BootContext) -> Result<(), Status> {
    let backing = ctx
        .memory
        .alloc_frame()
        .ok_or(Status::OUT_OF_RESOURCES)?;
    ctx.map_fixed(
        VirtAddr::new(KI_USER_SHARED_DATA),
        backing,
        1,
        MemoryKind::StartupPcrPage,
    )
    .map_err(|_| Status::OUT_OF_RESOURCES)
}

/// Everything after the plan is final: emit pointers, build the tables,
/// leave the firmware, and call the kernel. Never returns on success.
pub fn depart(
    ctx: &mut BootContext,
    store: &LoaderStore,
    tables: &DescriptorTables,
    arena: &mut PageTableArena,
    identity: &[(PhysAddr, u64)],
    mut kdnet: Option<Kdnet>,
    entry_point: VirtAddr,
    rsp0: VirtAddr,
    block_va: VirtAddr,
) -> Result<core::convert::Infallible, Status> {
    let rewritten = unsafe {
        store
            .emit(&ctx.mappings)
            .map_err(|_| Status::INVALID_PARAMETER)?
    };
    info!("pointer emission complete ({rewritten} slots)");

    let mapper = IdentityMapper;
    let space = long_mode::materialize(&mapper, arena, &ctx.mappings, identity)
        .map_err(|_| Status::OUT_OF_RESOURCES)?;

    info!("leaving boot services; see you on the other side");
    ConsoleLogger::exit_boot_services();
    let _memory_map = unsafe { uefi::boot::exit_boot_services(None) };

    unsafe {
        // New address space: the identity map plus the kernel layout.
        core::arch::asm!(
            "mov cr3, {}",
            in(reg) space.root().as_u64(),
            options(nostack, preserves_flags)
        );

        gdt::install(tables);

        // Re-enable IDE interrupts; the firmware's IDE driver leaves them
        // masked, which wedges Vista's boot-time driver.
        core::arch::asm!(
            "mov dx, 0x3f6",
            "xor al, al",
            "out dx, al",
            "mov dx, 0x376",
            "out dx, al",
            out("dx") _, out("al") _,
        );

        if let Some(kdnet) = kdnet.as_mut() {
            kdnet.start_controller();
        }

        // SYSCALL support for the kernel's own use.
        const IA32_EFER: u32 = 0xc000_0080;
        let (mut low, high): (u32, u32);
        core::arch::asm!(
            "rdmsr",
            in("ecx") IA32_EFER,
            out("eax") low,
            out("edx") high,
        );
        low |= 1; // SCE
        core::arch::asm!(
            "wrmsr",
            in("ecx") IA32_EFER,
            in("eax") low,
            in("edx") high,
        );

        // KiSystemStartup(LoaderBlock). The stack is TSS.Rsp0; the call
        // never returns.
        core::arch::asm!(
            "mov rsp, {stack}",
            "xor ebp, ebp",
            "call {entry}",
            stack = in(reg) rsp0.as_u64(),
            entry = in(reg) entry_point.as_u64(),
            in("rcx") block_va.as_u64(),
            options(noreturn),
        );
    }
}
