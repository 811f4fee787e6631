// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Long-mode address space construction.
//!
//! The guest gets a fixed 4-level identity mapping written directly into
//! its physical memory: PML4 at 0x1000, PDPT at 0x2000, page directory at
//! 0x3000, and, in 4 KiB mode, one page table per 2 MiB region starting at
//! 0x4000. The vCPU then starts directly in 64-bit long mode at RIP 0.

use crate::config::PageSize;
use crate::config::SIZE_2MB;
use crate::config::SIZE_4KB;
use kvm::kvm_segment;
use kvm::kvm_sregs;

const PDE64_PRESENT: u64 = 1;
const PDE64_RW: u64 = 1 << 1;
const PDE64_USER: u64 = 1 << 2;
const PDE64_PS: u64 = 1 << 7;

const CR4_PAE: u64 = 1 << 5;
const CR0_PE: u64 = 1;
const CR0_PG: u64 = 1 << 31;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

const PML4_ADDR: u64 = 0x1000;
const PDPT_ADDR: u64 = 0x2000;
const PD_ADDR: u64 = 0x3000;
const PT_BASE: u64 = 0x4000;

const LEAF_FLAGS: u64 = PDE64_PRESENT | PDE64_RW | PDE64_USER;

fn write_entry(memory: &mut [u8], table: u64, index: usize, entry: u64) {
    let offset = table as usize + index * 8;
    memory[offset..offset + 8].copy_from_slice(&entry.to_le_bytes());
}

/// Writes identity-mapping page tables covering all of `memory` into the
/// reserved low region.
///
/// Pure memory-layout computation; the memory size is a multiple of 2 MiB
/// by configuration validation.
pub fn build_page_tables(memory: &mut [u8], page_size: PageSize) {
    let memory_size = memory.len();
    debug_assert_eq!(memory_size % SIZE_2MB, 0);

    write_entry(memory, PML4_ADDR, 0, LEAF_FLAGS | PDPT_ADDR);
    write_entry(memory, PDPT_ADDR, 0, LEAF_FLAGS | PD_ADDR);

    let regions = memory_size / SIZE_2MB;
    let mut page: u64 = 0;
    match page_size {
        PageSize::Size2m => {
            // Every page-directory entry is a large-page leaf.
            for i in 0..regions {
                write_entry(memory, PD_ADDR, i, page | LEAF_FLAGS | PDE64_PS);
                page += SIZE_2MB as u64;
            }
        }
        PageSize::Size4k => {
            // One page table per 2 MiB region, 512 contiguous 4 KiB leaves
            // each.
            for i in 0..regions {
                let pt_addr = PT_BASE + (i * SIZE_4KB) as u64;
                write_entry(memory, PD_ADDR, i, LEAF_FLAGS | pt_addr);
                for j in 0..512 {
                    write_entry(memory, pt_addr, j, page | LEAF_FLAGS);
                    page += SIZE_4KB as u64;
                }
            }
        }
    }
}

fn flat_segment(type_: u8) -> kvm_segment {
    kvm_segment {
        base: 0,
        limit: 0xffffffff,
        type_,
        present: 1,
        dpl: 0,
        db: 0,
        s: 1,
        l: 1,
        g: 1,
        ..Default::default()
    }
}

/// Sets the control registers and segment state so the vCPU starts in
/// 64-bit long mode with the tables from [`build_page_tables`] active.
pub fn enter_long_mode(sregs: &mut kvm_sregs) {
    sregs.cr3 = PML4_ADDR;
    sregs.cr4 = CR4_PAE;
    sregs.cr0 = CR0_PE | CR0_PG;
    sregs.efer = EFER_LME | EFER_LMA;

    // Flat 64-bit code segment; data (read/write/accessed) everywhere else.
    sregs.cs = flat_segment(11);
    let data = flat_segment(3);
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;
}
