//! Multiboot v1 boot information.
//!
//! The firmware hands the kernel a magic number and a pointer to an
//! information block. Only the flag-selected pieces the kernel consumes are
//! modeled: the memory bounds, the memory map and the module list. The
//! block lives wherever the bootloader put it, so everything needed from it
//! is copied out before paging is initialized.

use arrayvec::ArrayVec;

use crate::info;

/// Value the bootloader leaves in the accumulator at handoff.
pub const BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// Magic for the header the bootloader searches the image for.
pub const HEADER_MAGIC: u32 = 0x1BAD_B002;

/// Usable RAM.
pub const MEMORY_AVAILABLE: u32 = 1;
/// Reserved, unusable.
pub const MEMORY_RESERVED: u32 = 2;
/// ACPI tables, reclaimable once parsed.
pub const MEMORY_ACPI_RECLAIMABLE: u32 = 3;
/// Must be preserved across hibernation.
pub const MEMORY_NVS: u32 = 4;
/// Defective RAM.
pub const MEMORY_BADRAM: u32 = 5;

/// More mmap entries than this and the tail is dropped with a warning.
pub const MAX_MEMORY_MAP_ENTRIES: usize = 16;

#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct MemMapEntry {
    /// Size of this entry, not counting the `size` field itself.
    pub size: u32,
    pub addr: u64,
    pub len: u64,
    pub kind: u32,
}

impl MemMapEntry {
    pub fn is_available(&self) -> bool {
        self.kind == MEMORY_AVAILABLE
    }
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ModuleInfo {
    pub mod_start: u32,
    pub mod_end: u32,
    pub cmdline: u32,
    pub reserved: u32,
}

#[repr(C)]
pub struct BootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

const FLAG_MEM_BOUNDS: u32 = 1 << 0;
const FLAG_BOOT_DEVICE: u32 = 1 << 1;
const FLAG_CMDLINE: u32 = 1 << 2;
const FLAG_MODULES: u32 = 1 << 3;
const FLAG_MMAP: u32 = 1 << 6;

impl BootInfo {
    fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn has_mem_bounds(&self) -> bool {
        self.has_flag(FLAG_MEM_BOUNDS)
    }

    pub fn has_mmap(&self) -> bool {
        self.has_flag(FLAG_MMAP)
    }

    pub fn has_modules(&self) -> bool {
        self.has_flag(FLAG_MODULES)
    }

    /// Copy the memory map out of the boot info block.
    ///
    /// Entries are variable-sized; `size` does not count itself.
    ///
    /// # Safety
    /// `mmap_addr..mmap_addr + mmap_length` must be readable memory holding
    /// the map the bootloader wrote.
    pub unsafe fn collect_memory_map(&self) -> ArrayVec<MemMapEntry, MAX_MEMORY_MAP_ENTRIES> {
        assert!(self.has_mmap(), "boot info carries no memory map");

        let mut entries = ArrayVec::new();
        let mut addr = self.mmap_addr as usize;
        let end = (self.mmap_addr + self.mmap_length) as usize;
        while addr < end {
            let entry = unsafe { core::ptr::read_unaligned(addr as *const MemMapEntry) };
            if entries.try_push(entry).is_err() {
                crate::warn!("memory map has more than {} entries, dropping the rest", MAX_MEMORY_MAP_ENTRIES);
                break;
            }
            addr += entry.size as usize + core::mem::size_of::<u32>();
        }
        entries
    }

    /// The module descriptors, if the bootloader loaded any.
    ///
    /// # Safety
    /// `mods_addr` must point at `mods_count` module descriptors.
    pub unsafe fn modules(&self) -> &[ModuleInfo] {
        if !self.has_modules() || self.mods_count == 0 {
            return &[];
        }
        unsafe {
            core::slice::from_raw_parts(self.mods_addr as *const ModuleInfo, self.mods_count as usize)
        }
    }

    /// Log the flag-selected contents of the block.
    ///
    /// # Safety
    /// The mmap and module regions referenced by the block must be readable.
    pub unsafe fn dump(&self) {
        info!("multiboot flags = {:#x}", self.flags);

        assert!(
            self.has_mem_bounds(),
            "no way to size physical memory without mem_lower/mem_upper"
        );
        info!("mem_lower = {}KB, mem_upper = {}KB", self.mem_lower, self.mem_upper);

        if self.has_flag(FLAG_BOOT_DEVICE) {
            info!("boot_device = {:#x}", self.boot_device);
        }
        if self.has_flag(FLAG_CMDLINE) {
            info!("cmdline at {:#x}", self.cmdline);
        }
        if self.has_modules() {
            info!("mods_count = {}, mods_addr = {:#x}", self.mods_count, self.mods_addr);
            for module in unsafe { self.modules() } {
                info!(
                    " mod_start = {:#x}, mod_end = {:#x}",
                    module.mod_start, module.mod_end
                );
            }
        }
        if self.has_mmap() {
            info!("mmaps:");
            for entry in unsafe { self.collect_memory_map() } {
                let (addr, len, kind) = (entry.addr, entry.len, entry.kind);
                info!(" base_addr = {:#x}, length = {:#x}, type = {:#x}", addr, len, kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_kind() {
        let entry = MemMapEntry {
            size: 20,
            addr: 0,
            len: 0x400_0000,
            kind: MEMORY_AVAILABLE,
        };
        assert!(entry.is_available());

        let entry = MemMapEntry {
            size: 20,
            addr: 0x400_0000,
            len: 0x1000,
            kind: MEMORY_RESERVED,
        };
        assert!(!entry.is_available());
    }
}
