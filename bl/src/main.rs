//! OS loader UEFI application.
//!
//! Runs identity mapped under firmware page tables, which it clones into a
//! writable PML4 before mapping the kernel ELF at its linked higher-half
//! addresses. Hands the kernel a [`BootInfo`] with the XSDP, the raw memory
//! map snapshot, and the symbol map blob, then never returns.

#![no_std]
#![no_main]
#![feature(abi_efiapi)]

extern crate alloc;

use core::{mem, slice};

use amd64::paging::{PageSize, PTE_MAPPED_SIZE, TABLE_LEN};
use amd64::registers::{self, EFER};
use elf_rs::{Elf, ProgramType};
use libkernel::addr::{HhdmBase, PAddr, VAddr};
use libkernel::boot::{BootInfo, KernelSyms, MMap, MemoryDescriptor};
use libkernel::memm;
use log::*;
use uefi::prelude::*;
use uefi::proto::media::file::{File, FileAttribute, FileInfo, FileMode, FileType};
use uefi::table::boot::{AllocateType, MemoryDescriptor as UefiMemoryDescriptor, MemoryType};
use uefi::table::cfg;

#[no_mangle]
pub extern "efiapi" fn efi_main(image: Handle, mut st: SystemTable<Boot>) -> Status {
    // Initialize UEFI services
    uefi_services::init(&mut st).expect_success("Failed to initialize UEFI services");
    st.stdout().reset(false).expect_success("Failed to reset stdout");

    info!("Cloning firmware page tables...");
    let pml4_paddr = clone_pml4(&mut st);
    unsafe { registers::cr3_write(pml4_paddr.0) };

    // kernel mappings use the NX bit
    let efer = registers::rdmsr(registers::EFER_MSR);
    unsafe { registers::wrmsr(registers::EFER_MSR, efer | EFER::NXE.bits()) };

    info!("Reading kernel from disk...");
    let kernel_elf = read_file(&image, &mut st, "kernel.elf");
    let kernel_map = read_file(&image, &mut st, "kernel.map");

    info!("Loading and mapping kernel...");
    // segment copies write through freshly mapped read-only text pages
    unsafe { registers::set_write_protect(false) };
    let entry_point = load_elf_kernel(&mut st, pml4_paddr, kernel_elf);
    unsafe { registers::set_write_protect(true) };

    let xsdp_paddr = find_xsdp(&st);
    info!("ACPI 2.0 XSDP at {:#x}", xsdp_paddr);

    // exit boot services as late as possible to avoid silent panics or
    // allocator issues
    info!("Exiting boot services...");
    let mmap = exit_boot_services(image, st);

    let payload = BootInfo {
        xsdp_paddr,
        mmap,
        ksyms: KernelSyms { ptr: kernel_map.as_ptr(), len: kernel_map.len() as u64 },
    };

    let kn_start: extern "sysv64" fn(BootInfo) -> ! = unsafe { mem::transmute(entry_point) };
    kn_start(payload);
}

fn alloc_pages(st: &mut SystemTable<Boot>, size_at_least: usize) -> u64 {
    // custom MemoryTypes hang a lot of firmware, so everything the kernel
    // must outlive boot services in is plain LOADER_DATA
    // https://wiki.osdev.org/UEFI#My_bootloader_hangs_if_I_use_user_defined_EFI_MEMORY_TYPE_values
    let page_count = (size_at_least + PTE_MAPPED_SIZE as usize - 1) / PTE_MAPPED_SIZE as usize;
    st.boot_services()
        .allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, page_count)
        .expect_success("failed to allocate loader data pages")
}

/// Copy the firmware PML4 into a fresh writable page. The lower subtrees are
/// shared; only the top level needs to take new physmap/kernel slots.
fn clone_pml4(st: &mut SystemTable<Boot>) -> PAddr {
    let clone_paddr = alloc_pages(st, PTE_MAPPED_SIZE as usize);
    let firmware = registers::cr3_read();
    unsafe {
        let src = slice::from_raw_parts(firmware as *const u64, TABLE_LEN);
        let dst = slice::from_raw_parts_mut(clone_paddr as *mut u64, TABLE_LEN);
        dst.copy_from_slice(src);
    }
    PAddr(clone_paddr)
}

fn read_file(image: &Handle, st: &mut SystemTable<Boot>, path: &str) -> &'static mut [u8] {
    // get EFI_SIMPLE_FILE_SYSTEM_PROTOCOL, the root directory of the volume,
    // then the EFI_FILE_PROTOCOL handle
    let sfs = st
        .boot_services()
        .get_image_file_system(*image)
        .expect_success("failed to retrieve EFI filesystem");
    let mut fs = unsafe { sfs.interface.get().as_mut().unwrap() }
        .open_volume()
        .expect_success("failed to get root of EFI filesystem");
    let fh = fs
        .open(path, FileMode::Read, FileAttribute::READ_ONLY)
        .expect_success("failed to open file on the ESP");
    drop(sfs);

    if let FileType::Regular(mut file) = fh.into_type().expect_success("failed to type FileHandle") {
        // probe for the info size, then fetch it
        let file_info_size = file
            .get_info::<FileInfo>(&mut alloc::vec![0u8])
            .expect_error("file info probe unexpectedly succeeded")
            .data()
            .unwrap();
        let mut file_info_buffer = alloc::vec![0u8; file_info_size];
        let file_info = file
            .get_info::<FileInfo>(&mut file_info_buffer[..])
            .expect_success("file info failed");

        let data_len = file_info.file_size() as usize;
        let data_base = alloc_pages(st, data_len);
        let data = unsafe { slice::from_raw_parts_mut(data_base as *mut u8, data_len) };
        file.read(data).expect_success("file read failed");
        data
    } else {
        panic!("unexpected directory at {}", path)
    }
}

/// Load every PT_LOAD segment into fresh frames mapped at its linked virtual
/// address with permissions from `p_flags`, and zero the BSS tail. Returns
/// the ELF entry point.
fn load_elf_kernel(st: &mut SystemTable<Boot>, pml4_paddr: PAddr, elf_data: &[u8]) -> u64 {
    let elf = match Elf::from_bytes(elf_data).expect("kernel ELF parse failed") {
        Elf::Elf64(elf) => elf,
        Elf::Elf32(_) => panic!("32 bit kernel binary is unsupported"),
    };

    let pml4_vaddr = pml4_paddr.to_vaddr(HhdmBase::Identity);

    for phdr in elf.program_headers() {
        if phdr.ph_type() != ProgramType::LOAD {
            continue;
        }

        let page_count = (phdr.memsz() + PTE_MAPPED_SIZE - 1) / PTE_MAPPED_SIZE;
        let segment_phys = alloc_pages(st, (page_count * PTE_MAPPED_SIZE) as usize);

        let leaf = memm::elf_segment_flags(phdr.flags());

        for page in 0..page_count {
            let offset = page * PTE_MAPPED_SIZE;
            unsafe {
                memm::map_page(
                    pml4_vaddr,
                    VAddr(phdr.vaddr() + offset),
                    PAddr(segment_phys + offset),
                    PageSize::Page4K,
                    leaf,
                    HhdmBase::Identity,
                    &mut || {
                        Some(PAddr(
                            st.boot_services()
                                .allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, 1)
                                .expect_success("failed to allocate a page table frame"),
                        ))
                    },
                );
            }
        }

        // copy the file extent into the mapped range, zero up to memsz
        let (p_offset, p_filesz) = (phdr.offset() as usize, phdr.filesz() as usize);
        let dest =
            unsafe { slice::from_raw_parts_mut(phdr.vaddr() as *mut u8, phdr.memsz() as usize) };
        dest[..p_filesz].copy_from_slice(&elf_data[p_offset..p_offset + p_filesz]);
        dest[p_filesz..].fill(0);

        info!(
            "mapped segment {:#x}..{:#x} ({} pages, {}{}{})",
            phdr.vaddr(),
            phdr.vaddr() + phdr.memsz(),
            page_count,
            if phdr.flags() & 0b100 != 0 { "r" } else { "-" },
            if phdr.flags() & 0b010 != 0 { "w" } else { "-" },
            if phdr.flags() & 0b001 != 0 { "x" } else { "-" },
        );
    }

    elf.header().entry_point()
}

/// Locate the ACPI 2.0 root pointer in the configuration table.
fn find_xsdp(st: &SystemTable<Boot>) -> u64 {
    st.config_table()
        .iter()
        .find(|entry| entry.guid == cfg::ACPI2_GUID)
        .map(|entry| entry.address as u64)
        .expect("no ACPI 2.0 table in the UEFI configuration table")
}

/// Snapshot the memory map and leave boot services. The map may change
/// between the snapshot and the exit call, in which case the exit fails with
/// a stale key; one re-snapshot and retry is attempted before giving up.
fn exit_boot_services(image: Handle, st: SystemTable<Boot>) -> MMap {
    // allocating the buffer may itself create regions, thus the margin
    let est_mmap_size = st.boot_services().memory_map_size().map_size
        + 8 * mem::size_of::<UefiMemoryDescriptor>();
    let mmap_base = st
        .boot_services()
        .allocate_pages(
            AllocateType::AnyPages,
            MemoryType::LOADER_DATA,
            (est_mmap_size + PTE_MAPPED_SIZE as usize - 1) / PTE_MAPPED_SIZE as usize,
        )
        .expect_success("failed to allocate the memory map buffer");
    let mmap_buf = unsafe { slice::from_raw_parts_mut(mmap_base as *mut u8, est_mmap_size) };

    let (key, _) = st
        .boot_services()
        .memory_map(mmap_buf)
        .expect_success("failed to retrieve UEFI memory map");

    match unsafe { st.unsafe_clone() }.exit_boot_services(image, &mut *mmap_buf) {
        Ok(completion) => {
            let (_st_runtime, mmap_iter) = completion.log();
            compact_mmap(key, mmap_base, mmap_iter)
        }
        Err(_) => {
            // the map changed under the snapshot; boot services are still up,
            // so take a fresh, larger snapshot and try exactly once more
            warn!("ExitBootServices saw a stale map key; re-snapshotting and retrying");
            let retry_size = st.boot_services().memory_map_size().map_size
                + 8 * mem::size_of::<UefiMemoryDescriptor>();
            let retry_base = st
                .boot_services()
                .allocate_pages(
                    AllocateType::AnyPages,
                    MemoryType::LOADER_DATA,
                    (retry_size + PTE_MAPPED_SIZE as usize - 1) / PTE_MAPPED_SIZE as usize,
                )
                .expect_success("failed to allocate the retry memory map buffer");
            let retry_buf =
                unsafe { slice::from_raw_parts_mut(retry_base as *mut u8, retry_size) };
            let (key, _) = st
                .boot_services()
                .memory_map(&mut *retry_buf)
                .expect_success("failed to re-snapshot the UEFI memory map");
            let (_st_runtime, mmap_iter) = st
                .exit_boot_services(image, retry_buf)
                .expect_success("exit boot services failed after retry");
            compact_mmap(key, retry_base, mmap_iter)
        }
    }
}

/// Move the descriptors to the front of the buffer at the compiled-in
/// stride; future firmware may hand out larger descriptors, but never
/// smaller, so the rewrite always fits.
fn compact_mmap<'buf>(
    key: uefi::table::boot::MemoryMapKey,
    mmap_base: u64,
    mut mmap_iter: impl ExactSizeIterator<Item = &'buf UefiMemoryDescriptor>,
) -> MMap {
    let num_descriptors = mmap_iter.len();
    let mmap_slice = unsafe {
        slice::from_raw_parts_mut(mmap_base as *mut UefiMemoryDescriptor, num_descriptors)
    };
    mmap_slice.fill_with(|| *mmap_iter.next().unwrap());

    MMap {
        key: unsafe { mem::transmute(key) },
        mmap: mmap_base as *mut MemoryDescriptor,
        mmap_size: (num_descriptors * mem::size_of::<UefiMemoryDescriptor>()) as u64,
        descriptor_size: mem::size_of::<UefiMemoryDescriptor>() as u64,
        num_descriptors: num_descriptors as u64,
    }
}
