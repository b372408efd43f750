//! Kernel binary entry: staged BSP bring-up from the loader handoff to SMP.
//!
//! Stage order is load-bearing; each stage panics if used before its
//! predecessor has run. CPU tables first, then exceptions, serial, the
//! memory map, PMM/VMM, ACPI, APIC, timers, and finally the other cores.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod run {
    use core::panic::PanicInfo;

    use libkernel::addr::{HhdmBase, PAddr, PHYSMAP_BASE};
    use libkernel::boot::{BootInfo, RunTable};
    use libkernel::intr::{exceptions, syscall};
    use libkernel::memm::pmm::FrameAlloc;
    use libkernel::memm::{self, pmm};
    use libkernel::time::hpet::{self, Hpet};
    use libkernel::time::tsc::Tsc;
    use libkernel::{acpi, apic, cpu, out, println, ps2, smp, time};

    use amd64::paging::PTE_MAPPED_SIZE;
    use amd64::registers;

    use spin::Once;

    /// MMIO window holding the IOAPIC, HPET, and LAPIC register blocks;
    /// direct-mapped alongside RAM in case the firmware map omits it.
    const MMIO_WINDOW: (u64, u64) = (0xFEC0_0000, 0xFF00_0000);

    static TSC: Once<Tsc> = Once::new();
    static LAPIC_TIMER: Once<apic::LapicTimer> = Once::new();

    #[no_mangle]
    pub extern "sysv64" fn _start(info: BootInfo) -> ! {
        // CPU tables for the BSP: GDT, TSS, empty IDT
        unsafe { cpu::core_init(0) };

        // exception gates, then a place to complain to
        exceptions::install();
        out::init_logging(log::LevelFilter::Info);
        println!();
        log::info!(
            "kernel entry; xsdp at {:#x}, {} KiB of symbols",
            info.xsdp_paddr,
            info.ksyms.len / 1024
        );

        // classify and collapse the firmware memory map
        let runs = unsafe { RunTable::collapse(&info.mmap) };
        log::info!(
            "mmap: {} descriptors -> {} runs, top of memory {:#x}",
            info.mmap.num_descriptors,
            runs.runs().len(),
            runs.phys_top()
        );

        // physical then virtual memory management
        pmm::init_pmm(unsafe { pmm::RunPmm::from_mmap(&info.mmap) });
        build_physmap(&runs);
        pmm::init_vmm(pmm::PartitionVmm::new());
        out::vga::init();

        // firmware tables; their reclaimable backing pages join the PMM
        // once the tables have been read out
        let acpi_info = read_acpi(PAddr(info.xsdp_paddr));
        pmm::pmm().lock().reclaim_acpi_runs(&runs);

        // interrupt controller and timer stack
        apic::init(acpi_info.lapic_paddr);
        let hpet_paddr = acpi_info.hpet_paddr.expect("no HPET table; timer stack unavailable");
        hpet::init(unsafe { Hpet::new(hpet_paddr.to_vaddr(HhdmBase::Physmap)) }
            .expect("HPET reports an invalid period"));

        match Tsc::init(hpet::hpet()) {
            Ok(tsc) => {
                apic::enable_tsc_deadline_mode();
                let tsc = TSC.call_once(|| tsc);
                time::init_sched_timer(tsc, tsc);
            }
            Err(why) => {
                log::warn!("tsc unusable ({:?}); falling back to HPET + LAPIC one-shot", why);
                let timer = LAPIC_TIMER.call_once(|| apic::LapicTimer::calibrate(hpet::hpet()));
                time::init_sched_timer(hpet::hpet(), timer);
            }
        }

        // software interfaces
        syscall::install();
        match ps2::init() {
            Ok(()) => route_keyboard_irq(&acpi_info),
            Err(why) => log::warn!("ps2: keyboard unavailable: {:?}", why),
        }

        // everyone else
        unsafe { smp::boot_aps(acpi_info.apic_ids()) };

        log::info!("bsp: init complete, idling at {} ns", time::now_ns());
        amd64::interrupts::sti();
        amd64::hlt_loop()
    }

    /// Direct-map RAM and the MMIO window into the physmap slot of the
    /// running (loader-built) address space. Tables are edited through the
    /// identity window, which the firmware tables still provide.
    fn build_physmap(runs: &RunTable) {
        let pml4_vaddr = PAddr(registers::cr3_read()).to_vaddr(HhdmBase::Identity);
        let top = runs.phys_top().0.max(MMIO_WINDOW.1);

        let mut alloc = pmm::pmm().lock();
        unsafe {
            memm::phys_map_region(
                pml4_vaddr,
                PAddr(0),
                PAddr(top),
                HhdmBase::Identity,
                &mut || alloc.alloc_frame(),
            );
        }
        // the new slot becomes visible without a CR3 switch; nothing stale
        // to flush
        log::info!("physmap: 0..{:#x} mapped at {:#x}", top, PHYSMAP_BASE);
    }

    struct AcpiInfo {
        lapic_paddr: PAddr,
        hpet_paddr: Option<PAddr>,
        ioapic: Option<(PAddr, u32)>,
        apic_ids: [u32; cpu::MAX_CORES],
        apic_id_count: usize,
    }

    impl AcpiInfo {
        fn apic_ids(&self) -> &[u32] {
            &self.apic_ids[..self.apic_id_count]
        }
    }

    /// # Panics
    /// A rejected XSDP or XSDT is fatal: without them there is no APIC
    /// enumeration and no timer.
    fn read_acpi(xsdp_paddr: PAddr) -> AcpiInfo {
        let xsdp_bytes = unsafe { phys_slice(xsdp_paddr, acpi::XSDP_MIN_LENGTH) };
        let xsdp = acpi::Xsdp::validate(xsdp_bytes)
            .unwrap_or_else(|why| panic!("XSDP rejected: {:?}", why));

        let xsdt = unsafe { sdt_slice(xsdp.xsdt_paddr()) };
        let xsdt = acpi::validate_sdt(xsdt, acpi::XSDT_SIGNATURE)
            .unwrap_or_else(|why| panic!("XSDT rejected: {:?}", why));

        let mut info = AcpiInfo {
            lapic_paddr: PAddr(0xFEE0_0000),
            hpet_paddr: None,
            ioapic: None,
            apic_ids: [0; cpu::MAX_CORES],
            apic_id_count: 0,
        };

        for entry_paddr in acpi::xsdt_entries(xsdt) {
            let table = unsafe { sdt_slice(entry_paddr) };
            if table[..4] == acpi::MADT_SIGNATURE[..] {
                match acpi::validate_sdt(table, acpi::MADT_SIGNATURE) {
                    Ok(madt) => read_madt(madt, &mut info),
                    Err(why) => log::warn!("MADT rejected ({:?}); continuing without it", why),
                }
            } else if table[..4] == acpi::HPET_SIGNATURE[..] {
                match acpi::validate_sdt(table, acpi::HPET_SIGNATURE) {
                    Ok(hpet) => info.hpet_paddr = acpi::hpet_mmio_paddr(hpet).ok(),
                    Err(why) => log::warn!("HPET table rejected ({:?}); continuing without it", why),
                }
            }
        }

        info
    }

    fn read_madt(madt: &[u8], info: &mut AcpiInfo) {
        info.lapic_paddr = acpi::madt_lapic_paddr(madt);
        for record in acpi::madt_records(madt) {
            match record {
                acpi::MadtRecord::LocalApic { apic_id, enabled: true, .. } => {
                    if info.apic_id_count < info.apic_ids.len() {
                        info.apic_ids[info.apic_id_count] = apic_id as u32;
                        info.apic_id_count += 1;
                    } else {
                        log::warn!("more than {} cores reported; extras ignored", cpu::MAX_CORES);
                    }
                }
                acpi::MadtRecord::LapicAddrOverride { mmio_paddr } => {
                    info.lapic_paddr = PAddr(mmio_paddr);
                }
                acpi::MadtRecord::IoApic { mmio_paddr, gsi_base, .. } => {
                    info.ioapic = Some((PAddr(mmio_paddr as u64), gsi_base));
                }
                _ => {}
            }
        }
        log::info!(
            "madt: lapic at {:#x}, {} enabled cores",
            info.lapic_paddr,
            info.apic_id_count
        );
    }

    /// Point keyboard interrupts (GSI 1) at the BSP and register the drain
    /// handler at the legacy IRQ 1 vector.
    fn route_keyboard_irq(acpi_info: &AcpiInfo) {
        let (ioapic_paddr, gsi_base) = match acpi_info.ioapic {
            Some(ioapic) => ioapic,
            None => {
                log::warn!("no IOAPIC in the MADT; keyboard interrupts stay unrouted");
                return;
            }
        };

        libkernel::intr::register_external(apic::irq_vector(1), keyboard_irq);
        let ioapic = unsafe { apic::IoApic::new(ioapic_paddr, gsi_base) };
        ioapic.route(1, apic::irq_vector(1), apic::lapic().apic_id());
    }

    fn keyboard_irq(_ctx: &mut libkernel::intr::Context) {
        while let Some(scancode) = ps2::read_scancode() {
            log::debug!("ps2: scancode {:#04x}", scancode);
        }
    }

    /// A physmap view of `len` bytes of physical memory.
    unsafe fn phys_slice(paddr: PAddr, len: usize) -> &'static [u8] {
        core::slice::from_raw_parts(paddr.to_vaddr(HhdmBase::Physmap).as_ptr::<u8>(), len)
    }

    /// A physmap view of a full SDT: header first for the length, then the
    /// declared extent.
    unsafe fn sdt_slice(paddr: PAddr) -> &'static [u8] {
        let header = phys_slice(paddr, acpi::SDT_HEADER_LEN);
        let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        // clamp nonsense before validation sees it
        let length = length.clamp(acpi::SDT_HEADER_LEN, 16 * PTE_MAPPED_SIZE as usize);
        phys_slice(paddr, length)
    }

    #[panic_handler]
    fn panic_handler(info: &PanicInfo) -> ! {
        println!("\n*** KERNEL PANIC ***\n{}", info);
        amd64::interrupts::cli();
        amd64::hlt_loop()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
