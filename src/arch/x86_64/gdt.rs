/*
 * Global Descriptor Table (GDT) Implementation
 *
 * x86_64 uses a flat memory model, but a valid GDT is still required for the
 * code and stack segment selectors that every interrupt frame and every saved
 * thread context carries. The threading core installs a minimal kernel-only
 * table (null, kernel code, kernel data) once during platform bringup; a
 * kernel that later grows user-mode support is expected to rebuild the table
 * with user segments and a TSS on its own.
 *
 * The selectors handed out here are the ones seeded into the saved context of
 * every new thread, so the first switch into a thread "returns" with the same
 * privileged segments the rest of the kernel runs with.
 */

use lazy_static::lazy_static;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
            },
        )
    };
}

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
}

/// Load the kernel segment table and reload the segment registers.
///
/// Must run once, before the first thread is created and before interrupts
/// are enabled. Bare-metal only; hosted test builds never call this.
#[cfg(not(test))]
pub fn init() {
    use x86_64::instructions::segmentation::{CS, DS, ES, FS, GS, SS, Segment};

    log::info!("Loading kernel GDT...");
    GDT.0.load();

    unsafe {
        // Reload CS to the new code segment, then point every data segment
        // register at the new data descriptor so no register is left holding
        // a selector into whatever table the bootloader used.
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        FS::set_reg(GDT.1.data_selector);
        GS::set_reg(GDT.1.data_selector);
    }

    log::info!("GDT loaded");
}

/// Kernel code segment selector, as seeded into new thread contexts.
pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.code_selector
}

/// Kernel data segment selector, used as the stack segment of new threads.
pub fn kernel_data_selector() -> SegmentSelector {
    GDT.1.data_selector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_match_table_order() {
        // Descriptor slots start after the null entry, 8 bytes apart; the
        // context seeding relies on these exact selector values.
        assert_eq!(kernel_code_selector().0, 0x08);
        assert_eq!(kernel_data_selector().0, 0x10);
    }
}
