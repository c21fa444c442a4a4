//! PCI configuration space access and bus enumeration (legacy port I/O
//! mechanism #1).

extern crate alloc;

use alloc::vec::Vec;

use spin::Mutex;

pub const REG_COMMAND: u8 = 0x04;
pub const REG_STATUS: u8 = 0x06;
pub const REG_BAR0: u8 = 0x10;
pub const REG_BAR1: u8 = 0x14;
pub const REG_CAP_PTR: u8 = 0x34;

pub const CMD_MEM_SPACE: u16 = 1 << 1;
pub const CMD_BUS_MASTER: u16 = 1 << 2;
pub const CMD_INTX_DISABLE: u16 = 1 << 10;

/// Capability IDs.
pub const CAP_MSI: u8 = 0x05;

#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
}

static DEVICES: Mutex<Vec<PciDevice>> = Mutex::new(Vec::new());

/// CONFIG_ADDRESS encoding: enable | bus | device | function | aligned
/// register offset.
fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | ((bus as u32) << 16)
        | ((device as u32 & 0x1F) << 11)
        | ((function as u32 & 0x07) << 8)
        | (offset as u32 & 0xFC)
}

#[cfg(target_os = "none")]
fn io_read32(address: u32) -> u32 {
    use x86_64::instructions::port::Port;
    let mut addr: Port<u32> = Port::new(0xCF8);
    let mut data: Port<u32> = Port::new(0xCFC);
    // SAFETY: standard PCI configuration mechanism ports.
    unsafe {
        addr.write(address);
        data.read()
    }
}

#[cfg(not(target_os = "none"))]
fn io_read32(_address: u32) -> u32 {
    0xFFFF_FFFF
}

#[cfg(target_os = "none")]
fn io_write32(address: u32, value: u32) {
    use x86_64::instructions::port::Port;
    let mut addr: Port<u32> = Port::new(0xCF8);
    let mut data: Port<u32> = Port::new(0xCFC);
    // SAFETY: standard PCI configuration mechanism ports.
    unsafe {
        addr.write(address);
        data.write(value);
    }
}

#[cfg(not(target_os = "none"))]
fn io_write32(_address: u32, _value: u32) {}

pub fn read32(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    io_read32(config_address(bus, device, function, offset))
}

pub fn read16(bus: u8, device: u8, function: u8, offset: u8) -> u16 {
    (read32(bus, device, function, offset) >> ((offset as u32 & 2) * 8)) as u16
}

pub fn read8(bus: u8, device: u8, function: u8, offset: u8) -> u8 {
    (read32(bus, device, function, offset) >> ((offset as u32 & 3) * 8)) as u8
}

pub fn write32(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    io_write32(config_address(bus, device, function, offset), value);
}

pub fn write16(bus: u8, device: u8, function: u8, offset: u8, value: u16) {
    let aligned = read32(bus, device, function, offset);
    let shift = (offset as u32 & 2) * 8;
    let merged = (aligned & !(0xFFFF << shift)) | ((value as u32) << shift);
    io_write32(config_address(bus, device, function, offset), merged);
}

/// Walk the capability list for `cap_id`; returns its config offset or 0.
pub fn find_capability(bus: u8, device: u8, function: u8, cap_id: u8) -> u8 {
    let status = read16(bus, device, function, REG_STATUS);
    if status & (1 << 4) == 0 {
        return 0; // no capability list
    }
    let mut ptr = read8(bus, device, function, REG_CAP_PTR) & 0xFC;
    for _ in 0..48 {
        if ptr == 0 {
            break;
        }
        let id = read8(bus, device, function, ptr);
        if id == cap_id {
            return ptr;
        }
        ptr = read8(bus, device, function, ptr + 1) & 0xFC;
    }
    0
}

fn probe(bus: u8, device: u8, function: u8) -> Option<PciDevice> {
    let id = read32(bus, device, function, 0);
    let vendor_id = (id & 0xFFFF) as u16;
    if vendor_id == 0xFFFF {
        return None;
    }
    let class_reg = read32(bus, device, function, 0x08);
    Some(PciDevice {
        bus,
        device,
        function,
        vendor_id,
        device_id: (id >> 16) as u16,
        class_code: (class_reg >> 24) as u8,
        subclass: (class_reg >> 16) as u8,
        prog_if: (class_reg >> 8) as u8,
    })
}

/// Brute-force scan of bus 0..=255, honoring the multifunction bit.
pub fn scan() {
    let mut found = Vec::new();
    for bus in 0..=255u8 {
        for device in 0..32u8 {
            let Some(dev) = probe(bus, device, 0) else {
                continue;
            };
            found.push(dev);
            let header = read8(bus, device, 0, 0x0E);
            if header & 0x80 != 0 {
                for function in 1..8u8 {
                    if let Some(dev) = probe(bus, device, function) {
                        found.push(dev);
                    }
                }
            }
        }
    }
    log::info!(target: "pci", "scan found {} devices", found.len());
    *DEVICES.lock() = found;
}

pub fn devices() -> Vec<PciDevice> {
    DEVICES.lock().clone()
}

pub fn find_by_class(class_code: u8, subclass: u8, prog_if: u8) -> Option<PciDevice> {
    DEVICES
        .lock()
        .iter()
        .find(|d| d.class_code == class_code && d.subclass == subclass && d.prog_if == prog_if)
        .copied()
}

/// Human-readable class for `devlist`.
pub fn class_name(class_code: u8, subclass: u8) -> &'static str {
    match (class_code, subclass) {
        (0x01, 0x06) => "SATA Controller",
        (0x01, _) => "Storage Controller",
        (0x02, 0x00) => "Ethernet Controller",
        (0x02, _) => "Network Controller",
        (0x03, _) => "Display Controller",
        (0x04, _) => "Multimedia Controller",
        (0x06, 0x00) => "Host Bridge",
        (0x06, 0x01) => "ISA Bridge",
        (0x06, 0x04) => "PCI-PCI Bridge",
        (0x06, _) => "Bridge",
        (0x0C, 0x03) => "USB Controller",
        (0x0C, _) => "Serial Bus Controller",
        _ => "PCI Device",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_address_packs_bdf_and_masks_offset() {
        assert_eq!(config_address(0, 0, 0, 0), 0x8000_0000);
        assert_eq!(config_address(1, 2, 3, 0x10), 0x8001_1310);
        // Offset must be dword-aligned in the address.
        assert_eq!(
            config_address(0, 0, 0, 0x13) & 0xFF,
            0x10
        );
        // Device and function fields saturate at their widths.
        assert_eq!(config_address(0, 31, 7, 0), 0x8000_FF00);
    }
}
