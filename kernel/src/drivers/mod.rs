//! Hardware drivers: PCI config access, the central input state, and the
//! xHCI USB host controller with its HID consumers.

pub mod input;
pub mod pci;
pub mod usb;
