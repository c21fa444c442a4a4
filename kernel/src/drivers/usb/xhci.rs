//! xHCI (USB 3.x) host controller driver.
//!
//! Bring-up, command/event/transfer ring mechanics, control transfers,
//! interrupt-IN polling for HID devices, MSI delivery, and deferred
//! hot-plug handling. Everything DMA-visible lives in whole physical
//! frames tracked by address; rings are plain TRB arrays with the
//! link-TRB/cycle-bit discipline:
//!
//! * a TRB is valid for its consumer when its cycle bit equals the
//!   consumer's cycle state (CCS);
//! * the last slot of every producer ring is a Link TRB back to the base;
//!   when the producer reaches it, it stamps the link with the current
//!   cycle and toggles its own CCS.

use spin::Mutex;

use crate::{
    arch::x86_64::{apic, idt},
    error::{KernelError, KernelResult},
    mm::{frame_allocator, hhdm, page_table, FRAME_SIZE},
    timer,
};

use super::{device, hid};

pub const MAX_SLOTS: usize = 16;
pub const MAX_PORTS: usize = 32;

/// TRBs per one-frame ring.
pub const RING_SIZE: usize = FRAME_SIZE / core::mem::size_of::<Trb>();

/// Bounded poll iterations for commands and transfers.
const POLL_BUDGET: u32 = 100_000;

/// IRQ registry slot used for the MSI vector.
const MSI_IRQ_SLOT: usize = 0;

// Capability registers.
const CAP_CAPLENGTH: u64 = 0x00;
const CAP_HCSPARAMS1: u64 = 0x04;
const CAP_HCSPARAMS2: u64 = 0x08;
const CAP_DBOFF: u64 = 0x14;
const CAP_RTSOFF: u64 = 0x18;

// Operational registers (offsets from op base).
const OP_USBCMD: u64 = 0x00;
const OP_USBSTS: u64 = 0x04;
const OP_CRCR: u64 = 0x18;
const OP_DCBAAP: u64 = 0x30;
const OP_CONFIG: u64 = 0x38;
const OP_PORTSC_BASE: u64 = 0x400;
const OP_PORTSC_STRIDE: u64 = 0x10;

// Runtime registers (offsets from rt base), interrupter 0.
const IR0_IMAN: u64 = 0x20;
const IR0_IMOD: u64 = 0x24;
const IR0_ERSTSZ: u64 = 0x28;
const IR0_ERSTBA: u64 = 0x30;
const IR0_ERDP: u64 = 0x38;

// USBCMD bits.
const USBCMD_RS: u32 = 1 << 0;
const USBCMD_HCRST: u32 = 1 << 1;
const USBCMD_INTE: u32 = 1 << 2;
const USBCMD_HSEE: u32 = 1 << 3;

// USBSTS bits.
const USBSTS_HCH: u32 = 1 << 0;
const USBSTS_EINT: u32 = 1 << 3;
const USBSTS_CNR: u32 = 1 << 11;

// IMAN bits.
const IMAN_IP: u32 = 1 << 0;
const IMAN_IE: u32 = 1 << 1;

// PORTSC bits.
pub const PORTSC_CCS: u32 = 1 << 0;
pub const PORTSC_PED: u32 = 1 << 1;
pub const PORTSC_PR: u32 = 1 << 4;
pub const PORTSC_PP: u32 = 1 << 9;
pub const PORTSC_PRC: u32 = 1 << 21;
/// RW1C change bits (CSC..CEC); written back to acknowledge.
pub const PORTSC_CHANGE_BITS: u32 = 0x00FE_0000;
/// RW bits preserved on writes so a read-modify-write cannot ack changes
/// by accident.
pub const PORTSC_PRESERVE: u32 = 0x0E00_C3E0;

// TRB types.
pub const TRB_NORMAL: u32 = 1;
pub const TRB_SETUP_STAGE: u32 = 2;
pub const TRB_DATA_STAGE: u32 = 3;
pub const TRB_STATUS_STAGE: u32 = 4;
pub const TRB_LINK: u32 = 6;
pub const TRB_ENABLE_SLOT: u32 = 9;
pub const TRB_ADDRESS_DEVICE: u32 = 11;
pub const TRB_CONFIGURE_ENDPOINT: u32 = 12;
pub const TRB_EVALUATE_CONTEXT: u32 = 13;
pub const TRB_TRANSFER_EVENT: u32 = 32;
pub const TRB_COMMAND_COMPLETION: u32 = 33;
pub const TRB_PORT_STATUS_CHANGE: u32 = 34;

pub const TRB_TYPE_SHIFT: u32 = 10;
pub const TRB_TYPE_MASK: u32 = 0x3F << TRB_TYPE_SHIFT;

// TRB control bits.
pub const TRB_CYCLE: u32 = 1 << 0;
/// On Link TRBs bit 1 is Toggle Cycle.
pub const TRB_TOGGLE_CYCLE: u32 = 1 << 1;
pub const TRB_ISP: u32 = 1 << 2;
pub const TRB_IOC: u32 = 1 << 5;
pub const TRB_IDT: u32 = 1 << 6;
pub const TRB_BSR: u32 = 1 << 9;
pub const TRB_DIR_IN: u32 = 1 << 16;
pub const TRB_TRT_OUT: u32 = 2 << 16;
pub const TRB_TRT_IN: u32 = 3 << 16;

// Completion codes.
pub const CC_SUCCESS: u32 = 1;
pub const CC_SHORT_PACKET: u32 = 13;
/// Synthetic code for a timed-out command or transfer.
pub const CC_TIMEOUT: u32 = 0xFF;

/// 16-byte Transfer Request Block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trb {
    pub param_lo: u32,
    pub param_hi: u32,
    pub status: u32,
    pub control: u32,
}

impl Trb {
    pub const fn zeroed() -> Self {
        Self {
            param_lo: 0,
            param_hi: 0,
            status: 0,
            control: 0,
        }
    }

    pub fn with_parameter(mut self, parameter: u64) -> Self {
        self.param_lo = parameter as u32;
        self.param_hi = (parameter >> 32) as u32;
        self
    }

    pub fn parameter(&self) -> u64 {
        self.param_lo as u64 | ((self.param_hi as u64) << 32)
    }

    pub fn trb_type(&self) -> u32 {
        (self.control & TRB_TYPE_MASK) >> TRB_TYPE_SHIFT
    }

    pub fn cycle(&self) -> bool {
        self.control & TRB_CYCLE != 0
    }

    /// Completion code of an event TRB.
    pub fn completion_code(&self) -> u32 {
        (self.status >> 24) & 0xFF
    }

    /// Slot id of an event TRB.
    pub fn slot_id(&self) -> u32 {
        (self.control >> 24) & 0xFF
    }

    /// Endpoint DCI of a transfer event.
    pub fn endpoint_dci(&self) -> u32 {
        (self.control >> 16) & 0x1F
    }
}

// ---------------------------------------------------------------------------
// Ring mechanics
// ---------------------------------------------------------------------------

/// Software-producer ring (command and transfer rings).
#[derive(Debug, Clone, Copy)]
pub struct ProducerRing {
    /// Kernel-virtual base of the TRB array.
    base: u64,
    /// Physical base, planted in the Link TRB and handed to hardware.
    phys: u64,
    enqueue: usize,
    cycle: bool,
    size: usize,
}

impl ProducerRing {
    pub const fn empty() -> Self {
        Self {
            base: 0,
            phys: 0,
            enqueue: 0,
            cycle: true,
            size: RING_SIZE,
        }
    }

    /// Wrap a zeroed TRB array and plant the Link TRB in the last slot.
    ///
    /// # Safety
    /// `base` must point at `size` TRBs of exclusively owned memory whose
    /// physical address is `phys`.
    pub unsafe fn new(base: u64, phys: u64, size: usize) -> Self {
        let mut ring = Self {
            base,
            phys,
            enqueue: 0,
            cycle: true,
            size,
        };
        let link = Trb {
            param_lo: phys as u32,
            param_hi: (phys >> 32) as u32,
            status: 0,
            control: (TRB_LINK << TRB_TYPE_SHIFT) | TRB_TOGGLE_CYCLE,
        };
        // SAFETY: per the constructor contract.
        unsafe {
            ring.write_slot(size - 1, link);
        }
        ring
    }

    pub fn is_initialized(&self) -> bool {
        self.base != 0
    }

    pub fn phys_base(&self) -> u64 {
        self.phys
    }

    /// Physical address of the next TRB the hardware will consume, with
    /// the DCS bit reflecting the producer cycle state.
    pub fn dequeue_pointer(&self) -> u64 {
        let addr = self.phys + (self.enqueue * core::mem::size_of::<Trb>()) as u64;
        if self.cycle {
            addr | 1
        } else {
            addr
        }
    }

    unsafe fn write_slot(&mut self, index: usize, trb: Trb) {
        let ptr = (self.base as *mut Trb).wrapping_add(index);
        // SAFETY: index < size and the array is owned by this ring.
        unsafe {
            core::ptr::write_volatile(ptr, trb);
        }
    }

    unsafe fn read_slot(&self, index: usize) -> Trb {
        let ptr = (self.base as *const Trb).wrapping_add(index);
        // SAFETY: index < size and the array is owned by this ring.
        unsafe { core::ptr::read_volatile(ptr) }
    }

    /// Enqueue one TRB with the current producer cycle state. When the
    /// enqueue index reaches the Link TRB, stamp its cycle bit, toggle the
    /// producer cycle and wrap.
    pub fn push(&mut self, trb: Trb) {
        let mut control = trb.control & !TRB_CYCLE;
        if self.cycle {
            control |= TRB_CYCLE;
        }
        let stamped = Trb { control, ..trb };
        // SAFETY: enqueue is always < size - 1 here.
        unsafe {
            self.write_slot(self.enqueue, stamped);
        }

        self.enqueue += 1;
        if self.enqueue >= self.size - 1 {
            // SAFETY: last slot holds the Link TRB planted at init.
            unsafe {
                let mut link = self.read_slot(self.size - 1);
                if self.cycle {
                    link.control |= TRB_CYCLE;
                } else {
                    link.control &= !TRB_CYCLE;
                }
                self.write_slot(self.size - 1, link);
            }
            self.cycle = !self.cycle;
            self.enqueue = 0;
        }
    }
}

/// Hardware-producer ring (the event ring). No Link TRB: wrap-around is
/// implicit in the single-segment layout, toggling the consumer cycle.
#[derive(Debug, Clone, Copy)]
pub struct EventRing {
    base: u64,
    phys: u64,
    dequeue: usize,
    cycle: bool,
    size: usize,
}

impl EventRing {
    pub const fn empty() -> Self {
        Self {
            base: 0,
            phys: 0,
            dequeue: 0,
            cycle: true,
            size: RING_SIZE,
        }
    }

    /// # Safety
    /// `base`/`phys` must describe a zeroed, exclusively owned TRB array.
    pub unsafe fn new(base: u64, phys: u64, size: usize) -> Self {
        Self {
            base,
            phys,
            dequeue: 0,
            cycle: true,
            size,
        }
    }

    /// Consume the next event if its cycle bit matches the consumer state.
    pub fn pop(&mut self) -> Option<Trb> {
        let ptr = (self.base as *const Trb).wrapping_add(self.dequeue);
        // SAFETY: dequeue < size; the array outlives the controller.
        let trb = unsafe { core::ptr::read_volatile(ptr) };
        if trb.cycle() != self.cycle {
            return None;
        }
        self.dequeue += 1;
        if self.dequeue >= self.size {
            self.dequeue = 0;
            self.cycle = !self.cycle;
        }
        Some(trb)
    }

    /// ERDP value for the current dequeue position.
    pub fn dequeue_pointer(&self) -> u64 {
        self.phys + (self.dequeue * core::mem::size_of::<Trb>()) as u64
    }
}

// ---------------------------------------------------------------------------
// Per-device state
// ---------------------------------------------------------------------------

pub struct DeviceSlot {
    pub active: bool,
    pub port_id: u8,
    pub speed: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub iface_class: u8,
    pub iface_subclass: u8,
    pub iface_protocol: u8,
    /// Output device context frame (DMA).
    pub output_ctx_phys: u64,
    pub ep0_ring: ProducerRing,
    pub int_ring: ProducerRing,
    pub int_ep_num: u8,
    pub int_max_packet: u16,
    pub int_interval: u8,
    /// Per-slot interrupt data buffer (one frame).
    pub int_buf_phys: u64,
}

impl DeviceSlot {
    const fn empty() -> Self {
        Self {
            active: false,
            port_id: 0,
            speed: 0,
            vendor_id: 0,
            product_id: 0,
            iface_class: 0,
            iface_subclass: 0,
            iface_protocol: 0,
            output_ctx_phys: 0,
            ep0_ring: ProducerRing::empty(),
            int_ring: ProducerRing::empty(),
            int_ep_num: 0,
            int_max_packet: 0,
            int_interval: 0,
            int_buf_phys: 0,
        }
    }
}

/// Copyable summary for the `devlist` syscall.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSummary {
    pub port_id: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub iface_class: u8,
    pub iface_protocol: u8,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub(super) struct Controller {
    op_base: u64,
    rt_base: u64,
    db_base: u64,
    pub(super) max_slots: u32,
    max_ports: u32,
    dcbaa_va: u64,
    pub(super) cmd_ring: ProducerRing,
    evt_ring: EventRing,
    cmd_completed: bool,
    cmd_code: u32,
    pub(super) cmd_slot_id: u32,
    xfer_completed: bool,
    xfer_code: u32,
    pub(super) devices: [DeviceSlot; MAX_SLOTS + 1],
    boot_scan_complete: bool,
    hotplug_pending: [bool; MAX_PORTS],
}

static XHCI: Mutex<Option<Controller>> = Mutex::new(None);

fn dma_frame() -> KernelResult<(u64, u64)> {
    let phys = frame_allocator::allocate_zeroed()?;
    Ok((hhdm::phys_to_virt(phys), phys))
}

impl Controller {
    fn write_op(&self, reg: u64, value: u32) {
        // SAFETY: op_base covers the operational register window mapped
        // uncacheable at init.
        unsafe {
            core::ptr::write_volatile((self.op_base + reg) as *mut u32, value);
        }
    }

    fn read_op(&self, reg: u64) -> u32 {
        // SAFETY: see write_op.
        unsafe { core::ptr::read_volatile((self.op_base + reg) as *const u32) }
    }

    fn write_rt(&self, reg: u64, value: u32) {
        // SAFETY: rt_base covers the runtime register window.
        unsafe {
            core::ptr::write_volatile((self.rt_base + reg) as *mut u32, value);
        }
    }

    fn ring_doorbell(&self, index: u32, value: u32) {
        // SAFETY: db_base covers the doorbell array.
        unsafe {
            core::ptr::write_volatile((self.db_base + index as u64 * 4) as *mut u32, value);
        }
    }

    fn read_portsc(&self, port: u32) -> u32 {
        self.read_op(OP_PORTSC_BASE + port as u64 * OP_PORTSC_STRIDE)
    }

    fn write_portsc(&self, port: u32, value: u32) {
        self.write_op(OP_PORTSC_BASE + port as u64 * OP_PORTSC_STRIDE, value);
    }

    pub(super) fn dcbaa_set(&mut self, index: usize, phys: u64) {
        // SAFETY: dcbaa_va is a whole owned frame (256 entries max).
        unsafe {
            core::ptr::write_volatile((self.dcbaa_va as *mut u64).add(index), phys);
        }
    }

    /// Drain the event ring, dispatching by TRB type, then publish the new
    /// dequeue pointer with EHB set to clear the busy latch.
    fn poll_events(&mut self) {
        while let Some(evt) = self.evt_ring.pop() {
            match evt.trb_type() {
                TRB_COMMAND_COMPLETION => {
                    self.cmd_code = evt.completion_code();
                    self.cmd_slot_id = evt.slot_id();
                    self.cmd_completed = true;
                }

                TRB_PORT_STATUS_CHANGE => {
                    let port_id = (evt.param_lo >> 24) & 0xFF;
                    if port_id >= 1 && port_id <= self.max_ports {
                        let port = port_id - 1;
                        let portsc = self.read_portsc(port);
                        self.write_portsc(port, (portsc & PORTSC_PRESERVE) | PORTSC_CHANGE_BITS);
                        if self.boot_scan_complete {
                            self.hotplug_pending[port as usize] = true;
                        }
                    }
                }

                TRB_TRANSFER_EVENT => {
                    let code = evt.completion_code();
                    let slot_id = evt.slot_id() as usize;
                    let dci = evt.endpoint_dci();

                    if dci == 1 {
                        self.xfer_code = code;
                        self.xfer_completed = true;
                    } else if slot_id >= 1
                        && slot_id <= MAX_SLOTS
                        && self.devices[slot_id].active
                    {
                        self.handle_interrupt_transfer(slot_id, code, evt.status & 0x00FF_FFFF);
                    }
                }

                _ => {}
            }
        }

        let erdp = self.evt_ring.dequeue_pointer() | (1 << 3); // EHB
        self.write_rt(IR0_ERDP, erdp as u32);
        self.write_rt(IR0_ERDP + 4, (erdp >> 32) as u32);
    }

    fn handle_interrupt_transfer(&mut self, slot_id: usize, code: u32, residual: u32) {
        if code != CC_SUCCESS && code != CC_SHORT_PACKET {
            log::warn!(target: "xhci",
                "transfer error on slot {} cc={}", slot_id, code);
            return;
        }
        let dev = &self.devices[slot_id];
        let mut len = dev.int_max_packet as usize;
        if (residual as usize) < len {
            len -= residual as usize;
        }

        let mut report = [0u8; 64];
        let len = len.min(report.len());
        // SAFETY: int_buf_phys is a whole owned frame written by the
        // device; the direct map covers it.
        unsafe {
            core::ptr::copy_nonoverlapping(
                hhdm::phys_to_virt(dev.int_buf_phys) as *const u8,
                report.as_mut_ptr(),
                len,
            );
        }

        match (dev.iface_class, dev.iface_protocol) {
            (super::CLASS_HID, super::PROTOCOL_KEYBOARD) => {
                hid::process_keyboard_report(&report[..len])
            }
            (super::CLASS_HID, super::PROTOCOL_MOUSE) => hid::process_mouse_report(&report[..len]),
            _ => {}
        }

        // Re-queue only after success; re-queuing a failed transfer would
        // loop forever.
        self.queue_interrupt_transfer(slot_id);
    }

    /// Submit a command TRB and poll for its completion event. Returns the
    /// completion code (CC_TIMEOUT on expiry).
    pub(super) fn send_command(&mut self, trb: Trb) -> u32 {
        self.cmd_completed = false;
        self.cmd_ring.push(trb);
        self.ring_doorbell(0, 0);

        for _ in 0..POLL_BUDGET {
            self.poll_events();
            if self.cmd_completed {
                return self.cmd_code;
            }
            core::hint::spin_loop();
        }
        log::warn!(target: "xhci", "command timeout");
        CC_TIMEOUT
    }

    /// Control transfer on EP0: Setup (+ optional Data) + Status, then
    /// poll for the DCI-1 transfer event.
    pub(super) fn control_transfer(
        &mut self,
        slot_id: usize,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        data: Option<(u64, u16, bool)>,
    ) -> u32 {
        if slot_id == 0 || slot_id > MAX_SLOTS || !self.devices[slot_id].active {
            return CC_TIMEOUT;
        }

        let (w_length, dir_in) = data.map_or((0, false), |(_, len, dir)| (len, dir));

        let mut setup = Trb::zeroed();
        setup.param_lo = bm_request_type as u32 | ((b_request as u32) << 8) | ((w_value as u32) << 16);
        setup.param_hi = w_index as u32 | ((w_length as u32) << 16);
        setup.status = 8; // setup packets are always 8 bytes
        setup.control = (TRB_SETUP_STAGE << TRB_TYPE_SHIFT) | TRB_IDT;
        setup.control |= if w_length == 0 {
            0 // TRT NoData
        } else if dir_in {
            TRB_TRT_IN
        } else {
            TRB_TRT_OUT
        };
        self.devices[slot_id].ep0_ring.push(setup);

        if let Some((buf_phys, len, dir)) = data {
            if len > 0 {
                let mut data_trb = Trb::zeroed().with_parameter(buf_phys);
                data_trb.status = len as u32;
                data_trb.control = TRB_DATA_STAGE << TRB_TYPE_SHIFT;
                if dir {
                    data_trb.control |= TRB_DIR_IN;
                }
                self.devices[slot_id].ep0_ring.push(data_trb);
            }
        }

        let mut status = Trb::zeroed();
        status.control = (TRB_STATUS_STAGE << TRB_TYPE_SHIFT) | TRB_IOC;
        // Status stage runs opposite to the data stage; no-data requests
        // complete with an IN status.
        if w_length == 0 || !dir_in {
            status.control |= TRB_DIR_IN;
        }
        self.devices[slot_id].ep0_ring.push(status);

        self.xfer_completed = false;
        self.ring_doorbell(slot_id as u32, 1); // DCI 1 = EP0

        for _ in 0..POLL_BUDGET {
            self.poll_events();
            if self.xfer_completed {
                return self.xfer_code;
            }
            core::hint::spin_loop();
        }
        log::warn!(target: "xhci", "control transfer timeout on slot {}", slot_id);
        CC_TIMEOUT
    }

    /// Queue one interrupt-IN Normal TRB for the slot and ring its
    /// doorbell.
    pub(super) fn queue_interrupt_transfer(&mut self, slot_id: usize) {
        let dev = &mut self.devices[slot_id];
        if !dev.active || !dev.int_ring.is_initialized() {
            return;
        }
        let mut trb = Trb::zeroed().with_parameter(dev.int_buf_phys);
        trb.status = dev.int_max_packet as u32;
        trb.control = (TRB_NORMAL << TRB_TYPE_SHIFT) | TRB_IOC | TRB_ISP;
        dev.int_ring.push(trb);

        let target = dev.int_ep_num as u32 * 2 + 1; // IN endpoint DCI
        self.ring_doorbell(slot_id as u32, target);
    }

    /// Reset a port and wait for PRC. Returns the post-reset PORTSC.
    fn reset_port(&mut self, port: u32) -> KernelResult<u32> {
        let portsc = self.read_portsc(port);
        self.write_portsc(port, (portsc & PORTSC_PRESERVE) | PORTSC_PR | PORTSC_CHANGE_BITS);

        for _ in 0..POLL_BUDGET {
            self.poll_events();
            if self.read_portsc(port) & PORTSC_PRC != 0 {
                let after = self.read_portsc(port);
                self.write_portsc(port, (after & PORTSC_PRESERVE) | PORTSC_CHANGE_BITS);
                return Ok(after);
            }
            core::hint::spin_loop();
        }
        Err(KernelError::Timeout {
            operation: "port reset",
        })
    }

    /// Deferred hot-plug processing, called from the timer tick after the
    /// boot scan: connect → reset + enumerate, disconnect → deactivate.
    fn process_pending_ports(&mut self) {
        for port in 0..self.max_ports {
            if !self.hotplug_pending[port as usize] {
                continue;
            }
            self.hotplug_pending[port as usize] = false;

            let portsc = self.read_portsc(port);
            if portsc & PORTSC_CCS != 0 {
                let already_active = self.devices[1..=MAX_SLOTS]
                    .iter()
                    .any(|d| d.active && d.port_id as u32 == port + 1);
                if already_active {
                    continue;
                }

                let speed = if portsc & PORTSC_PED != 0 {
                    (portsc >> 10) & 0xF
                } else {
                    match self.reset_port(port) {
                        Ok(after) => (after >> 10) & 0xF,
                        Err(_) => {
                            log::warn!(target: "xhci",
                                "hot-plug: port {} reset timeout", port + 1);
                            continue;
                        }
                    }
                };
                timer::busy_wait_ms(10); // post-reset recovery
                device::enumerate(self, (port + 1) as u8, speed);
            } else {
                for (slot, dev) in self.devices.iter_mut().enumerate() {
                    if dev.active && dev.port_id as u32 == port + 1 {
                        dev.active = false;
                        hid::unregister_slot(slot as u8);
                        log::info!(target: "xhci",
                            "hot-unplug: slot {} (port {}) deactivated", slot, port + 1);
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

pub fn is_initialized() -> bool {
    XHCI.lock().is_some()
}

/// MSI handler: acknowledge EINT/IP and drain the event ring. Skips the
/// work when the controller lock is already held — the polling submitter
/// drains events itself, so nothing is lost.
fn handle_irq() {
    if let Some(mut guard) = XHCI.try_lock() {
        if let Some(hc) = guard.as_mut() {
            hc.write_op(OP_USBSTS, USBSTS_EINT);
            hc.write_rt(IR0_IMAN, IMAN_IP | IMAN_IE);
            hc.poll_events();
        }
    }
}

/// Tick-deferred work: hot-plug handling outside interrupt context. The
/// try_lock doubles as the single-entry reentrancy guard.
pub fn process_deferred_work() {
    if let Some(mut guard) = XHCI.try_lock() {
        if let Some(hc) = guard.as_mut() {
            if hc.boot_scan_complete {
                hc.process_pending_ports();
            }
        }
    }
}

/// `devlist` support: summary of an active slot.
pub fn device_summary(slot: usize) -> Option<DeviceSummary> {
    let guard = XHCI.lock();
    let hc = guard.as_ref()?;
    let dev = &hc.devices[slot];
    dev.active.then_some(DeviceSummary {
        port_id: dev.port_id,
        vendor_id: dev.vendor_id,
        product_id: dev.product_id,
        iface_class: dev.iface_class,
        iface_protocol: dev.iface_protocol,
    })
}

/// Locate, reset and start the controller, then enumerate every connected
/// port. See the module docs for the ring discipline.
pub fn init() -> KernelResult<()> {
    // PCI class Serial / subclass USB / prog-if xHCI.
    let Some(pci_dev) = super::super::pci::find_by_class(0x0C, 0x03, 0x30) else {
        log::warn!(target: "xhci", "no xHCI controller found");
        return Err(KernelError::NotFound { resource: "xhci" });
    };
    let (bus, dev, func) = (pci_dev.bus, pci_dev.device, pci_dev.function);
    log::info!(target: "xhci",
        "found controller at PCI {:02x}:{:02x}.{}", bus, dev, func);

    // BAR0 (possibly 64-bit) → 64 KiB uncacheable MMIO window.
    let bar0 = super::super::pci::read32(bus, dev, func, super::super::pci::REG_BAR0);
    let mut mmio_phys = (bar0 & 0xFFFF_FFF0) as u64;
    if bar0 & 0x06 == 0x04 {
        let bar1 = super::super::pci::read32(bus, dev, func, super::super::pci::REG_BAR1);
        mmio_phys |= (bar1 as u64) << 32;
    }
    for offset in (0..0x10000u64).step_by(FRAME_SIZE) {
        page_table::map_mmio(mmio_phys + offset)?;
    }
    let mmio = hhdm::phys_to_virt(mmio_phys);

    // Memory space + bus mastering.
    let cmd = super::super::pci::read16(bus, dev, func, super::super::pci::REG_COMMAND);
    super::super::pci::write16(
        bus,
        dev,
        func,
        super::super::pci::REG_COMMAND,
        cmd | super::super::pci::CMD_MEM_SPACE | super::super::pci::CMD_BUS_MASTER,
    );

    // SAFETY: capability registers inside the mapped MMIO window.
    let cap_length =
        unsafe { core::ptr::read_volatile((mmio + CAP_CAPLENGTH) as *const u8) } as u64;
    let read_cap = |reg: u64| -> u32 {
        // SAFETY: capability register inside the mapped window.
        unsafe { core::ptr::read_volatile((mmio + reg) as *const u32) }
    };

    let hcs1 = read_cap(CAP_HCSPARAMS1);
    let mut max_slots = hcs1 & 0xFF;
    let mut max_ports = (hcs1 >> 24) & 0xFF;
    let hcs2 = read_cap(CAP_HCSPARAMS2);
    let scratch_hi = (hcs2 >> 21) & 0x1F;
    let scratch_lo = (hcs2 >> 27) & 0x1F;
    let scratchpads = (scratch_hi << 5) | scratch_lo;
    let db_off = (read_cap(CAP_DBOFF) & !0x3) as u64;
    let rts_off = (read_cap(CAP_RTSOFF) & !0x1F) as u64;

    log::info!(target: "xhci",
        "max slots {}, max ports {}, scratchpads {}", max_slots, max_ports, scratchpads);
    max_slots = max_slots.min(MAX_SLOTS as u32);
    max_ports = max_ports.min(MAX_PORTS as u32);

    let mut hc = Controller {
        op_base: mmio + cap_length,
        rt_base: mmio + rts_off,
        db_base: mmio + db_off,
        max_slots,
        max_ports,
        dcbaa_va: 0,
        cmd_ring: ProducerRing::empty(),
        evt_ring: EventRing::empty(),
        cmd_completed: false,
        cmd_code: 0,
        cmd_slot_id: 0,
        xfer_completed: false,
        xfer_code: 0,
        devices: [const { DeviceSlot::empty() }; MAX_SLOTS + 1],
        boot_scan_complete: false,
        hotplug_pending: [false; MAX_PORTS],
    };

    // Halt.
    hc.write_op(OP_USBCMD, hc.read_op(OP_USBCMD) & !USBCMD_RS);
    bounded_wait(|| hc.read_op(OP_USBSTS) & USBSTS_HCH != 0, "halt")?;

    // Reset, then wait for HCRST and CNR to clear.
    hc.write_op(OP_USBCMD, USBCMD_HCRST);
    bounded_wait(|| hc.read_op(OP_USBCMD) & USBCMD_HCRST == 0, "reset")?;
    bounded_wait(|| hc.read_op(OP_USBSTS) & USBSTS_CNR == 0, "controller ready")?;
    log::info!(target: "xhci", "controller reset complete");

    hc.write_op(OP_CONFIG, max_slots);

    // DCBAA.
    let (dcbaa_va, dcbaa_phys) = dma_frame()?;
    hc.dcbaa_va = dcbaa_va;
    hc.write_op(OP_DCBAAP, dcbaa_phys as u32);
    hc.write_op(OP_DCBAAP + 4, (dcbaa_phys >> 32) as u32);

    // Scratchpad buffers: DCBAA[0] points at the pointer array.
    if scratchpads > 0 {
        let (sp_va, sp_phys) = dma_frame()?;
        for i in 0..scratchpads as usize {
            let (_, buf_phys) = dma_frame()?;
            // SAFETY: sp_va is a whole owned frame of u64 pointers.
            unsafe {
                core::ptr::write_volatile((sp_va as *mut u64).add(i), buf_phys);
            }
        }
        hc.dcbaa_set(0, sp_phys);
        log::info!(target: "xhci", "allocated {} scratchpad buffers", scratchpads);
    }

    // Command ring: CRCR = base | RCS.
    let (cmd_va, cmd_phys) = dma_frame()?;
    // SAFETY: fresh zeroed frame, exclusively the command ring's.
    hc.cmd_ring = unsafe { ProducerRing::new(cmd_va, cmd_phys, RING_SIZE) };
    let crcr = cmd_phys | 1;
    hc.write_op(OP_CRCR, crcr as u32);
    hc.write_op(OP_CRCR + 4, (crcr >> 32) as u32);

    // Event ring + single-entry ERST. ERSTBA is written last: it triggers
    // the hardware read of the table.
    let (evt_va, evt_phys) = dma_frame()?;
    // SAFETY: fresh zeroed frame, exclusively the event ring's.
    hc.evt_ring = unsafe { EventRing::new(evt_va, evt_phys, RING_SIZE) };
    let (erst_va, erst_phys) = dma_frame()?;
    // SAFETY: fresh zeroed frame for the one ERST entry.
    unsafe {
        let erst = erst_va as *mut u64;
        core::ptr::write_volatile(erst, evt_phys);
        core::ptr::write_volatile(erst.add(1), RING_SIZE as u64);
    }
    hc.write_rt(IR0_ERSTSZ, 1);
    hc.write_rt(IR0_ERDP, evt_phys as u32);
    hc.write_rt(IR0_ERDP + 4, (evt_phys >> 32) as u32);
    hc.write_rt(IR0_ERSTBA, erst_phys as u32);
    hc.write_rt(IR0_ERSTBA + 4, (erst_phys >> 32) as u32);

    // MSI (fixed delivery to the BSP), legacy INTx off.
    if !setup_msi(bus, dev, func) {
        log::warn!(target: "xhci", "MSI not available, running in poll mode");
    }

    // Interrupter 0 on, no moderation.
    hc.write_rt(IR0_IMAN, IMAN_IE);
    hc.write_rt(IR0_IMOD, 0);

    // Start.
    hc.write_op(OP_USBCMD, USBCMD_RS | USBCMD_INTE | USBCMD_HSEE);
    bounded_wait(|| hc.read_op(OP_USBSTS) & USBSTS_HCH == 0, "start")?;
    log::info!(target: "xhci", "controller started");

    // Power every port, give them time to stabilize.
    for port in 0..max_ports {
        let portsc = hc.read_portsc(port);
        if portsc & PORTSC_PP == 0 {
            hc.write_portsc(port, PORTSC_PP);
        }
    }
    timer::busy_wait_ms(20);

    // Boot port scan: reset + enumerate anything connected.
    for port in 0..max_ports {
        let portsc = hc.read_portsc(port);
        if portsc & PORTSC_CCS == 0 {
            continue;
        }
        log::info!(target: "xhci",
            "port {}: device connected, PORTSC={:#x}", port + 1, portsc);

        let after = match hc.reset_port(port) {
            Ok(v) => v,
            Err(_) => {
                log::warn!(target: "xhci", "port {} reset timeout", port + 1);
                continue;
            }
        };
        let speed = (after >> 10) & 0xF;
        log::info!(target: "xhci",
            "port {}: reset complete, speed={}", port + 1, super::speed_name(speed));

        timer::busy_wait_ms(10); // post-reset recovery per USB spec
        device::enumerate(&mut hc, (port + 1) as u8, speed);
    }

    hc.boot_scan_complete = true;
    *XHCI.lock() = Some(hc);

    timer::register_tick_work(process_deferred_work);
    log::info!(target: "xhci", "initialization complete");
    Ok(())
}

fn bounded_wait(mut cond: impl FnMut() -> bool, what: &'static str) -> KernelResult<()> {
    for _ in 0..POLL_BUDGET {
        if cond() {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    log::warn!(target: "xhci", "{} timed out", what);
    Err(KernelError::Timeout { operation: what })
}

/// Program the PCI MSI capability: BSP-targeted address, our vector, one
/// message, INTx disabled.
fn setup_msi(bus: u8, dev: u8, func: u8) -> bool {
    use super::super::pci;

    let cap = pci::find_capability(bus, dev, func, pci::CAP_MSI);
    if cap == 0 {
        return false;
    }

    let vector = idt::IRQ_BASE_VECTOR as u16 + MSI_IRQ_SLOT as u16;
    let msg_ctrl = pci::read16(bus, dev, func, cap + 2);
    let is_64bit = msg_ctrl & (1 << 7) != 0;

    pci::write32(bus, dev, func, cap + 4, apic::MSI_ADDRESS_BASE);
    if is_64bit {
        pci::write32(bus, dev, func, cap + 8, 0);
        pci::write16(bus, dev, func, cap + 12, vector);
    } else {
        pci::write16(bus, dev, func, cap + 8, vector);
    }

    // Single message, enabled.
    let ctrl = (msg_ctrl & !0x70) | 1;
    pci::write16(bus, dev, func, cap + 2, ctrl);

    let cmd = pci::read16(bus, dev, func, pci::REG_COMMAND);
    pci::write16(bus, dev, func, pci::REG_COMMAND, cmd | pci::CMD_INTX_DISABLE);

    idt::register_irq_handler(MSI_IRQ_SLOT, handle_irq);
    log::info!(target: "xhci", "MSI enabled, vector {:#x}", vector);
    true
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::{boxed::Box, vec};

    use super::*;

    /// A leaked TRB array addressed only through raw pointers, exactly the
    /// way the rings address real DMA memory.
    fn trb_array(size: usize) -> *mut Trb {
        Box::leak(vec![Trb::zeroed(); size].into_boxed_slice()).as_mut_ptr()
    }

    fn slot(mem: *mut Trb, index: usize) -> Trb {
        // SAFETY: index is within the leaked array in every caller.
        unsafe { core::ptr::read_volatile(mem.add(index)) }
    }

    fn set_slot(mem: *mut Trb, index: usize, trb: Trb) {
        // SAFETY: see slot().
        unsafe {
            core::ptr::write_volatile(mem.add(index), trb);
        }
    }

    #[test]
    fn link_trb_is_planted_at_init() {
        let mem = trb_array(8);
        // SAFETY: exclusive leaked array; the fake phys address is only
        // stored, never dereferenced on the host.
        let _ring = unsafe { ProducerRing::new(mem as u64, 0x1000, 8) };
        let link = slot(mem, 7);
        assert_eq!(link.trb_type(), TRB_LINK);
        assert_eq!(link.parameter(), 0x1000);
        assert!(link.control & TRB_TOGGLE_CYCLE != 0);
        assert!(!link.cycle()); // not yet valid for the consumer
    }

    #[test]
    fn producer_stamps_cycle_and_toggles_at_the_link() {
        let mem = trb_array(4); // 3 usable slots + link
        // SAFETY: exclusive leaked array.
        let mut ring = unsafe { ProducerRing::new(mem as u64, 0x1000, 4) };
        let trb = Trb {
            status: 7,
            control: TRB_NORMAL << TRB_TYPE_SHIFT,
            ..Trb::zeroed()
        };

        // First pass: cycle 1.
        for i in 0..3 {
            ring.push(trb);
            assert!(slot(mem, i).cycle(), "slot {} should carry cycle=1", i);
        }
        // Reaching the link: its cycle was stamped 1 and producer toggled.
        assert!(slot(mem, 3).cycle());
        assert_eq!(ring.enqueue, 0);
        assert!(!ring.cycle);

        // Second pass: cycle 0.
        for i in 0..3 {
            ring.push(trb);
            assert!(!slot(mem, i).cycle(), "slot {} should carry cycle=0", i);
            assert_eq!(slot(mem, i).status, 7);
        }
        // Link stamped 0, producer back to cycle 1.
        assert!(!slot(mem, 3).cycle());
        assert!(ring.cycle);
    }

    #[test]
    fn dequeue_pointer_carries_the_dcs_bit() {
        let mem = trb_array(8);
        // SAFETY: exclusive leaked array.
        let mut ring = unsafe { ProducerRing::new(mem as u64, 0x1000, 8) };
        assert_eq!(ring.dequeue_pointer(), 0x1000 | 1);
        ring.push(Trb::zeroed());
        assert_eq!(ring.dequeue_pointer(), (0x1000 + 16) | 1);
    }

    #[test]
    fn event_ring_consumes_only_matching_cycle_and_wraps() {
        let mem = trb_array(4);
        // SAFETY: exclusive leaked array; fake phys.
        let mut ring = unsafe { EventRing::new(mem as u64, 0x2000, 4) };

        assert!(ring.pop().is_none()); // all zeroes: stale

        // Hardware writes two events with cycle 1.
        let evt = |slot_id: u32| Trb {
            status: CC_SUCCESS << 24,
            control: (TRB_COMMAND_COMPLETION << TRB_TYPE_SHIFT) | TRB_CYCLE | (slot_id << 24),
            ..Trb::zeroed()
        };
        set_slot(mem, 0, evt(1));
        set_slot(mem, 1, evt(2));

        assert_eq!(ring.pop().unwrap().slot_id(), 1);
        assert_eq!(ring.pop().unwrap().slot_id(), 2);
        assert!(ring.pop().is_none());
        assert_eq!(ring.dequeue_pointer(), 0x2000 + 2 * 16);

        // Fill the rest of the first lap, then write a second-lap event
        // with cycle 0.
        set_slot(mem, 2, evt(3));
        set_slot(mem, 3, evt(4));
        assert_eq!(ring.pop().unwrap().slot_id(), 3);
        assert_eq!(ring.pop().unwrap().slot_id(), 4);
        // Wrapped: consumer now expects cycle 0.
        let mut second_lap = evt(5);
        second_lap.control &= !TRB_CYCLE;
        set_slot(mem, 0, second_lap);
        assert_eq!(ring.pop().unwrap().slot_id(), 5);
        // The old cycle-1 event at index 1 is stale now.
        assert!(ring.pop().is_none());
    }

    #[test]
    fn trb_field_accessors() {
        let t = Trb {
            param_lo: 0xDDCC_BBAA,
            param_hi: 0x1122_3344,
            status: (CC_SHORT_PACKET << 24) | 0x10,
            control: (TRB_TRANSFER_EVENT << TRB_TYPE_SHIFT) | TRB_CYCLE | (3 << 24) | (5 << 16),
        };
        assert_eq!(t.parameter(), 0x1122_3344_DDCC_BBAA);
        assert_eq!(t.trb_type(), TRB_TRANSFER_EVENT);
        assert_eq!(t.completion_code(), CC_SHORT_PACKET);
        assert_eq!(t.slot_id(), 3);
        assert_eq!(t.endpoint_dci(), 5);
    }
}
