//! USB device enumeration and configuration.
//!
//! Runs the full bring-up for a freshly reset port: slot allocation,
//! two-phase Address Device (BSR=1, then BSR=0 after the real EP0 max
//! packet size is known), descriptor fetch, endpoint configuration and
//! HID setup, ending with the first queued interrupt transfer.

use crate::{
    error::KernelResult,
    mm::{frame_allocator, hhdm},
    timer,
};

use super::{
    hid,
    xhci::{
        Controller, ProducerRing, Trb, CC_SHORT_PACKET, CC_SUCCESS, MAX_SLOTS, RING_SIZE,
        TRB_ADDRESS_DEVICE, TRB_BSR, TRB_CONFIGURE_ENDPOINT, TRB_ENABLE_SLOT,
        TRB_EVALUATE_CONTEXT, TRB_TYPE_SHIFT,
    },
};

/// EP-context type field values (bits 5:3 of dword 1).
const EP_TYPE_CONTROL: u32 = 4;
const EP_TYPE_INTERRUPT_IN: u32 = 7;

/// View over an input-context frame (32-byte contexts): the input control
/// context, then the slot context, then endpoint contexts by DCI.
struct InputContext {
    va: u64,
}

impl InputContext {
    fn alloc() -> KernelResult<(Self, u64)> {
        let phys = frame_allocator::allocate_zeroed()?;
        Ok((
            Self {
                va: hhdm::phys_to_virt(phys),
            },
            phys,
        ))
    }

    fn write32(&self, offset: u64, value: u32) {
        // SAFETY: offsets stay within the exclusively owned frame.
        unsafe {
            core::ptr::write_volatile((self.va + offset) as *mut u32, value);
        }
    }

    fn set_add_flags(&self, flags: u32) {
        self.write32(0x04, flags);
    }

    fn set_slot(&self, dword0: u32, dword1: u32) {
        self.write32(0x20, dword0);
        self.write32(0x24, dword1);
    }

    /// Endpoint context for a DCI: (dword0, dword1, TR dequeue pointer,
    /// average TRB length).
    fn set_endpoint(&self, dci: u32, dword0: u32, dword1: u32, tr_dequeue: u64, avg_trb: u32) {
        let base = 0x20 + dci as u64 * 0x20;
        self.write32(base, dword0);
        self.write32(base + 0x04, dword1);
        self.write32(base + 0x08, tr_dequeue as u32);
        self.write32(base + 0x0C, (tr_dequeue >> 32) as u32);
        self.write32(base + 0x10, avg_trb);
    }
}

fn command(trb_type: u32, input_ctx_phys: u64, slot_id: u32, extra_control: u32) -> Trb {
    let mut trb = Trb::zeroed().with_parameter(input_ctx_phys);
    trb.control = (trb_type << TRB_TYPE_SHIFT) | (slot_id << 24) | extra_control;
    trb
}

/// Enumerate the device behind `port_id` (1-based) at the given PORTSC
/// speed. Returns the slot id, or None when any step fails — the slot is
/// deactivated and its DMA pages leak (no ownership tracking; accepted).
pub(super) fn enumerate(hc: &mut Controller, port_id: u8, speed: u32) -> Option<u8> {
    log::info!(target: "usb",
        "enumerating device on port {} speed={}", port_id, super::speed_name(speed));

    // Step 1: Enable Slot.
    let cc = hc.send_command(command(TRB_ENABLE_SLOT, 0, 0, 0));
    if cc != CC_SUCCESS {
        log::error!(target: "usb", "Enable Slot failed, cc={}", cc);
        return None;
    }
    let slot_id = hc.cmd_slot_id as usize;
    if slot_id == 0 || slot_id > MAX_SLOTS {
        log::error!(target: "usb", "invalid slot id {}", slot_id);
        return None;
    }
    log::info!(target: "usb", "slot {} enabled", slot_id);

    // Step 2: output device context, DCBAA entry.
    let output_ctx_phys = frame_allocator::allocate_zeroed().ok()?;
    {
        let dev = &mut hc.devices[slot_id];
        dev.active = true;
        dev.port_id = port_id;
        dev.speed = speed;
        dev.output_ctx_phys = output_ctx_phys;
    }
    hc.dcbaa_set(slot_id, output_ctx_phys);

    // Step 3: input context with slot + EP0, plus the EP0 transfer ring.
    let (input_ctx, input_ctx_phys) = InputContext::alloc().ok()?;
    input_ctx.set_add_flags(0x3);
    input_ctx.set_slot((1 << 27) | (speed << 20), (port_id as u32) << 16);

    let ep0_phys = frame_allocator::allocate_zeroed().ok()?;
    // SAFETY: fresh zeroed frame owned by this EP0 ring.
    let ep0_ring = unsafe { ProducerRing::new(hhdm::phys_to_virt(ep0_phys), ep0_phys, RING_SIZE) };
    hc.devices[slot_id].ep0_ring = ep0_ring;

    let default_max_packet = super::max_packet_for_speed(speed);
    let ep0_dword1 = |max_packet: u16| (3 << 1) | (EP_TYPE_CONTROL << 3) | ((max_packet as u32) << 16);
    input_ctx.set_endpoint(1, 0, ep0_dword1(default_max_packet), ep0_phys | 1, 8);

    // Step 4a: Address Device with BSR=1 (no SET_ADDRESS yet).
    let cc = hc.send_command(command(TRB_ADDRESS_DEVICE, input_ctx_phys, slot_id as u32, TRB_BSR));
    if cc != CC_SUCCESS {
        log::error!(target: "usb", "Address Device (BSR=1) failed, cc={}", cc);
        hc.devices[slot_id].active = false;
        return None;
    }

    // Step 4b: first 8 descriptor bytes reveal bMaxPacketSize0.
    let buf_phys = frame_allocator::allocate_zeroed().ok()?;
    let buf_va = hhdm::phys_to_virt(buf_phys);
    let read_buf = |len: usize| -> &'static [u8] {
        // SAFETY: whole owned frame, written by the device via DMA.
        unsafe { core::slice::from_raw_parts(buf_va as *const u8, len.min(4096)) }
    };

    let cc = hc.control_transfer(
        slot_id,
        super::REQTYPE_DEV_TO_HOST,
        super::REQ_GET_DESCRIPTOR,
        (super::DESC_DEVICE as u16) << 8,
        0,
        Some((buf_phys, 8, true)),
    );
    if cc != CC_SUCCESS && cc != CC_SHORT_PACKET {
        log::error!(target: "usb", "GET_DESCRIPTOR(8) failed, cc={}", cc);
        hc.devices[slot_id].active = false;
        return None;
    }
    let mut max_packet0 = read_buf(8)[7] as u16;
    if max_packet0 == 0 {
        max_packet0 = default_max_packet;
    }

    // Step 4c: Evaluate Context when the heuristic guessed wrong.
    if max_packet0 != default_max_packet {
        let (eval_ctx, eval_phys) = InputContext::alloc().ok()?;
        eval_ctx.set_add_flags(1 << 1); // EP0 only
        eval_ctx.set_endpoint(
            1,
            0,
            ep0_dword1(max_packet0),
            hc.devices[slot_id].ep0_ring.dequeue_pointer(),
            8,
        );
        let cc = hc.send_command(command(TRB_EVALUATE_CONTEXT, eval_phys, slot_id as u32, 0));
        if cc != CC_SUCCESS {
            // Non-fatal: carry on with the original max packet size.
            log::warn!(target: "usb", "Evaluate Context failed, cc={}", cc);
        }
    }

    // Step 4d: Address Device with BSR=0 (issues SET_ADDRESS). The input
    // context must reflect the live ring position and max packet size,
    // because BSR=0 reinitializes the output EP0 context from it.
    input_ctx.set_endpoint(
        1,
        0,
        ep0_dword1(max_packet0),
        hc.devices[slot_id].ep0_ring.dequeue_pointer(),
        8,
    );
    let cc = hc.send_command(command(TRB_ADDRESS_DEVICE, input_ctx_phys, slot_id as u32, 0));
    if cc != CC_SUCCESS {
        log::error!(target: "usb", "Address Device failed, cc={}", cc);
        hc.devices[slot_id].active = false;
        return None;
    }
    timer::busy_wait_ms(10); // set-address recovery
    log::info!(target: "usb", "slot {} addressed", slot_id);

    // Step 5: full device descriptor.
    let cc = hc.control_transfer(
        slot_id,
        super::REQTYPE_DEV_TO_HOST,
        super::REQ_GET_DESCRIPTOR,
        (super::DESC_DEVICE as u16) << 8,
        0,
        Some((buf_phys, 18, true)),
    );
    if cc != CC_SUCCESS && cc != CC_SHORT_PACKET {
        log::error!(target: "usb", "GET_DESCRIPTOR(device) failed, cc={}", cc);
        hc.devices[slot_id].active = false;
        return None;
    }
    let desc = read_buf(18);
    let vendor_id = u16::from_le_bytes([desc[8], desc[9]]);
    let product_id = u16::from_le_bytes([desc[10], desc[11]]);
    hc.devices[slot_id].vendor_id = vendor_id;
    hc.devices[slot_id].product_id = product_id;
    log::info!(target: "usb",
        "slot {}: VID:PID = {:04x}:{:04x}", slot_id, vendor_id, product_id);

    // Step 6: configuration descriptor, header then full blob.
    let cc = hc.control_transfer(
        slot_id,
        super::REQTYPE_DEV_TO_HOST,
        super::REQ_GET_DESCRIPTOR,
        (super::DESC_CONFIGURATION as u16) << 8,
        0,
        Some((buf_phys, 9, true)),
    );
    if cc != CC_SUCCESS && cc != CC_SHORT_PACKET {
        log::error!(target: "usb", "GET_DESCRIPTOR(config header) failed, cc={}", cc);
        hc.devices[slot_id].active = false;
        return None;
    }
    let header = read_buf(9);
    let total_len = u16::from_le_bytes([header[2], header[3]]).min(256);

    let cc = hc.control_transfer(
        slot_id,
        super::REQTYPE_DEV_TO_HOST,
        super::REQ_GET_DESCRIPTOR,
        (super::DESC_CONFIGURATION as u16) << 8,
        0,
        Some((buf_phys, total_len, true)),
    );
    if cc != CC_SUCCESS && cc != CC_SHORT_PACKET {
        log::error!(target: "usb", "GET_DESCRIPTOR(config) failed, cc={}", cc);
        hc.devices[slot_id].active = false;
        return None;
    }

    // Step 7: walk the blob for a boot-HID interface + interrupt endpoint.
    let parsed = super::parse_configuration(read_buf(total_len as usize));
    {
        let dev = &mut hc.devices[slot_id];
        dev.iface_class = parsed.iface_class;
        dev.iface_subclass = parsed.iface_subclass;
        dev.iface_protocol = parsed.iface_protocol;
    }

    // Step 8: SET_CONFIGURATION.
    let cc = hc.control_transfer(
        slot_id,
        super::REQTYPE_HOST_TO_DEV,
        super::REQ_SET_CONFIGURATION,
        parsed.config_value as u16,
        0,
        None,
    );
    if cc != CC_SUCCESS {
        log::error!(target: "usb", "SET_CONFIGURATION failed, cc={}", cc);
        hc.devices[slot_id].active = false;
        return None;
    }

    // Step 9: Configure Endpoint for the interrupt-IN pipe.
    if let Some(ep) = parsed.endpoint {
        let dci = ep.number as u32 * 2 + 1;

        let int_phys = frame_allocator::allocate_zeroed().ok()?;
        // SAFETY: fresh zeroed frame owned by the interrupt ring.
        let int_ring =
            unsafe { ProducerRing::new(hhdm::phys_to_virt(int_phys), int_phys, RING_SIZE) };
        {
            let dev = &mut hc.devices[slot_id];
            dev.int_ring = int_ring;
            dev.int_ep_num = ep.number;
            dev.int_max_packet = ep.max_packet;
            dev.int_interval = ep.interval;
        }

        let (cfg_ctx, cfg_phys) = InputContext::alloc().ok()?;
        cfg_ctx.set_add_flags((1 << 0) | (1 << dci));
        // Slot context: bump Context Entries to cover the new DCI.
        cfg_ctx.set_slot((dci << 27) | (speed << 20), (port_id as u32) << 16);

        let interval = super::interval_for(speed, ep.interval);
        cfg_ctx.set_endpoint(
            dci,
            interval << 16,
            (3 << 1) | (EP_TYPE_INTERRUPT_IN << 3) | ((ep.max_packet as u32) << 16),
            int_phys | 1,
            ep.max_packet as u32,
        );

        let cc = hc.send_command(command(TRB_CONFIGURE_ENDPOINT, cfg_phys, slot_id as u32, 0));
        if cc != CC_SUCCESS {
            log::error!(target: "usb", "Configure Endpoint failed, cc={}", cc);
            hc.devices[slot_id].active = false;
            return None;
        }
        log::info!(target: "usb",
            "slot {}: interrupt EP {} configured (DCI {})", slot_id, ep.number, dci);
    }

    // Step 10: keyboards run Boot Protocol; mice stay in Report Protocol
    // for wheel support and get their report descriptor parsed instead.
    if parsed.endpoint.is_some() && parsed.iface_protocol == super::PROTOCOL_KEYBOARD {
        let cc = hc.control_transfer(
            slot_id,
            super::REQTYPE_CLASS_IFACE,
            super::REQ_SET_PROTOCOL,
            0,
            0,
            None,
        );
        if cc != CC_SUCCESS {
            // Some devices only do boot protocol anyway.
            log::warn!(target: "usb", "SET_PROTOCOL(boot) failed, cc={}", cc);
        }
    }

    // Step 10b: HID report descriptor for mice.
    if parsed.endpoint.is_some()
        && parsed.iface_protocol == super::PROTOCOL_MOUSE
        && parsed.hid_report_len > 0
    {
        let len = parsed.hid_report_len.min(256);
        let cc = hc.control_transfer(
            slot_id,
            super::REQTYPE_STD_IFACE_IN,
            super::REQ_GET_DESCRIPTOR,
            (super::DESC_HID_REPORT as u16) << 8,
            0,
            Some((buf_phys, len, true)),
        );
        if cc == CC_SUCCESS || cc == CC_SHORT_PACKET {
            hid::parse_mouse_report_descriptor(read_buf(len as usize));
        } else {
            log::warn!(target: "usb", "GET_DESCRIPTOR(HID report) failed, cc={}", cc);
        }
    }

    // Step 11: SET_IDLE(4) = 16 ms, for software typematic on keyboards.
    if parsed.endpoint.is_some() && parsed.iface_protocol == super::PROTOCOL_KEYBOARD {
        let cc = hc.control_transfer(
            slot_id,
            super::REQTYPE_CLASS_IFACE,
            super::REQ_SET_IDLE,
            4 << 8,
            0,
            None,
        );
        if cc != CC_SUCCESS {
            log::warn!(target: "usb", "SET_IDLE failed, cc={}", cc);
        }
    }

    // Step 12: first interrupt transfer.
    if parsed.endpoint.is_some() {
        let data_phys = frame_allocator::allocate_zeroed().ok()?;
        hc.devices[slot_id].int_buf_phys = data_phys;
        hc.queue_interrupt_transfer(slot_id);
    }

    // Step 13: hand the slot to the matching HID driver.
    match parsed.iface_protocol {
        super::PROTOCOL_KEYBOARD => {
            hid::register_keyboard(slot_id as u8);
            log::info!(target: "usb", "slot {}: HID boot keyboard", slot_id);
        }
        super::PROTOCOL_MOUSE => {
            hid::register_mouse(slot_id as u8);
            log::info!(target: "usb", "slot {}: HID boot mouse", slot_id);
        }
        _ => {
            log::info!(target: "usb",
                "slot {}: non-HID device, class {:#x}", slot_id, hc.devices[slot_id].iface_class);
        }
    }

    Some(slot_id as u8)
}
