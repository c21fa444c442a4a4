//! USB core types: standard descriptors, request constants, and the
//! configuration-blob walk used during enumeration.

pub mod device;
pub mod hid;
pub mod xhci;

// Descriptor types.
pub const DESC_DEVICE: u8 = 1;
pub const DESC_CONFIGURATION: u8 = 2;
pub const DESC_INTERFACE: u8 = 4;
pub const DESC_ENDPOINT: u8 = 5;
pub const DESC_HID: u8 = 0x21;
pub const DESC_HID_REPORT: u8 = 0x22;

// Class codes.
pub const CLASS_HID: u8 = 0x03;
pub const SUBCLASS_BOOT: u8 = 0x01;
pub const PROTOCOL_KEYBOARD: u8 = 0x01;
pub const PROTOCOL_MOUSE: u8 = 0x02;

// Standard requests.
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const REQ_SET_CONFIGURATION: u8 = 0x09;
// HID class requests.
pub const REQ_SET_IDLE: u8 = 0x0A;
pub const REQ_SET_PROTOCOL: u8 = 0x0B;

// bmRequestType values.
pub const REQTYPE_DEV_TO_HOST: u8 = 0x80;
pub const REQTYPE_HOST_TO_DEV: u8 = 0x00;
pub const REQTYPE_CLASS_IFACE: u8 = 0x21;
pub const REQTYPE_STD_IFACE_IN: u8 = 0x81;

// Endpoint descriptor fields.
pub const EP_DIR_IN: u8 = 0x80;
pub const EP_XFER_TYPE_MASK: u8 = 0x03;
pub const EP_XFER_INTERRUPT: u8 = 0x03;

// Port speeds (PORTSC / slot-context encoding).
pub const SPEED_FULL: u32 = 1;
pub const SPEED_LOW: u32 = 2;
pub const SPEED_HIGH: u32 = 3;
pub const SPEED_SUPER: u32 = 4;

/// Default EP0 max packet size until the device descriptor says otherwise.
pub fn max_packet_for_speed(speed: u32) -> u16 {
    match speed {
        SPEED_LOW | SPEED_FULL => 8,
        SPEED_HIGH => 64,
        SPEED_SUPER => 512,
        _ => 64,
    }
}

/// Convert a descriptor bInterval to the xHCI endpoint-context interval
/// field. HS/SS already use 2^(n-1)·125 µs encoding; FS/LS are in frames
/// and convert through microframes to a log2.
pub fn interval_for(speed: u32, b_interval: u8) -> u32 {
    if b_interval == 0 {
        return 0;
    }
    if speed == SPEED_HIGH || speed == SPEED_SUPER {
        return b_interval as u32;
    }
    let mut microframes = b_interval as u32 * 8;
    let mut interval = 0;
    while microframes > 0 {
        interval += 1;
        microframes >>= 1;
    }
    interval.min(15)
}

pub fn speed_name(speed: u32) -> &'static str {
    match speed {
        SPEED_LOW => "Low (1.5 Mbps)",
        SPEED_FULL => "Full (12 Mbps)",
        SPEED_HIGH => "High (480 Mbps)",
        SPEED_SUPER => "Super (5 Gbps)",
        _ => "Unknown",
    }
}

/// Interrupt-IN endpoint attributes pulled from a configuration blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptEndpoint {
    pub number: u8,
    pub max_packet: u16,
    pub interval: u8,
}

/// What enumeration needs from a configuration descriptor blob.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParsedConfig {
    pub config_value: u8,
    pub iface_class: u8,
    pub iface_subclass: u8,
    pub iface_protocol: u8,
    pub hid_report_len: u16,
    pub endpoint: Option<InterruptEndpoint>,
}

/// Walk a configuration blob: remember the first boot-HID interface and
/// the first interrupt-IN endpoint that follows it. Interface boundaries
/// reset the candidate so an endpoint can never attach to the wrong
/// interface.
pub fn parse_configuration(blob: &[u8]) -> ParsedConfig {
    let mut parsed = ParsedConfig::default();
    if blob.len() >= 9 && blob[1] == DESC_CONFIGURATION {
        parsed.config_value = blob[5];
    }

    let mut in_hid_iface = false;
    let mut offset = 0usize;
    while offset + 2 <= blob.len() {
        let len = blob[offset] as usize;
        let desc_type = blob[offset + 1];
        if len == 0 {
            break;
        }
        let end = offset + len;
        if end > blob.len() {
            break;
        }

        match desc_type {
            DESC_INTERFACE if len >= 9 => {
                in_hid_iface = false;
                if parsed.endpoint.is_none()
                    && blob[offset + 5] == CLASS_HID
                    && blob[offset + 6] == SUBCLASS_BOOT
                {
                    parsed.iface_class = blob[offset + 5];
                    parsed.iface_subclass = blob[offset + 6];
                    parsed.iface_protocol = blob[offset + 7];
                    in_hid_iface = true;
                }
            }
            DESC_HID if in_hid_iface && parsed.endpoint.is_none() && len >= 9 => {
                parsed.hid_report_len =
                    u16::from_le_bytes([blob[offset + 7], blob[offset + 8]]);
            }
            DESC_ENDPOINT if in_hid_iface && parsed.endpoint.is_none() && len >= 7 => {
                let address = blob[offset + 2];
                let attributes = blob[offset + 3];
                if address & EP_DIR_IN != 0
                    && attributes & EP_XFER_TYPE_MASK == EP_XFER_INTERRUPT
                {
                    parsed.endpoint = Some(InterruptEndpoint {
                        number: address & 0x0F,
                        max_packet: u16::from_le_bytes([blob[offset + 4], blob[offset + 5]])
                            & 0x7FF,
                        interval: blob[offset + 6],
                    });
                }
            }
            _ => {}
        }
        offset = end;
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Configuration blob of a boot keyboard: config + interface + HID +
    /// interrupt-IN endpoint.
    fn keyboard_blob() -> [u8; 34] {
        let mut b = [0u8; 34];
        // Configuration descriptor (9 bytes).
        b[0] = 9;
        b[1] = DESC_CONFIGURATION;
        b[2..4].copy_from_slice(&34u16.to_le_bytes());
        b[4] = 1; // one interface
        b[5] = 1; // bConfigurationValue
        // Interface descriptor (9 bytes) at 9.
        b[9] = 9;
        b[10] = DESC_INTERFACE;
        b[14] = CLASS_HID;
        b[15] = SUBCLASS_BOOT;
        b[16] = PROTOCOL_KEYBOARD;
        // HID descriptor (9 bytes) at 18.
        b[18] = 9;
        b[19] = DESC_HID;
        b[25..27].copy_from_slice(&65u16.to_le_bytes()); // report desc len
        // Endpoint descriptor (7 bytes) at 27.
        b[27] = 7;
        b[28] = DESC_ENDPOINT;
        b[29] = EP_DIR_IN | 1; // EP1 IN
        b[30] = EP_XFER_INTERRUPT;
        b[31..33].copy_from_slice(&8u16.to_le_bytes());
        b[33] = 10; // bInterval
        b
    }

    #[test]
    fn keyboard_configuration_parses_completely() {
        let parsed = parse_configuration(&keyboard_blob());
        assert_eq!(parsed.config_value, 1);
        assert_eq!(parsed.iface_class, CLASS_HID);
        assert_eq!(parsed.iface_protocol, PROTOCOL_KEYBOARD);
        assert_eq!(parsed.hid_report_len, 65);
        assert_eq!(
            parsed.endpoint,
            Some(InterruptEndpoint {
                number: 1,
                max_packet: 8,
                interval: 10,
            })
        );
    }

    #[test]
    fn endpoints_outside_a_boot_hid_interface_are_ignored() {
        let mut blob = keyboard_blob();
        blob[14] = 0x08; // mass storage class
        let parsed = parse_configuration(&blob);
        assert!(parsed.endpoint.is_none());
        assert_eq!(parsed.hid_report_len, 0);
    }

    #[test]
    fn out_endpoints_do_not_qualify() {
        let mut blob = keyboard_blob();
        blob[29] = 0x01; // EP1 OUT
        assert!(parse_configuration(&blob).endpoint.is_none());
    }

    #[test]
    fn truncated_blobs_stop_cleanly() {
        let blob = keyboard_blob();
        let parsed = parse_configuration(&blob[..20]);
        assert_eq!(parsed.iface_protocol, PROTOCOL_KEYBOARD);
        assert!(parsed.endpoint.is_none());
        assert!(parse_configuration(&[]).endpoint.is_none());
    }

    #[test]
    fn interval_conversion_by_speed() {
        // HS/SS pass through.
        assert_eq!(interval_for(SPEED_HIGH, 7), 7);
        assert_eq!(interval_for(SPEED_SUPER, 4), 4);
        // FS: 10 ms → 80 microframes → highest bit position 7.
        assert_eq!(interval_for(SPEED_FULL, 10), 7);
        // LS: 8 ms → 64 microframes → 7.
        assert_eq!(interval_for(SPEED_LOW, 8), 7);
        assert_eq!(interval_for(SPEED_FULL, 0), 0);
        // Clamped to the field's maximum.
        assert_eq!(interval_for(SPEED_FULL, 255), 11);
    }

    #[test]
    fn default_max_packet_by_speed() {
        assert_eq!(max_packet_for_speed(SPEED_LOW), 8);
        assert_eq!(max_packet_for_speed(SPEED_FULL), 8);
        assert_eq!(max_packet_for_speed(SPEED_HIGH), 64);
        assert_eq!(max_packet_for_speed(SPEED_SUPER), 512);
    }
}
