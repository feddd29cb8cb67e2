//! Built-in control service at index 0 (§4.I).

use crate::packet::Packet;
use crate::server::ServerBase;

pub const SERVICE_CLASS_CONTROL: u32 = 0;

const FLAG_IS_CLIENT: u32 = 0x800;
const FLAG_SUPPORTS_ACK: u32 = 0x100;
const FLAG_SUPPORTS_BROADCAST: u32 = 0x200;
const FLAG_SUPPORTS_FRAMES: u32 = 0x400;
const RESTART_COUNTER_MAX: u8 = 0xf;

const CMD_SERVICES: u16 = 0;
const CMD_NOOP: u16 = 0x80;
const CMD_IDENTIFY: u16 = 0x81;
const CMD_RESET: u16 = 0x82;
const CMD_FLOOD_PING: u16 = 0x83;
const CMD_SET_STATUS_LIGHT: u16 = 0x84;

const REG_DEVICE_DESCRIPTION: u16 = 0x180;
const REG_FIRMWARE_IDENTIFIER: u16 = 0x181;
const REG_FIRMWARE_VERSION: u16 = 0x185;
pub(crate) const REG_UPTIME: u16 = 0x186;

/// A side effect the Bus performs in response to a control command; the
/// control server itself has no access to the server table or the
/// application's reset hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// `SERVICES`: broadcast an extra announce immediately.
    Announce,
    /// `IDENTIFY`: application decides blink policy.
    Identify,
    /// `RESET`: application decides how to actually restart.
    Reset,
}

pub struct ControlServer {
    pub base: ServerBase,
    restart_counter: u8,
    pub device_description: String,
    pub firmware_identifier: u32,
    pub firmware_version: String,
}

impl ControlServer {
    pub fn new() -> Self {
        ControlServer {
            base: ServerBase::new(SERVICE_CLASS_CONTROL),
            restart_counter: 0,
            device_description: String::new(),
            firmware_identifier: 0,
            firmware_version: String::new(),
        }
    }

    pub fn restart_counter(&self) -> u8 {
        self.restart_counter
    }

    /// Slot 0 of the announce payload: the restart counter always
    /// increments then clamps at 15 (the spec's mandated "clamping form"),
    /// OR'd with the static capability flags.
    pub fn next_announce_slot0(&mut self) -> u32 {
        self.restart_counter = (self.restart_counter + 1).min(RESTART_COUNTER_MAX);
        self.restart_counter as u32 | FLAG_IS_CLIENT | FLAG_SUPPORTS_ACK | FLAG_SUPPORTS_BROADCAST | FLAG_SUPPORTS_FRAMES
    }

    /// Handle a packet addressed to the control service other than an
    /// announce report (announces are assembled by the Bus, which alone
    /// knows the full server table). Returns an immediate reply, if any,
    /// plus a side effect for the Bus to carry out.
    pub fn handle(&mut self, pkt: &Packet, uptime_us: u64) -> (Option<Packet>, Option<ControlAction>) {
        if pkt.is_reg_get() {
            return (self.handle_get_reg(pkt, uptime_us), None);
        }
        match pkt.service_command() {
            CMD_SERVICES => (None, Some(ControlAction::Announce)),
            CMD_NOOP => (None, None),
            CMD_IDENTIFY => (None, Some(ControlAction::Identify)),
            CMD_RESET => (None, Some(ControlAction::Reset)),
            // Recognized opcodes with no mandated core behavior; left for the
            // embedding application to override.
            CMD_FLOOD_PING => (None, None),
            CMD_SET_STATUS_LIGHT => (None, None),
            _ => (None, None),
        }
    }

    fn handle_get_reg(&self, pkt: &Packet, uptime_us: u64) -> Option<Packet> {
        match pkt.reg_code() {
            REG_UPTIME => Some(Packet::packed_u64(pkt.service_command(), uptime_us)),
            REG_DEVICE_DESCRIPTION => {
                Packet::report(pkt.service_command(), self.device_description.clone().into_bytes()).ok()
            }
            REG_FIRMWARE_IDENTIFIER => Some(Packet::packed_u32(pkt.service_command(), self.firmware_identifier)),
            REG_FIRMWARE_VERSION => {
                Packet::report(pkt.service_command(), self.firmware_version.clone().into_bytes()).ok()
            }
            _ => None,
        }
    }
}

impl Default for ControlServer {
    fn default() -> Self {
        Self::new()
    }
}
