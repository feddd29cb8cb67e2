//! Dispatch skeleton for a locally hosted service (§4.D).
//!
//! `ServerBase` owns the bookkeeping common to every service (status code,
//! instance name, pending event resends); it never touches the wire or the
//! Bus's tables directly — it hands finished [`Packet`]s back to the caller
//! (the Bus), which stamps routing fields and submits them to `send_core`.

use crate::packet::{DeviceId, Packet};

pub const REG_STATUS_CODE: u16 = 0x103;
pub const REG_INSTANCE_NAME: u16 = 0x109;
pub const EV_CHANGE: u8 = 0x3;

struct PendingEvent {
    pkt: Packet,
    sent_at: u64,
    resends_done: usize,
}

/// Outcome of the generic register responder (§4.D "generic register
/// responder"). `Get`/`SetUpdated` need further action from the caller;
/// `NotMine`/`SetIgnored` mean nothing happens.
pub enum RegAction {
    NotMine,
    Get(Packet),
    SetIgnored,
    SetUpdated(Vec<u8>),
}

pub struct ServerBase {
    pub service_index: u8,
    pub service_class: u32,
    pub instance_name: Option<String>,
    status_code: u32,
    pending_events: Vec<PendingEvent>,
}

impl ServerBase {
    pub fn new(service_class: u32) -> Self {
        ServerBase {
            service_index: 0,
            service_class,
            instance_name: None,
            status_code: 0,
            pending_events: Vec::new(),
        }
    }

    pub fn status_code(&self) -> u32 {
        self.status_code
    }

    /// Packs `(code, vendor_code)` into the u32 status register. Returns
    /// `true` when the value actually changed, so the caller knows to emit
    /// `CHANGE`.
    pub fn set_status_code(&mut self, code: u16, vendor_code: u16) -> bool {
        let packed = ((code as u32) << 16) | vendor_code as u32;
        if packed != self.status_code {
            self.status_code = packed;
            true
        } else {
            false
        }
    }

    /// Stamp a response packet with this server's routing identity, the
    /// way `send_report` does in the reference implementation.
    pub fn finish_report(&self, mut pkt: Packet, self_id: DeviceId) -> Packet {
        pkt.set_service_index(self.service_index);
        pkt.set_device_identifier(self_id);
        pkt
    }

    /// The dispatch entry point, steps 1-2 of §4.D; step 3 (the
    /// service-specific hook) is the caller's responsibility when this
    /// returns `None`.
    pub fn handle_builtin(&self, pkt: &Packet) -> Option<Packet> {
        match Self::handle_reg(pkt, REG_STATUS_CODE, &self.status_code.to_le_bytes()) {
            RegAction::Get(reply) => return Some(reply),
            RegAction::NotMine => {}
            _ => return None,
        }
        if pkt.is_reg_get() && pkt.reg_code() == REG_INSTANCE_NAME {
            let name = self.instance_name.clone().unwrap_or_default();
            return Packet::report(pkt.service_command(), name.into_bytes()).ok();
        }
        None
    }

    /// Generic register responder: GET always replies with `current`;
    /// SET on a writable register (high nibble of `register` != 0x1) updates
    /// it when the bytes differ.
    pub fn handle_reg(pkt: &Packet, register: u16, current: &[u8]) -> RegAction {
        if pkt.reg_code() != register {
            return RegAction::NotMine;
        }
        if pkt.is_reg_get() {
            match Packet::report(pkt.service_command(), current.to_vec()) {
                Ok(reply) => RegAction::Get(reply),
                Err(_) => RegAction::NotMine,
            }
        } else if pkt.is_reg_set() {
            if (register >> 8) & 0xf == 1 {
                return RegAction::SetIgnored;
            }
            let new_val = pkt.payload().to_vec();
            if new_val != current {
                RegAction::SetUpdated(new_val)
            } else {
                RegAction::SetIgnored
            }
        } else {
            RegAction::NotMine
        }
    }

    /// Emit an event: builds the first report packet (stamped by the
    /// caller via [`Self::finish_report`]) and schedules +20ms/+100ms
    /// resends, consumed by [`Self::tick`].
    pub fn send_event(&mut self, event_counter: u8, code: u8, data: Vec<u8>, now: u64) -> Packet {
        let cmd = Packet::make_event_command(event_counter, code);
        let pkt = Packet::report(cmd, data).expect("event payload within limit");
        self.pending_events.push(PendingEvent {
            pkt: pkt.clone(),
            sent_at: now,
            resends_done: 0,
        });
        pkt
    }

    pub fn send_change_event(&mut self, event_counter: u8, now: u64) -> Packet {
        self.send_event(event_counter, EV_CHANGE, Vec::new(), now)
    }

    /// Drive pending event resends; returns packets that need to go back
    /// out unstamped (the caller re-stamps and sends via `send_core`).
    pub fn tick(&mut self, now: u64, delays: [u64; 2]) -> Vec<Packet> {
        let mut out = Vec::new();
        self.pending_events.retain_mut(|pending| {
            let elapsed = now.saturating_sub(pending.sent_at);
            if pending.resends_done < delays.len() && elapsed >= delays[pending.resends_done] {
                pending.resends_done += 1;
                out.push(pending.pkt.clone());
            }
            pending.resends_done < delays.len()
        });
        out
    }
}
