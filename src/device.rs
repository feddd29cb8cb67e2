//! Remote peer record (§4.F): identifier, service-class vector, announce
//! flags, event counter state, and the client ids attached to it.

use crate::packet::{DeviceId, Packet};
use crate::util::u32_le;

const EVENT_COUNTER_MASK: u8 = 0x7f;
const RESTART_COUNTER_MASK: u16 = 0xf;

/// Opaque handle into the Bus's client table; a device's `clients` list
/// stores these rather than owning `ClientBase` values directly (the
/// application owns clients; the Bus and Device only reference them).
pub type ClientId = usize;

pub struct Device {
    pub device_id: DeviceId,
    services: Vec<u8>,
    pub clients: Vec<ClientId>,
    pub last_seen: u64,
    event_counter: Option<u8>,
    ctrl_client: Option<ClientId>,
}

impl Device {
    pub fn new(device_id: DeviceId, services: Vec<u8>, now: u64) -> Self {
        Device {
            device_id,
            services,
            clients: Vec::new(),
            last_seen: now,
            event_counter: None,
            ctrl_client: None,
        }
    }

    pub fn services(&self) -> &[u8] {
        &self.services
    }

    pub fn set_services(&mut self, services: Vec<u8>) {
        self.services = services;
    }

    pub fn num_service_classes(&self) -> usize {
        self.services.len() / 4
    }

    pub fn announce_flags(&self) -> u16 {
        if self.services.len() >= 2 {
            u16::from_le_bytes([self.services[0], self.services[1]])
        } else {
            0
        }
    }

    pub fn reset_count(&self) -> u8 {
        (self.announce_flags() & RESTART_COUNTER_MASK) as u8
    }

    /// Slot 0 is the announce-flags/restart-counter slot (reserved class 0);
    /// slot i>=1 is the little-endian service class at byte offset `i*4`.
    pub fn service_class_at(&self, idx: u8) -> Option<u32> {
        if idx == 0 {
            return Some(0);
        }
        let offset = (idx as usize) * 4;
        if offset + 4 > self.services.len() {
            None
        } else {
            Some(u32_le(&self.services, offset))
        }
    }

    /// `role_manager` stands in for the out-of-scope external role policy
    /// hook (§1); absent, every role binding is accepted once the built-in
    /// checks pass, matching the reference implementation's default.
    pub fn matches_role_at(
        &self,
        role: &str,
        service_idx: u8,
        role_manager: Option<&dyn Fn(DeviceId, u8, &str) -> bool>,
    ) -> bool {
        if role.is_empty() || role == self.device_id.hex() {
            return true;
        }
        if role == format!("{}:{}", self.device_id.hex(), service_idx) {
            return true;
        }
        match role_manager {
            Some(f) => f(self.device_id, service_idx, role),
            None => true,
        }
    }

    pub fn ctrl_client(&self) -> Option<ClientId> {
        self.ctrl_client
    }

    pub fn set_ctrl_client(&mut self, id: ClientId) {
        self.ctrl_client = Some(id);
    }

    /// Event counter algorithm (§4.F). Returns `true` if the event should be
    /// delivered, `false` if it's a duplicate/stale retransmission that
    /// should be silently dropped.
    fn accept_event(&mut self, counter: u8) -> bool {
        let Some(prev) = self.event_counter else {
            self.event_counter = Some(counter);
            return true;
        };
        let expected = prev.wrapping_add(1) & EVENT_COUNTER_MASK;
        let ahead = counter.wrapping_sub(expected) & EVENT_COUNTER_MASK;
        let behind = expected.wrapping_sub(counter) & EVENT_COUNTER_MASK;
        if ahead > 0 && (behind < 60 || ahead < 5) {
            return false;
        }
        self.event_counter = Some(counter);
        true
    }

    pub fn event_counter(&self) -> Option<u8> {
        self.event_counter
    }

    /// Refresh liveness and, for events, apply the reordering/dedup gate.
    /// Returns `true` when the Bus should go on to forward `pkt` to this
    /// device's attached clients.
    pub fn process_packet(&mut self, pkt: &Packet, now: u64) -> bool {
        self.last_seen = now;
        let service_class = self.service_class_at(pkt.service_index());
        if matches!(service_class, None | Some(0) | Some(0xffff_ffff)) {
            return false;
        }
        if pkt.is_event() {
            let counter = pkt.event_counter().expect("is_event implies a counter");
            if !self.accept_event(counter) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services_with_flags(restart: u8, classes: &[u32]) -> Vec<u8> {
        let mut v = vec![0u8; 4];
        v[0..2].copy_from_slice(&(restart as u16).to_le_bytes());
        for c in classes {
            v.extend_from_slice(&c.to_le_bytes());
        }
        v
    }

    #[test]
    fn service_class_at_indexes_correctly() {
        let dev = Device::new(DeviceId([0; 8]), services_with_flags(1, &[0x1f14_0409]), 0);
        assert_eq!(dev.service_class_at(0), Some(0));
        assert_eq!(dev.service_class_at(1), Some(0x1f14_0409));
        assert_eq!(dev.service_class_at(2), None);
        assert_eq!(dev.num_service_classes(), 2);
        assert_eq!(dev.reset_count(), 1);
    }

    #[test]
    fn event_reordering_drops_small_forward_gap_and_recovers_on_retransmit() {
        let mut dev = Device::new(DeviceId([0; 8]), services_with_flags(0, &[1]), 0);
        assert!(dev.accept_event(10)); // first event seen, always accepted
        assert!(dev.accept_event(11));
        assert!(dev.accept_event(12));
        // 14 arrives with one missing (13): ahead=1 < 5, so it's dropped
        // pending 13's retransmission rather than accepted as a resync.
        assert!(!dev.accept_event(14));
        // 13 then arrives in order and is accepted normally.
        assert!(dev.accept_event(13));
        assert_eq!(dev.event_counter(), Some(13));
    }

    #[test]
    fn event_reordering_accepts_large_forward_jump() {
        let mut dev = Device::new(DeviceId([0; 8]), services_with_flags(0, &[1]), 0);
        assert!(dev.accept_event(10));
        // a jump of 6 missed events is treated as a burst loss and resynced.
        assert!(dev.accept_event(17));
        assert_eq!(dev.event_counter(), Some(17));
    }

    #[test]
    fn matches_role_defaults_true_without_role_manager() {
        let dev = Device::new(DeviceId([1; 8]), vec![], 0);
        assert!(dev.matches_role_at("", 1, None));
        assert!(dev.matches_role_at("anything", 1, None));
    }
}
