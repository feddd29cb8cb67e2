//! Proxy to a remote service instance (§4.E).

use crate::event_emitter::{EventEmitter, SubscriberId};
use crate::packet::{DeviceId, Packet};
use crate::register_cache::{QueryAction, RegisterCache, RegisterTick};
use crate::waiter::Waiter;

const EVT_CONNECTED: u16 = 1;
const EVT_DISCONNECTED: u16 = 2;
const EVT_EVENT: u16 = 3;

pub struct ClientBase {
    pub service_class: u32,
    pub role: String,
    pub broadcast: bool,
    device: Option<DeviceId>,
    service_index: Option<u8>,
    pub registers: RegisterCache,
    events: EventEmitter<Option<Packet>>,
    on_packet: Option<Box<dyn FnMut(&Packet)>>,
}

impl ClientBase {
    pub fn new(service_class: u32, role: impl Into<String>, broadcast: bool) -> Self {
        ClientBase {
            service_class,
            role: role.into(),
            broadcast,
            device: None,
            service_index: None,
            registers: RegisterCache::new(),
            events: EventEmitter::new(),
            on_packet: None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.device.is_some()
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    pub fn service_index(&self) -> Option<u8> {
        self.service_index
    }

    /// Install the service-specific packet hook invoked at the end of
    /// [`Self::handle_packet_outer`].
    pub fn set_on_packet(&mut self, handler: impl FnMut(&Packet) + 'static) {
        self.on_packet = Some(Box::new(handler));
    }

    pub fn on_connected(&mut self, handler: impl FnMut() + 'static) -> SubscriberId {
        let mut handler = handler;
        self.events.on(EVT_CONNECTED, move |_| handler())
    }

    pub fn on_disconnected(&mut self, handler: impl FnMut() + 'static) -> SubscriberId {
        let mut handler = handler;
        self.events.on(EVT_DISCONNECTED, move |_| handler())
    }

    pub fn on_event(&mut self, handler: impl FnMut(&Packet) + 'static) -> SubscriberId {
        let mut handler = handler;
        self.events.on(EVT_EVENT, move |pkt| {
            if let Some(pkt) = pkt {
                handler(pkt);
            }
        })
    }

    /// Called by the Bus's attach scan on acceptance.
    pub fn attach(&mut self, device: DeviceId, service_index: u8) {
        self.device = Some(device);
        self.service_index = Some(service_index);
        self.events.emit(EVT_CONNECTED, &None);
    }

    /// Called by the Bus on device destruction or reattach. Broadcast
    /// clients keep their (absent) device association; ordinary clients go
    /// back on the unattached list.
    pub fn detach(&mut self) {
        self.service_index = None;
        if !self.broadcast {
            self.device = None;
        }
        self.events.emit(EVT_DISCONNECTED, &None);
    }

    /// Stamp `pkt` for transmission to the attached device; `None` when
    /// unattached (silently dropped, per §4.E).
    pub fn send_cmd(&self, mut pkt: Packet) -> Option<Packet> {
        let device = self.device?;
        let idx = self.service_index?;
        pkt.set_service_index(idx);
        pkt.set_device_identifier(device);
        pkt.set_command(true);
        Some(pkt)
    }

    /// `query(code, refresh_ms)`: returns cached data immediately, or a
    /// `Waiter` plus the register-get frame the caller must send now.
    pub fn query(&mut self, code: u16, refresh_ms: u64, now: u64) -> QueryAction {
        self.registers.query(code, refresh_ms, now)
    }

    /// Drive the register cache's resend/timeout schedule.
    pub fn tick_registers(&mut self, now: u64, delays: [u64; 3]) -> Vec<RegisterTick> {
        self.registers.tick(now, delays)
    }

    pub fn handle_packet_outer(&mut self, pkt: &Packet, now: u64) {
        if pkt.is_reg_get() {
            self.registers.on_report(pkt.reg_code(), pkt.payload().to_vec(), now);
        }
        if pkt.is_event() {
            self.events.emit(EVT_EVENT, &Some(pkt.clone()));
        }
        if let Some(handler) = &mut self.on_packet {
            handler(pkt);
        }
    }
}

/// Converts a register-cache `Waiter` into the public `REG_TIMEOUT` surface.
pub fn poll_register_waiter(
    waiter: &Waiter<Option<Vec<u8>>>,
) -> Option<Result<Vec<u8>, crate::error::RegisterError>> {
    waiter.poll().map(|opt| opt.ok_or(crate::error::RegisterError::Timeout))
}
