//! Central router (§4.G): announce/GC scheduling, device table, server and
//! client dispatch, and the send path shared by every outgoing frame.

use std::collections::HashMap;

use crate::ack::AckTracker;
use crate::client::ClientBase;
use crate::config::BusConfig;
use crate::control::{ControlAction, ControlServer, REG_UPTIME, SERVICE_CLASS_CONTROL};
use crate::device::{ClientId, Device};
use crate::driver::Driver;
use crate::event_emitter::EventEmitter;
use crate::packet::{DeviceId, Packet, SERVICE_INDEX_CRC_ACK, SERVICE_INDEX_CTRL};
use crate::register_cache::RegisterTick;
use crate::server::ServerBase;
use crate::waiter::{one_shot, Waiter};

/// Capability set every locally hosted (non-control) service implements.
/// `handle` is the service-specific hook, step 3 of §4.D's dispatch order;
/// the generic status-code/instance-name responses are handled by the Bus
/// itself via `ServerBase::handle_builtin` before `handle` is ever called.
pub trait BusServer {
    fn base(&self) -> &ServerBase;
    fn base_mut(&mut self) -> &mut ServerBase;
    fn handle(&mut self, pkt: &Packet) -> Vec<Packet>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BusEventKind {
    SelfAnnounce = 0,
    DeviceConnect = 1,
    DeviceChange = 2,
    DeviceAnnounce = 3,
    Change = 4,
    Restart = 5,
    Identify = 6,
    ResetRequested = 7,
    Event = 8,
    PacketProcess = 9,
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    SelfAnnounce,
    DeviceConnect(DeviceId),
    DeviceChange(DeviceId),
    DeviceAnnounce(DeviceId),
    Change,
    Restart,
    Identify,
    ResetRequested,
    Event(Packet),
    PacketProcess(Packet),
}

pub struct Bus<D: Driver> {
    driver: D,
    self_device_id: DeviceId,
    config: BusConfig,
    devices: HashMap<DeviceId, Device>,
    servers: Vec<Box<dyn BusServer>>,
    control: ControlServer,
    clients: Vec<ClientBase>,
    unattached_clients: Vec<ClientId>,
    ack: AckTracker,
    events: EventEmitter<BusEvent>,
    event_counter: u8,
    next_announce_ts: u64,
    start_ts: Option<u64>,
}

impl<D: Driver> Bus<D> {
    pub fn new(driver: D) -> Self {
        Self::with_config(driver, BusConfig::default())
    }

    pub fn with_config(driver: D, config: BusConfig) -> Self {
        let self_device_id = DeviceId::from(driver.uid());
        Bus {
            driver,
            self_device_id,
            ack: AckTracker::new(config.ack_initial_retry_ms, config.ack_max_retries),
            config,
            devices: HashMap::new(),
            servers: Vec::new(),
            control: ControlServer::new(),
            clients: Vec::new(),
            unattached_clients: Vec::new(),
            events: EventEmitter::new(),
            event_counter: 0,
            next_announce_ts: 0,
            start_ts: None,
        }
    }

    pub fn self_device_id(&self) -> DeviceId {
        self.self_device_id
    }

    pub fn control(&self) -> &ControlServer {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut ControlServer {
        &mut self.control
    }

    pub fn on(&mut self, kind: BusEventKind, handler: impl FnMut(&BusEvent) + 'static) {
        self.events.on(kind as u16, handler);
    }

    fn emit(&mut self, kind: BusEventKind, payload: BusEvent) {
        self.events.emit(kind as u16, &payload);
    }

    pub fn add_server(&mut self, mut server: Box<dyn BusServer>) -> u8 {
        let idx = (self.servers.len() + 1) as u8;
        server.base_mut().service_index = idx;
        self.servers.push(server);
        idx
    }

    pub fn add_client(&mut self, client: ClientBase) -> ClientId {
        let id = self.clients.len();
        self.clients.push(client);
        self.unattached_clients.push(id);
        id
    }

    pub fn client(&self, id: ClientId) -> Option<&ClientBase> {
        self.clients.get(id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut ClientBase> {
        self.clients.get_mut(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    fn next_event_counter(&mut self) -> u8 {
        let c = self.event_counter;
        self.event_counter = (self.event_counter + 1) & 0x7f;
        c
    }

    /// Compute the transmit CRC, stamp it onto the frame, hand the bytes to
    /// the physical driver, then re-enter the router unconditionally so the
    /// sender's own servers/clients see it too (§4.G send path).
    fn send_core(&mut self, mut pkt: Packet, now: u64) -> u16 {
        assert_eq!(pkt.payload().len(), pkt.size() as usize);
        let mut bytes = pkt.to_bytes();
        let crc = self.driver.crc16(&bytes[2..]);
        bytes[0..2].copy_from_slice(&crc.to_le_bytes());
        pkt.set_crc(crc);
        self.driver.send(&bytes);
        self.route_packet(pkt, now);
        crc
    }

    /// Send a command through an attached client, stamping routing fields.
    /// Returns `None` if the client is unattached (silently dropped) or
    /// unknown. If the packet requests an ack, the returned waiter resolves
    /// on `got_ack`/retry exhaustion; callers that don't need ack tracking
    /// get `Ok(None)`.
    pub fn send_client_cmd(
        &mut self,
        client_id: ClientId,
        pkt: Packet,
        now: u64,
    ) -> Option<Waiter<Result<(), crate::error::AckError>>> {
        let stamped = self.clients.get(client_id)?.send_cmd(pkt)?;
        let wants_ack = stamped.requires_ack();
        let dest = stamped.device_identifier();
        let crc = self.send_core(stamped.clone(), now);
        if wants_ack {
            Some(self.ack.send_with_ack(stamped, dest, crc, now))
        } else {
            None
        }
    }

    fn send_register_get(&mut self, client_id: ClientId, code: u16, now: u64) {
        let Ok(pkt) = Packet::report(Packet::make_get_reg_command(code), vec![]) else {
            return;
        };
        if let Some(stamped) = self.clients.get(client_id).and_then(|c| c.send_cmd(pkt)) {
            self.send_core(stamped, now);
        }
    }

    /// `query(code, refresh_ms)`: returns cached data immediately if fresh,
    /// otherwise issues a register-get and suspends on the change event.
    pub fn query_register(
        &mut self,
        client_id: ClientId,
        code: u16,
        refresh_ms: u64,
        now: u64,
    ) -> Option<Waiter<Option<Vec<u8>>>> {
        let action = self.clients.get_mut(client_id)?.query(code, refresh_ms, now);
        match action {
            crate::register_cache::QueryAction::Ready(data) => {
                let (waiter, resolver) = one_shot();
                resolver.resolve(Some(data));
                Some(waiter)
            }
            crate::register_cache::QueryAction::Pending(code, waiter) => {
                self.send_register_get(client_id, code, now);
                Some(waiter)
            }
        }
    }

    /// Lazily attach a zero-role client to `dev_id`'s control service so the
    /// host can talk back to a remote device's control registers (e.g. to
    /// read its uptime) without declaring its own client up front.
    fn ctrl_client_for(&mut self, dev_id: DeviceId) -> Option<ClientId> {
        if let Some(existing) = self.devices.get(&dev_id).and_then(|d| d.ctrl_client()) {
            return Some(existing);
        }
        if !self.devices.contains_key(&dev_id) {
            return None;
        }
        let mut client = ClientBase::new(SERVICE_CLASS_CONTROL, "", false);
        client.attach(dev_id, SERVICE_INDEX_CTRL);
        let cid = self.clients.len();
        self.clients.push(client);
        let dev = self.devices.get_mut(&dev_id)?;
        dev.set_ctrl_client(cid);
        dev.clients.push(cid);
        Some(cid)
    }

    /// Query a remote device's uptime register, attaching its control client
    /// on first use.
    pub fn query_device_uptime(&mut self, dev_id: DeviceId, now: u64) -> Option<Waiter<Option<Vec<u8>>>> {
        let cid = self.ctrl_client_for(dev_id)?;
        self.query_register(cid, REG_UPTIME, 0, now)
    }

    /// Poll a waiter returned by [`Self::query_register`], translating the
    /// raw cache result into the public `REG_TIMEOUT` surface.
    pub fn poll_register(
        &self,
        waiter: &Waiter<Option<Vec<u8>>>,
    ) -> Option<Result<Vec<u8>, crate::error::RegisterError>> {
        crate::client::poll_register_waiter(waiter)
    }

    /// Drive every periodic/scheduled piece of bus state: announce + GC,
    /// inbound frame drain, ACK retransmits, event resends, and register
    /// cache refresh timers. Call on whatever cadence the host loop likes;
    /// the 10ms/500ms spec intervals are respected internally.
    pub fn poll(&mut self, now: u64) {
        if self.start_ts.is_none() {
            self.start_ts = Some(now);
        }
        while let Some(bytes) = self.driver.receive() {
            match Packet::from_bytes(&bytes) {
                Ok(pkt) => self.route_packet(pkt, now),
                Err(e) => log::debug!("dropping malformed frame: {e}"),
            }
        }

        if now >= self.next_announce_ts {
            self.next_announce_ts = now + self.config.announce_interval_ms;
            self.do_announce(now);
            self.gc_devices(now);
        }

        for pkt in self.ack.tick(now) {
            self.send_core(pkt, now);
        }

        let event_delays = self.config.event_resend_delays_ms;
        for pkt in self.control.base.tick(now, event_delays) {
            let pkt = self.control.base.finish_report(pkt, self.self_device_id);
            self.send_core(pkt, now);
        }
        for i in 0..self.servers.len() {
            let resends = self.servers[i].base_mut().tick(now, event_delays);
            for pkt in resends {
                let pkt = self.servers[i].base().finish_report(pkt, self.self_device_id);
                self.send_core(pkt, now);
            }
        }

        let register_delays = self.config.register_refresh_delays_ms;
        for client_id in 0..self.clients.len() {
            let ticks = self.clients[client_id].tick_registers(now, register_delays);
            for tick in ticks {
                if let RegisterTick::Send(code) = tick {
                    self.send_register_get(client_id, code, now);
                }
            }
        }
    }

    fn do_announce(&mut self, now: u64) {
        let mut payload = Vec::with_capacity(4 * (1 + self.servers.len()));
        payload.extend_from_slice(&self.control.next_announce_slot0().to_le_bytes());
        for server in &self.servers {
            payload.extend_from_slice(&server.base().service_class.to_le_bytes());
        }
        if let Ok(pkt) = Packet::report(0, payload) {
            let pkt = self.control.base.finish_report(pkt, self.self_device_id);
            self.send_core(pkt, now);
        }
        self.emit(BusEventKind::SelfAnnounce, BusEvent::SelfAnnounce);
    }

    fn gc_devices(&mut self, now: u64) {
        let stale: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| now.saturating_sub(d.last_seen) > self.config.device_timeout_ms)
            .map(|d| d.device_id)
            .collect();
        for id in stale {
            self.destroy_device(id);
        }
    }

    fn destroy_device(&mut self, id: DeviceId) {
        let Some(dev) = self.devices.remove(&id) else {
            return;
        };
        for cid in dev.clients {
            if let Some(client) = self.clients.get_mut(cid) {
                client.detach();
                if !client.broadcast {
                    self.unattached_clients.push(cid);
                }
            }
        }
        self.emit(BusEventKind::DeviceChange, BusEvent::DeviceChange(id));
        self.emit(BusEventKind::Change, BusEvent::Change);
    }

    fn route_packet(&mut self, pkt: Packet, now: u64) {
        self.emit(BusEventKind::PacketProcess, BusEvent::PacketProcess(pkt.clone()));

        if let Some(class) = pkt.multicommand_class() {
            if !pkt.is_command() {
                log::trace!("dropping multicommand report for service class {class:#010x}");
                return;
            }
            let matching: Vec<u8> = self
                .servers
                .iter()
                .enumerate()
                .filter(|(_, s)| s.base().service_class == class)
                .map(|(i, _)| (i + 1) as u8)
                .collect();
            for idx in matching {
                let mut p2 = pkt.clone();
                p2.set_device_identifier(self.self_device_id);
                p2.set_service_index(idx);
                self.dispatch_to_server(idx, &p2, now);
            }
            return;
        }

        if pkt.device_identifier() == self.self_device_id && pkt.is_command() {
            self.dispatch_to_server(pkt.service_index(), &pkt, now);
            return;
        }

        if pkt.is_command() {
            log::trace!(
                "dropping command addressed to another device {}",
                pkt.device_identifier()
            );
            return;
        }

        let dev_id = pkt.device_identifier();
        if pkt.service_index() == SERVICE_INDEX_CTRL {
            if pkt.service_command() == 0 {
                self.handle_announce_packet(dev_id, pkt.payload().to_vec(), now);
            } else if let Some(dev) = self.devices.get_mut(&dev_id) {
                // Control traffic besides the announce (register replies to a
                // ctrl client) isn't subject to the service-class/event gate:
                // slot 0 is the reserved flags word, not an addressable class.
                dev.last_seen = now;
                self.forward_to_clients(dev_id, &pkt, now);
            }
            return;
        }

        if pkt.service_index() == SERVICE_INDEX_CRC_ACK {
            self.ack.got_ack(pkt.service_command(), dev_id);
            return;
        }

        if let Some(dev) = self.devices.get_mut(&dev_id) {
            if dev.process_packet(&pkt, now) {
                self.forward_to_clients(dev_id, &pkt, now);
            }
        }
    }

    fn dispatch_to_server(&mut self, idx: u8, pkt: &Packet, now: u64) {
        if idx == SERVICE_INDEX_CTRL {
            let uptime_us = now.saturating_sub(self.start_ts.unwrap_or(now)) * 1000;
            let (reply, action) = self.control.handle(pkt, uptime_us);
            if let Some(reply) = reply {
                let reply = self.control.base.finish_report(reply, self.self_device_id);
                self.send_core(reply, now);
            }
            match action {
                Some(ControlAction::Announce) => self.do_announce(now),
                Some(ControlAction::Identify) => self.emit(BusEventKind::Identify, BusEvent::Identify),
                Some(ControlAction::Reset) => {
                    self.emit(BusEventKind::ResetRequested, BusEvent::ResetRequested)
                }
                None => {}
            }
            return;
        }

        let Some(pos) = idx.checked_sub(1).map(|i| i as usize) else {
            log::debug!("packet addressed to unknown service index {idx}");
            return;
        };
        let replies = {
            let Some(server) = self.servers.get_mut(pos) else {
                log::debug!("packet addressed to unknown service index {idx}");
                return;
            };
            match server.base().handle_builtin(pkt) {
                Some(reply) => vec![reply],
                None => server.handle(pkt),
            }
        };
        for reply in replies {
            let reply = self.servers[pos].base().finish_report(reply, self.self_device_id);
            self.send_core(reply, now);
        }
    }

    fn handle_announce_packet(&mut self, dev_id: DeviceId, data: Vec<u8>, now: u64) {
        let incoming_restart = data.first().copied().unwrap_or(0) & 0xf;
        if let Some(existing) = self.devices.get(&dev_id) {
            if existing.reset_count() > incoming_restart {
                log::warn!(
                    "device {dev_id} restarted (restart counter {} -> {incoming_restart})",
                    existing.reset_count()
                );
                self.destroy_device(dev_id);
                self.emit(BusEventKind::Restart, BusEvent::Restart);
            }
        }

        match self.devices.get_mut(&dev_id) {
            None => {
                let dev = Device::new(dev_id, data, now);
                self.devices.insert(dev_id, dev);
                self.emit(BusEventKind::DeviceConnect, BusEvent::DeviceConnect(dev_id));
                self.attach_scan(dev_id);
            }
            Some(dev) => {
                let matches = service_classes_match(dev.services(), &data);
                dev.set_services(data);
                if !matches {
                    self.reattach(dev_id, now);
                }
            }
        }
    }

    /// Re-evaluate a device's client attachments after its service-class
    /// vector changed shape (§4.G "Reattach algorithm").
    fn reattach(&mut self, dev_id: DeviceId, _now: u64) {
        let Some(old_clients) = self.devices.get(&dev_id).map(|d| d.clients.clone()) else {
            return;
        };
        log::warn!("device {dev_id} changed service classes, reattaching clients");
        let mut retained = Vec::new();
        for cid in old_clients {
            let Some(idx) = self.clients.get(cid).and_then(|c| c.service_index()) else {
                continue;
            };
            let (service_class, role) = {
                let c = &self.clients[cid];
                (c.service_class, c.role.clone())
            };
            let matches = {
                let dev = &self.devices[&dev_id];
                dev.service_class_at(idx) == Some(service_class) && dev.matches_role_at(&role, idx, None)
            };
            if matches {
                retained.push(cid);
            } else {
                self.clients[cid].detach();
                self.unattached_clients.push(cid);
            }
        }
        if let Some(dev) = self.devices.get_mut(&dev_id) {
            dev.clients = retained;
        }
        self.attach_scan(dev_id);
        self.emit(BusEventKind::DeviceAnnounce, BusEvent::DeviceAnnounce(dev_id));
    }

    /// Attach unattached non-broadcast clients into any service-class slot
    /// not already occupied by a retained attachment. Broadcast clients
    /// never appear here; they are matched directly by class in
    /// `forward_to_clients`.
    fn attach_scan(&mut self, dev_id: DeviceId) {
        if self.unattached_clients.is_empty() {
            return;
        }
        let num_classes = match self.devices.get(&dev_id) {
            Some(d) => d.num_service_classes(),
            None => return,
        };
        let mut occupied = vec![false; num_classes];
        if let Some(dev) = self.devices.get(&dev_id) {
            for &cid in &dev.clients {
                if let Some(idx) = self.clients.get(cid).and_then(|c| c.service_index()) {
                    occupied[idx as usize] = true;
                }
            }
        }
        for idx in 1..num_classes {
            if occupied[idx] {
                continue;
            }
            let Some(service_class) = self.devices.get(&dev_id).and_then(|d| d.service_class_at(idx as u8))
            else {
                continue;
            };
            let found = self
                .unattached_clients
                .iter()
                .position(|&cid| !self.clients[cid].broadcast && self.clients[cid].service_class == service_class);
            let Some(pos) = found else { continue };
            let cid = self.unattached_clients[pos];
            let role_ok = self
                .devices
                .get(&dev_id)
                .map(|d| d.matches_role_at(&self.clients[cid].role, idx as u8, None))
                .unwrap_or(false);
            if !role_ok {
                continue;
            }
            self.unattached_clients.remove(pos);
            self.clients[cid].attach(dev_id, idx as u8);
            if let Some(dev) = self.devices.get_mut(&dev_id) {
                dev.clients.push(cid);
            }
        }
    }

    fn forward_to_clients(&mut self, dev_id: DeviceId, pkt: &Packet, now: u64) {
        let Some(dev) = self.devices.get(&dev_id) else {
            return;
        };
        let attached: Vec<ClientId> = dev
            .clients
            .iter()
            .copied()
            .filter(|&cid| self.clients.get(cid).and_then(|c| c.service_index()) == Some(pkt.service_index()))
            .collect();
        let target_class = dev.service_class_at(pkt.service_index());
        for cid in attached {
            self.clients[cid].handle_packet_outer(pkt, now);
        }
        if let Some(class) = target_class {
            for client in self.clients.iter_mut().filter(|c| c.broadcast && c.service_class == class) {
                client.handle_packet_outer(pkt, now);
            }
        }
    }

    /// Emit an event from a locally hosted server at `service_index`,
    /// allocating the next bus-scoped counter value.
    pub fn send_server_event(&mut self, service_index: u8, code: u8, data: Vec<u8>, now: u64) {
        let counter = self.next_event_counter();
        let pkt = if service_index == SERVICE_INDEX_CTRL {
            self.control.base.send_event(counter, code, data, now)
        } else {
            let Some(server) = self.servers.get_mut((service_index - 1) as usize) else {
                return;
            };
            server.base_mut().send_event(counter, code, data, now)
        };
        let pkt = self.finish_report_for(service_index, pkt);
        self.send_core(pkt, now);
    }

    fn finish_report_for(&self, service_index: u8, pkt: Packet) -> Packet {
        if service_index == SERVICE_INDEX_CTRL {
            self.control.base.finish_report(pkt, self.self_device_id)
        } else {
            self.servers[(service_index - 1) as usize]
                .base()
                .finish_report(pkt, self.self_device_id)
        }
    }
}

/// Per §4.G: service classes "match" when every slot beyond the
/// flags/restart-counter word (slot 0) is unchanged.
fn service_classes_match(old: &[u8], new: &[u8]) -> bool {
    if old.len() != new.len() {
        return false;
    }
    old.len() < 4 || old[4..] == new[4..]
}
