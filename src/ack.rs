//! Retransmit/await-ack state machine for command frames (§4.H).

use crate::error::AckError;
use crate::packet::{DeviceId, Packet};
use crate::waiter::{one_shot, Resolver, Waiter};

struct Awaiter {
    pkt: Packet,
    dest_id: DeviceId,
    crc: u16,
    retries_used: u32,
    /// `> 0`: pending, next retry due at this timestamp. `0`: acked. `-1`: failed.
    next_retry: i64,
    resolver: Option<Resolver<Result<(), AckError>>>,
}

pub struct AckTracker {
    awaiters: Vec<Awaiter>,
    initial_retry_ms: u64,
    max_retries: u32,
}

impl AckTracker {
    pub fn new(initial_retry_ms: u64, max_retries: u32) -> Self {
        AckTracker {
            awaiters: Vec::new(),
            initial_retry_ms,
            max_retries,
        }
    }

    /// Register a command frame awaiting acknowledgment. `crc` is the value
    /// the physical layer stamped onto `pkt` on transmit (see
    /// [`crate::driver::Driver::crc16`]).
    pub fn send_with_ack(
        &mut self,
        pkt: Packet,
        dest_id: DeviceId,
        crc: u16,
        now: u64,
    ) -> Waiter<Result<(), AckError>> {
        let (waiter, resolver) = one_shot();
        self.awaiters.push(Awaiter {
            pkt,
            dest_id,
            crc,
            retries_used: 1,
            next_retry: now as i64 + self.initial_retry_ms as i64,
            resolver: Some(resolver),
        });
        waiter
    }

    /// A CRC-ACK frame arrived; resolve every matching pending awaiter.
    pub fn got_ack(&mut self, crc: u16, dest_id: DeviceId) {
        for awaiter in self.awaiters.iter_mut() {
            if awaiter.crc == crc && awaiter.dest_id == dest_id && awaiter.next_retry > 0 {
                awaiter.next_retry = 0;
                if let Some(resolver) = awaiter.resolver.take() {
                    resolver.resolve(Ok(()));
                }
            }
        }
        self.awaiters.retain(|a| a.next_retry > 0);
    }

    /// Drive retransmission; returns frames that need to go back out.
    pub fn tick(&mut self, now: u64) -> Vec<Packet> {
        let mut resends = Vec::new();
        for awaiter in self.awaiters.iter_mut() {
            if awaiter.next_retry <= 0 || (now as i64) <= awaiter.next_retry {
                continue;
            }
            if awaiter.retries_used >= self.max_retries {
                awaiter.next_retry = -1;
                log::warn!(
                    "ack for crc {:#06x} to {} timed out after {} retries",
                    awaiter.crc,
                    awaiter.dest_id,
                    awaiter.retries_used
                );
                if let Some(resolver) = awaiter.resolver.take() {
                    resolver.resolve(Err(AckError::Timeout));
                }
            } else {
                awaiter.retries_used += 1;
                awaiter.next_retry = now as i64 + (awaiter.retries_used as i64) * self.initial_retry_ms as i64;
                resends.push(awaiter.pkt.clone());
            }
        }
        self.awaiters.retain(|a| a.next_retry > 0);
        resends
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new(40, 4)
    }
}
