//! Client-side register cache (§4.C): last-value-plus-timestamp per
//! register code, triple-resend refresh, and suspending `query`.
//!
//! This module only tracks *state and timing*; it never touches the wire
//! itself. The owning [`crate::client::ClientBase`] asks it what to do each
//! tick and sends the resulting register-get frames through the Bus.

use std::collections::HashMap;

use crate::event_emitter::EventEmitter;
use crate::waiter::Waiter;

struct Pending {
    sent_at: u64,
    resends_done: usize,
}

struct RawRegister {
    code: u16,
    data: Option<Vec<u8>>,
    last_query_ts: u64,
    last_report_ts: u64,
    pending: Option<Pending>,
}

impl RawRegister {
    fn new(code: u16) -> Self {
        RawRegister {
            code,
            data: None,
            last_query_ts: 0,
            last_report_ts: 0,
            pending: None,
        }
    }
}

/// What a `tick` or `query` asks the owning client to do.
pub enum RegisterTick {
    /// Send (or resend) a register-get frame for this code now.
    Send(u16),
    /// The triple-resend window elapsed with no report; the entry has
    /// already been marked empty and its waiters notified.
    TimedOut(u16),
}

pub enum QueryAction {
    /// Cached data was fresh enough; no frame sent.
    Ready(Vec<u8>),
    /// A refresh was started; `code` has already been queued for sending by
    /// the caller, and `waiter` resolves to `None` on `REG_TIMEOUT`.
    Pending(u16, Waiter<Option<Vec<u8>>>),
}

pub struct RegisterCache {
    entries: HashMap<u16, RawRegister>,
    changes: EventEmitter<Option<Vec<u8>>>,
}

impl RegisterCache {
    pub fn new() -> Self {
        RegisterCache {
            entries: HashMap::new(),
            changes: EventEmitter::new(),
        }
    }

    pub fn current(&self, code: u16, refresh_ms: u64, now: u64) -> Option<&[u8]> {
        let entry = self.entries.get(&code)?;
        let data = entry.data.as_deref()?;
        if entry.last_report_ts + refresh_ms >= now {
            Some(data)
        } else {
            None
        }
    }

    /// Start (or restart) the triple-resend refresh for `code`. Does not
    /// itself send anything; the caller sends the initial get based on the
    /// returned code, exactly as it would for a later [`Self::tick`] resend.
    pub fn begin_refresh(&mut self, code: u16, now: u64) {
        let entry = self.entries.entry(code).or_insert_with(|| RawRegister::new(code));
        entry.last_query_ts = now;
        entry.pending = Some(Pending {
            sent_at: now,
            resends_done: 0,
        });
    }

    pub fn query(&mut self, code: u16, refresh_ms: u64, now: u64) -> QueryAction {
        if let Some(data) = self.current(code, refresh_ms, now) {
            return QueryAction::Ready(data.to_vec());
        }
        self.begin_refresh(code, now);
        let waiter = self.changes.await_event(code);
        QueryAction::Pending(code, waiter)
    }

    /// Drive the resend/timeout schedule. `delays` are the three cumulative
    /// offsets from the initial send (20ms, 70ms, 170ms per spec).
    pub fn tick(&mut self, now: u64, delays: [u64; 3]) -> Vec<RegisterTick> {
        let mut actions = Vec::new();
        let mut timed_out = Vec::new();
        for entry in self.entries.values_mut() {
            let Some(pending) = &mut entry.pending else {
                continue;
            };
            let elapsed = now.saturating_sub(pending.sent_at);
            if pending.resends_done < delays.len() {
                if elapsed >= delays[pending.resends_done] {
                    pending.resends_done += 1;
                    actions.push(RegisterTick::Send(entry.code));
                }
            } else {
                timed_out.push(entry.code);
            }
        }
        for code in timed_out {
            if let Some(entry) = self.entries.get_mut(&code) {
                entry.pending = None;
            }
            self.changes.emit(code, &None);
            actions.push(RegisterTick::TimedOut(code));
        }
        actions
    }

    pub fn on_report(&mut self, code: u16, data: Vec<u8>, now: u64) {
        let entry = self.entries.entry(code).or_insert_with(|| RawRegister::new(code));
        entry.data = Some(data.clone());
        entry.last_report_ts = now;
        entry.pending = None;
        self.changes.emit(code, &Some(data));
    }
}

impl Default for RegisterCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cache_hit_needs_no_refresh() {
        let mut cache = RegisterCache::new();
        cache.on_report(0x101, vec![1, 2, 3], 1000);
        match cache.query(0x101, 500, 1100) {
            QueryAction::Ready(d) => assert_eq!(d, vec![1, 2, 3]),
            QueryAction::Pending(..) => panic!("expected cache hit"),
        }
    }

    #[test]
    fn stale_cache_triggers_refresh_and_suspends() {
        let mut cache = RegisterCache::new();
        cache.on_report(0x101, vec![9], 0);
        let waiter = match cache.query(0x101, 10, 1000) {
            QueryAction::Pending(code, w) => {
                assert_eq!(code, 0x101);
                w
            }
            QueryAction::Ready(_) => panic!("expected stale miss"),
        };
        assert!(waiter.poll().is_none());
        cache.on_report(0x101, vec![42], 1001);
        assert_eq!(waiter.poll(), Some(Some(vec![42])));
    }

    #[test]
    fn triple_resend_then_timeout() {
        let mut cache = RegisterCache::new();
        let QueryAction::Pending(_, waiter) = cache.query(0x200, 500, 0) else {
            panic!("expected first query to miss")
        };
        let delays = [20, 70, 170];
        assert!(matches!(cache.tick(10, delays)[..], []));
        let t1 = cache.tick(20, delays);
        assert!(matches!(t1[..], [RegisterTick::Send(0x200)]));
        let t2 = cache.tick(70, delays);
        assert!(matches!(t2[..], [RegisterTick::Send(0x200)]));
        let t3 = cache.tick(170, delays);
        assert!(matches!(t3[..], [RegisterTick::Send(0x200)]));
        let t4 = cache.tick(171, delays);
        assert!(matches!(t4[..], [RegisterTick::TimedOut(0x200)]));
        assert_eq!(waiter.poll(), Some(None));
    }
}
