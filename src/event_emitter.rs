//! Named publish/subscribe primitive (§4.B), used for both device-level
//! event fan-out and the single-shot `await_event` suspension.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::error::EventEmitterError;
use crate::waiter::{one_shot, Waiter};

pub type SubscriberId = u64;

struct Subscriber<T> {
    id: SubscriberId,
    handler: Box<dyn FnMut(&T)>,
    once: bool,
}

/// Subscriber lists keyed by a small integer code (an event code, a register
/// id, ...). `emit` snapshots the subscriber list for a code before
/// dispatching, so a handler that calls `on`/`off`/`emit` for the same code
/// mid-dispatch cannot corrupt the in-progress iteration.
pub struct EventEmitter<T> {
    subscribers: HashMap<u16, Vec<Subscriber<T>>>,
    next_id: SubscriberId,
}

impl<T: Clone + 'static> EventEmitter<T> {
    pub fn new() -> Self {
        EventEmitter {
            subscribers: HashMap::new(),
            next_id: 0,
        }
    }

    fn add(&mut self, code: u16, once: bool, handler: impl FnMut(&T) + 'static) -> SubscriberId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.entry(code).or_default().push(Subscriber {
            id,
            handler: Box::new(handler),
            once,
        });
        id
    }

    pub fn on(&mut self, code: u16, handler: impl FnMut(&T) + 'static) -> SubscriberId {
        self.add(code, false, handler)
    }

    pub fn once(&mut self, code: u16, handler: impl FnMut(&T) + 'static) -> SubscriberId {
        self.add(code, true, handler)
    }

    pub fn off(&mut self, code: u16, id: SubscriberId) -> Result<(), EventEmitterError> {
        let subs = self
            .subscribers
            .get_mut(&code)
            .ok_or(EventEmitterError::NotSubscribed)?;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Err(EventEmitterError::NotSubscribed);
        }
        Ok(())
    }

    pub fn emit(&mut self, code: u16, value: &T) {
        let mut subs = self.subscribers.remove(&code).unwrap_or_default();
        for sub in subs.iter_mut() {
            (sub.handler)(value);
        }
        subs.retain(|s| !s.once);
        if !subs.is_empty() {
            self.subscribers.entry(code).or_default().splice(0..0, subs);
        }
    }

    /// A single-shot suspension that resolves the next time `code` fires.
    pub fn await_event(&mut self, code: u16) -> Waiter<T> {
        let (waiter, resolver) = one_shot();
        let resolver = RefCell::new(Some(resolver));
        self.once(code, move |value: &T| {
            if let Some(r) = resolver.borrow_mut().take() {
                r.resolve(value.clone());
            }
        });
        waiter
    }
}

impl<T: Clone + 'static> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn on_emit_off() {
        let mut emitter: EventEmitter<u32> = EventEmitter::new();
        let seen = Rc::new(Cell::new(0u32));
        let seen2 = seen.clone();
        let id = emitter.on(7, move |v| seen2.set(*v));
        emitter.emit(7, &99);
        assert_eq!(seen.get(), 99);
        emitter.off(7, id).unwrap();
        emitter.emit(7, &1);
        assert_eq!(seen.get(), 99);
    }

    #[test]
    fn off_unknown_subscriber_errors() {
        let mut emitter: EventEmitter<u32> = EventEmitter::new();
        assert_eq!(emitter.off(1, 0).unwrap_err(), EventEmitterError::NotSubscribed);
    }

    #[test]
    fn once_fires_a_single_time() {
        let mut emitter: EventEmitter<u32> = EventEmitter::new();
        let count = Rc::new(Cell::new(0u32));
        let count2 = count.clone();
        emitter.once(3, move |_| count2.set(count2.get() + 1));
        emitter.emit(3, &0);
        emitter.emit(3, &0);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn await_event_resolves_on_next_emit() {
        let mut emitter: EventEmitter<u32> = EventEmitter::new();
        let waiter = emitter.await_event(4);
        assert!(waiter.poll().is_none());
        emitter.emit(4, &55);
        assert_eq!(waiter.poll(), Some(55));
    }
}
