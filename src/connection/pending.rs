//! Calls waiting for their reply, keyed by serial.

use crate::error::{Error, Result};
use crate::message::Message;

use parking_lot::{Condvar, Mutex};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) type ReplyCallback = Box<dyn FnOnce(Result<Message>) + Send + 'static>;

/// A one-shot slot a blocked caller waits on.
#[derive(Default)]
pub(crate) struct ReplySlot {
    result: Mutex<Option<Result<Message>>>,
    filled: Condvar,
}

impl ReplySlot {
    pub(crate) fn fulfill(&self, result: Result<Message>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
        }
        self.filled.notify_all();
    }

    /// Takes the result, waiting at most until `deadline`.
    pub(crate) fn wait_until(&self, deadline: Option<Instant>) -> Option<Result<Message>> {
        let mut slot = self.result.lock();
        while slot.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.filled.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
                None => self.filled.wait(&mut slot),
            }
        }
        slot.take()
    }

    pub(crate) fn is_filled(&self) -> bool {
        self.result.lock().is_some()
    }
}

pub(crate) enum Waiter {
    Slot(Arc<ReplySlot>),
    Callback(ReplyCallback),
}

impl Waiter {
    /// Completes a waiter that has been removed from the table.
    pub(crate) fn complete(self, result: Result<Message>) {
        match self {
            Waiter::Slot(slot) => slot.fulfill(result),
            Waiter::Callback(callback) => callback(result),
        }
    }
}

#[derive(Default)]
struct Table {
    waiters: HashMap<u32, Waiter>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    pub(crate) fn insert(&self, serial: u32, waiter: Waiter) -> Result<()> {
        let mut table = self.table.lock();
        if table.closed {
            return Err(Error::Disconnected);
        }
        table.waiters.insert(serial, waiter);
        Ok(())
    }

    pub(crate) fn take(&self, serial: u32) -> Option<Waiter> {
        self.table.lock().waiters.remove(&serial)
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().waiters.len()
    }

    /// Refuses further calls and hands back everyone still waiting.
    pub(crate) fn close(&self) -> Vec<Waiter> {
        let mut table = self.table.lock();
        table.closed = true;
        table.waiters.drain().map(|(_, waiter)| waiter).collect()
    }
}

/// Handle on a call whose reply arrives later.
pub struct PendingReply {
    serial: u32,
    slot: Arc<ReplySlot>,
    calls: Arc<PendingCalls>,
}

impl PendingReply {
    pub(crate) fn new(serial: u32, slot: Arc<ReplySlot>, calls: Arc<PendingCalls>) -> Self {
        PendingReply {
            serial,
            slot,
            calls,
        }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn is_ready(&self) -> bool {
        self.slot.is_filled()
    }

    /// Blocks for the reply. An error reply comes back as
    /// [`Error::Remote`]; running out of time gives [`Error::CallTimeout`]
    /// and forgets the call.
    pub fn wait(self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now().checked_add(timeout);
        if let Some(result) = self.slot.wait_until(deadline) {
            return result;
        }
        if self.calls.take(self.serial).is_some() {
            return Err(Error::CallTimeout {
                serial: self.serial,
                timeout,
            });
        }
        // The reply won the race and is being delivered right now.
        self.slot.wait_until(None).unwrap_or(Err(Error::Disconnected))
    }
}

#[cfg(test)]
mod tests {
    use super::{PendingCalls, PendingReply, ReplySlot, Waiter};
    use crate::error::{Error, Result};
    use crate::message::Message;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use test_log::test;

    #[test]
    fn fulfilled_from_another_thread() -> Result<()> {
        let calls = Arc::new(PendingCalls::default());
        let slot = Arc::new(ReplySlot::default());
        calls.insert(7, Waiter::Slot(slot.clone()))?;
        let pending = PendingReply::new(7, slot, calls.clone());
        let mut call = Message::method_call(None, "/", None, "Ping")?;
        call.serial = 7;
        let reply = Message::method_return(&call);
        let deliver = {
            let calls = calls.clone();
            let reply = reply.clone();
            thread::spawn(move || {
                if let Some(waiter) = calls.take(7) {
                    waiter.complete(Ok(reply));
                }
            })
        };
        assert_eq!(pending.wait(Duration::from_secs(5))?, reply);
        deliver.join().expect("delivery thread panicked");
        assert_eq!(calls.len(), 0);
        Ok(())
    }

    #[test]
    fn timeout_forgets_call() -> Result<()> {
        let calls = Arc::new(PendingCalls::default());
        let slot = Arc::new(ReplySlot::default());
        calls.insert(1, Waiter::Slot(slot.clone()))?;
        let pending = PendingReply::new(1, slot, calls.clone());
        match pending.wait(Duration::from_millis(20)) {
            Err(Error::CallTimeout { serial: 1, .. }) => (),
            other => panic!("unexpected {:?}", other),
        }
        assert!(calls.take(1).is_none());
        Ok(())
    }

    #[test]
    fn close_fails_everyone() -> Result<()> {
        let calls = PendingCalls::default();
        let slot = Arc::new(ReplySlot::default());
        calls.insert(1, Waiter::Slot(slot.clone()))?;
        for waiter in calls.close() {
            waiter.complete(Err(Error::Disconnected));
        }
        assert!(matches!(slot.wait_until(None), Some(Err(Error::Disconnected))));
        assert!(matches!(
            calls.insert(2, Waiter::Slot(Arc::new(ReplySlot::default()))),
            Err(Error::Disconnected)
        ));
        Ok(())
    }
}
