//! The IPC hardware registers the kernel signals the guest through.

use std::collections::VecDeque;

use tracing::trace;

/// Interrupt-raising side of the IPC hardware.
///
/// The kernel only raises a new acknowledgement or reply interrupt while the interface reports
/// ready; otherwise the item stays queued until a later update.
pub trait IpcInterface {
    fn is_ready(&self) -> bool;
    fn generate_ack(&mut self, address: u32);
    fn generate_reply(&mut self, address: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxEvent {
    Ack(u32),
    Reply(u32),
}

/// Software model of the IPC registers.
///
/// In latched mode an interrupt stays pending until the guest calls [`Mailbox::acknowledge`],
/// which is how the hardware behaves. Auto-acknowledge mode treats every interrupt as consumed
/// immediately.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Mailbox {
    latched: bool,
    pending: Option<MailboxEvent>,
    history: VecDeque<MailboxEvent>,
}

const HISTORY_LIMIT: usize = 1024;

impl Mailbox {
    pub fn auto_ack() -> Self {
        Self::default()
    }

    pub fn latched() -> Self {
        Self {
            latched: true,
            ..Self::default()
        }
    }

    /// Guest-side acknowledgement of the pending interrupt.
    pub fn acknowledge(&mut self) -> Option<MailboxEvent> {
        self.pending.take()
    }

    pub fn pending(&self) -> Option<MailboxEvent> {
        self.pending
    }

    /// Interrupts raised so far, oldest first. Bounded.
    pub fn history(&self) -> impl Iterator<Item = &MailboxEvent> {
        self.history.iter()
    }

    pub fn take_history(&mut self) -> Vec<MailboxEvent> {
        self.history.drain(..).collect()
    }

    fn raise(&mut self, event: MailboxEvent) {
        trace!(?event, "ipc interrupt");
        if self.latched {
            self.pending = Some(event);
        }
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }
}

impl IpcInterface for Mailbox {
    fn is_ready(&self) -> bool {
        self.pending.is_none()
    }

    fn generate_ack(&mut self, address: u32) {
        self.raise(MailboxEvent::Ack(address));
    }

    fn generate_reply(&mut self, address: u32) {
        self.raise(MailboxEvent::Reply(address));
    }
}
