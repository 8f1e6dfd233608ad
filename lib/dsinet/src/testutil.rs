//! Helpers shared by the unit tests: an in-memory channel capturing sends
//! and replaying prepared bytes on receive.

use crate::channel::{Channel, Transport};
use crate::error::{ErrorType, NetError, NetResult};
use dsibase::wire::{EventInfo, MessageHeader, EVENT_INFO_SIZE, HEADER_SIZE};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

pub struct MockChannel {
    sent: RefCell<Vec<u8>>,
    rx: RefCell<Vec<u8>>,
}

impl MockChannel {
    pub fn new() -> Rc<MockChannel> {
        Rc::new(MockChannel {
            sent: RefCell::new(Vec::new()),
            rx: RefCell::new(Vec::new()),
        })
    }

    /// All bytes sent since the last call.
    pub fn take_sent(&self) -> Vec<u8> {
        std::mem::replace(&mut *self.sent.borrow_mut(), Vec::new())
    }

    /// Queue bytes to be returned by subsequent receives.
    pub fn feed(&self, data: &[u8]) {
        self.rx.borrow_mut().extend_from_slice(data);
    }

    /// Header of the first captured message.
    pub fn header(sent: &[u8]) -> MessageHeader {
        let mut buf = [0u8; HEADER_SIZE];
        buf.copy_from_slice(&sent[..HEADER_SIZE]);
        MessageHeader::decode(&buf)
    }

    /// Event info of the first captured data message.
    pub fn event_info(sent: &[u8]) -> EventInfo {
        let mut buf = [0u8; EVENT_INFO_SIZE];
        buf.copy_from_slice(&sent[HEADER_SIZE..HEADER_SIZE + EVENT_INFO_SIZE]);
        EventInfo::decode(&buf)
    }
}

impl Channel for MockChannel {
    fn is_open(&self) -> bool {
        true
    }

    fn transport(&self) -> Transport {
        Transport::Local
    }

    fn fd(&self) -> RawFd {
        -1
    }

    fn send_all(&self, data: &[u8]) -> NetResult<()> {
        self.sent.borrow_mut().extend_from_slice(data);
        Ok(())
    }

    fn send_vectored(&self, parts: &[&[u8]]) -> NetResult<()> {
        for part in parts {
            self.sent.borrow_mut().extend_from_slice(part);
        }
        Ok(())
    }

    fn recv_all(&self, buf: &mut [u8]) -> NetResult<()> {
        let mut rx = self.rx.borrow_mut();

        if rx.len() < buf.len() {
            return Err(NetError::Fatal(ErrorType::ChannelClosed));
        }

        buf.copy_from_slice(&rx[..buf.len()]);
        rx.drain(..buf.len());
        Ok(())
    }

    fn close(&self) {}
}
