use crate::transport::{Link, LinkError, Result};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Default)]
struct FakeState {
    closed: bool,
    fail_sends: bool,
    sent: Vec<String>,
    pings: usize,
    terminated: bool,
}

/// In-memory link recording everything the registry hands it.
#[derive(Clone, Default)]
pub(crate) struct FakeLink {
    state: Rc<RefCell<FakeState>>,
}

impl FakeLink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.state.borrow().sent.clone()
    }

    pub(crate) fn clear(&self) {
        self.state.borrow_mut().sent.clear();
    }

    pub(crate) fn pings(&self) -> usize {
        self.state.borrow().pings
    }

    pub(crate) fn terminated(&self) -> bool {
        self.state.borrow().terminated
    }

    pub(crate) fn close(&self) {
        self.state.borrow_mut().closed = true;
    }

    pub(crate) fn fail_sends(&self) {
        self.state.borrow_mut().fail_sends = true;
    }
}

impl Link for FakeLink {
    fn is_open(&self) -> bool {
        !self.state.borrow().closed
    }

    fn send_text(&self, text: String) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(LinkError::Closed);
        }
        if state.fail_sends {
            return Err(LinkError::Other("send refused".into()));
        }
        state.sent.push(text);
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(LinkError::Closed);
        }
        state.pings += 1;
        Ok(())
    }

    fn terminate(&self) {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.terminated = true;
    }
}
