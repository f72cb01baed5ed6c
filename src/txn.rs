use crate::errors::CommandError;
use crate::protocol::command::Command;

/// Per-connection MULTI/EXEC/DISCARD buffer. While active, commands are
/// queued instead of executed; EXEC drains the queue in order.
#[derive(Default)]
pub struct TxnBuffer {
    active: bool,
    queued: Vec<(Command, Vec<String>)>,
}

impl TxnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn begin(&mut self) -> Result<(), CommandError> {
        if self.active {
            return Err(CommandError::NestedMulti);
        }
        self.active = true;
        self.queued.clear();
        Ok(())
    }

    pub fn push(&mut self, command: Command, params: Vec<String>) {
        self.queued.push((command, params));
    }

    /// EXEC: deactivates and hands back the queue for execution.
    pub fn take(&mut self) -> Result<Vec<(Command, Vec<String>)>, CommandError> {
        if !self.active {
            return Err(CommandError::ExecWithoutMulti);
        }
        self.active = false;
        Ok(std::mem::take(&mut self.queued))
    }

    pub fn discard(&mut self) -> Result<(), CommandError> {
        if !self.active {
            return Err(CommandError::DiscardWithoutMulti);
        }
        self.active = false;
        self.queued.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_accumulates_in_order() {
        let mut txn = TxnBuffer::new();
        txn.begin().unwrap();
        txn.push(Command::SET, vec!["a".to_string(), "1".to_string()]);
        txn.push(Command::INCR, vec!["a".to_string()]);
        let queued = txn.take().unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].0, Command::SET);
        assert_eq!(queued[1].0, Command::INCR);
        assert!(!txn.is_active());
    }

    #[test]
    fn exec_on_empty_queue_is_fine() {
        let mut txn = TxnBuffer::new();
        txn.begin().unwrap();
        assert!(txn.take().unwrap().is_empty());
    }

    #[test]
    fn exec_without_multi_is_rejected() {
        let mut txn = TxnBuffer::new();
        assert_eq!(txn.take(), Err(CommandError::ExecWithoutMulti));
    }

    #[test]
    fn discard_without_multi_is_rejected() {
        let mut txn = TxnBuffer::new();
        assert_eq!(txn.discard(), Err(CommandError::DiscardWithoutMulti));
    }

    #[test]
    fn discard_drops_the_queue() {
        let mut txn = TxnBuffer::new();
        txn.begin().unwrap();
        txn.push(Command::SET, vec!["a".to_string(), "1".to_string()]);
        txn.discard().unwrap();
        txn.begin().unwrap();
        assert!(txn.take().unwrap().is_empty());
    }

    #[test]
    fn nested_multi_is_rejected_and_keeps_the_queue() {
        let mut txn = TxnBuffer::new();
        txn.begin().unwrap();
        txn.push(Command::GET, vec!["a".to_string()]);
        assert_eq!(txn.begin(), Err(CommandError::NestedMulti));
        assert!(txn.is_active());
        assert_eq!(txn.take().unwrap().len(), 1);
    }
}
