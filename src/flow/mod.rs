//! Block flow control for the device's bulk transfer.
//!
//! The device streams its telemetry buffer in blocks and pauses after each
//! one with `WAIT_ACK:<id>` until the host answers `ACK:BLOCK_<id>`. The
//! final `END` is answered with the sentinel block id.

use crate::model::BlockId;
use crate::protocol::Command;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FlowState {
    #[default]
    Idle,
    /// Transfer in progress, between blocks.
    Draining,
    AwaitingBlockAck(BlockId),
}

#[derive(Debug, Default)]
pub struct BlockFlow {
    state: FlowState,
    blocks_acked: u64,
}

impl BlockFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn blocks_acked(&self) -> u64 {
        self.blocks_acked
    }

    pub fn begin_transfer(&mut self) {
        self.state = FlowState::Draining;
    }

    /// Returns the acknowledgment to write before the next line is handled.
    /// Applies whether or not a transfer is active.
    pub fn on_block_wait(&mut self, block: BlockId) -> Command {
        self.state = FlowState::AwaitingBlockAck(block.clone());
        Command::AckBlock(block)
    }

    /// The acknowledgment has been handed to the transport. Confirmation is
    /// not awaited here since the device paces the transfer.
    pub fn ack_issued(&mut self, transfer_active: bool) {
        if let FlowState::AwaitingBlockAck(_) = self.state {
            self.blocks_acked += 1;
        }
        self.state = if transfer_active {
            FlowState::Draining
        } else {
            FlowState::Idle
        };
    }

    pub fn on_end_of_stream(&mut self) -> Command {
        self.state = FlowState::Idle;
        Command::AckBlock(BlockId::sentinel())
    }

    pub fn abort(&mut self) {
        self.state = FlowState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_wait_produces_matching_ack() {
        let mut flow = BlockFlow::new();
        flow.begin_transfer();
        assert_eq!(*flow.state(), FlowState::Draining);

        let ack = flow.on_block_wait(BlockId::new("3"));
        assert_eq!(ack.encode(), "ACK:BLOCK_3");
        assert_eq!(
            *flow.state(),
            FlowState::AwaitingBlockAck(BlockId::new("3"))
        );

        flow.ack_issued(true);
        assert_eq!(*flow.state(), FlowState::Draining);
        assert_eq!(flow.blocks_acked(), 1);
    }

    #[test]
    fn block_wait_outside_transfer_returns_to_idle() {
        let mut flow = BlockFlow::new();
        assert_eq!(flow.on_block_wait(BlockId::new("7")).encode(), "ACK:BLOCK_7");
        flow.ack_issued(false);
        assert_eq!(*flow.state(), FlowState::Idle);
    }

    #[test]
    fn end_of_stream_acks_sentinel_from_any_state() {
        let mut flow = BlockFlow::new();
        assert_eq!(flow.on_end_of_stream().encode(), "ACK:BLOCK_9999");
        assert_eq!(*flow.state(), FlowState::Idle);

        flow.begin_transfer();
        flow.on_block_wait(BlockId::new("1"));
        assert_eq!(flow.on_end_of_stream(), Command::AckBlock(BlockId::sentinel()));
        assert_eq!(*flow.state(), FlowState::Idle);
    }

    #[test]
    fn ack_echoes_the_id_text_unchanged() {
        let mut flow = BlockFlow::new();
        assert_eq!(
            flow.on_block_wait(BlockId::new("007")).encode(),
            "ACK:BLOCK_007"
        );
        assert_eq!(
            flow.on_block_wait(BlockId::new("abc")).encode(),
            "ACK:BLOCK_abc"
        );
    }

    #[test]
    fn abort_resets_to_idle() {
        let mut flow = BlockFlow::new();
        flow.begin_transfer();
        flow.on_block_wait(BlockId::new("2"));
        flow.abort();
        assert_eq!(*flow.state(), FlowState::Idle);
        assert_eq!(flow.blocks_acked(), 0);
    }
}
