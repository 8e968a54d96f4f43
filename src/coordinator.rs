use std::time::Duration;

use crate::oplog::OpTime;

/// Replica member state, as far as the applier needs to observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Startup,
    Primary,
    Secondary,
    Recovering,
    Rollback,
}

impl MemberState {
    pub fn is_primary(&self) -> bool {
        matches!(self, MemberState::Primary)
    }

    pub fn is_secondary(&self) -> bool {
        matches!(self, MemberState::Secondary)
    }

    pub fn is_recovering(&self) -> bool {
        matches!(self, MemberState::Recovering)
    }
}

/// Replication-coordinator surface consumed by the applier. The coordinator
/// owns its own synchronization; the op-time setters are forward-only.
pub trait ReplicationCoordinator: Send + Sync {
    fn set_my_last_applied_op_time_forward(&self, op_time: OpTime);
    fn set_my_last_durable_op_time_forward(&self, op_time: OpTime);
    fn get_my_last_applied_op_time(&self) -> OpTime;
    fn get_member_state(&self) -> MemberState;
    fn in_maintenance_mode(&self) -> bool;
    /// Returns false when the transition was refused.
    fn set_follower_mode(&self, state: MemberState) -> bool;
    fn is_waiting_for_applier_to_drain(&self) -> bool;
    fn signal_drain_complete(&self);
    fn is_catching_up(&self) -> bool;
    /// Configured lag behind the primary; zero disables the filter.
    fn slave_delay(&self) -> Duration;
}
