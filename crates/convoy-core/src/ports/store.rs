//! Store port - the transactional record store tasks read and write.
//!
//! The store owns mutation exclusivity: `begin_mutate` takes write intent on
//! the requested records (snapshotting their pre-mutation values) and
//! `finish_mutate` commits and releases it. The scheduler only decides order.
//!
//! # Contract
//! - `read` is a non-exclusive batch lookup.
//! - `begin_mutate` may wait until competing write intents are released.
//! - `finish_mutate` is called exactly once per context, even for failed tasks
//!   (with empty data), and must release every intent taken by that context.
//! - `add_tasks` durably records freshly scheduled wrapped tasks.

use async_trait::async_trait;

use crate::context::ContextInfo;
use crate::domain::{ComplexStateRow, FinishData, FinishMeta, ReadRequest, ReadResults, WrappedTask};
use crate::error::ConvoyError;

/// Everything the scheduler needs from the store at startup.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub tasks: Vec<WrappedTask>,
    pub complex_states: Vec<ComplexStateRow>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load(&self) -> Result<PersistedState, ConvoyError>;

    async fn add_tasks(&self, tasks: &[WrappedTask]) -> Result<(), ConvoyError>;

    async fn read(
        &self,
        ctx: &ContextInfo,
        request: &ReadRequest,
    ) -> Result<ReadResults, ConvoyError>;

    async fn begin_mutate(
        &self,
        ctx: &ContextInfo,
        request: &ReadRequest,
    ) -> Result<ReadResults, ConvoyError>;

    async fn finish_mutate(
        &self,
        ctx: &ContextInfo,
        data: &FinishData,
        meta: &FinishMeta,
    ) -> Result<(), ConvoyError>;
}
