use thiserror::Error;

use crate::domain::{AccountId, TaskType};

#[derive(Debug, Error)]
pub enum ConvoyError {
    #[error("no implementation for task_type={task_type} account={account_id:?}")]
    UnknownTaskType {
        task_type: TaskType,
        account_id: Option<AccountId>,
    },

    #[error("account {0} has not been brought up")]
    UnknownAccount(AccountId),

    #[error("{op} is not legal in context state {state}")]
    IllegalTransition {
        op: &'static str,
        state: &'static str,
    },

    #[error("finish_task called twice for {0}")]
    AlreadyFinishing(String),

    #[error("task_type={0} does not implement consult")]
    NoConsult(TaskType),

    #[error(
        "task_type={task_type} was dispatched as {dispatched} but is implemented as {implemented}"
    )]
    KindMismatch {
        task_type: TaskType,
        dispatched: &'static str,
        implemented: &'static str,
    },

    #[error("store: {0}")]
    Store(String),

    #[error("task implementation failed: {0}")]
    Implementation(String),

    #[error("task implementation panicked: {0}")]
    Panicked(String),

    #[error("state codec: {0}")]
    StateCodec(#[from] serde_json::Error),

    #[error("scheduler shut down before the result was available")]
    Shutdown,

    #[error("could not persist scheduled tasks: {0}")]
    Persist(String),
}

impl ConvoyError {
    pub fn implementation(msg: impl Into<String>) -> Self {
        ConvoyError::Implementation(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        ConvoyError::Store(msg.into())
    }
}
