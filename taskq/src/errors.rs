/// Errors returned by task operations on a queue.
///
/// None of these are fatal: the queue state is left consistent and the caller
/// decides what to do with the outcome.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// The task was already pending and the caller asked for uniqueness with
    /// `EnqueueFlags::FAIL_IF_PENDING`.
    #[error("task is already pending")]
    AlreadyExists,

    /// A cancellation of the running task is in flight and the caller asked
    /// for strictness with `EnqueueFlags::FAIL_IF_CANCELING`.
    #[error("task is being canceled")]
    Canceled,

    /// `cancel` found the task running. The running invocation is not
    /// interrupted. `pending` is the number of queued requests that were
    /// removed alongside.
    #[error("task is running, removed {pending} pending request(s)")]
    Busy { pending: u16 },

    /// A delayed enqueue was ignored because the timed task is being drained.
    #[error("delayed enqueue dropped, drain in progress")]
    Dropped,

    /// A timed task bound to one queue was used with another queue.
    #[error("timed task is bound to a different queue")]
    QueueMismatch,
}

impl TaskError {
    /// Pending requests removed by the failed `cancel`, if any.
    pub fn pending(&self) -> Option<u16> {
        match self {
            TaskError::Busy { pending } => Some(*pending),
            _ => None,
        }
    }
}
