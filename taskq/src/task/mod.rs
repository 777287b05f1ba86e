// Public API
pub mod id;
pub use self::id::Id;

pub(crate) mod task;
pub use self::task::{MAX_PENDING, MAX_PRIORITY, Task, TaskFlags};

pub(crate) mod timed;
pub use self::timed::TimedTask;
