mod core;
mod handle;
mod poller;
mod queue;
mod table;

pub use self::core::{PeriodicItem, Reactor, ReactorStats};
pub use self::handle::ReactorHandle;
pub use self::poller::{EV_ERR, EV_HUP, EV_IN, EV_OUT};
pub use self::table::ArmHandle;

use std::time::Duration;

/// Wall-clock budget for one cooperative drain of the remote task queue.
pub const TASK_DRAIN_BUDGET: Duration = Duration::from_micros(500);

/// Blocked producers are signalled after this many tasks of an ongoing
/// drain, so they can refill the queue while it is being unloaded.
pub const TASK_NOTIFY_QUANTUM: u32 = 32;

/// Completions fetched from the kernel per wait call.
pub const EV_BATCH_SIZE: usize = 128;

/// Idle loop iterations before the reactor considers parking.
pub const MAX_SPIN_LIMIT: u32 = 5;

/// Starting capacity of the completion table.
pub const INIT_TABLE_CAPACITY: usize = 512;

/// Default bound of the remote task queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// user_data of the wake channel; dispatch drops it without decoding.
pub const IGNORE_INDEX: u64 = 0;

/// First user_data value that maps to a completion-table handle. The range
/// `(IGNORE_INDEX, USER_DATA_CB_INDEX)` is reserved and never armed.
pub const USER_DATA_CB_INDEX: u64 = 1024;
