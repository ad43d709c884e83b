//! Individually locked cells shared between the fleet manager and one station task.

use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Clone the current value out of the cell without holding the lock afterwards.
pub fn snapshot<T: Clone>(cell: &Shared<T>) -> T {
    cell.lock().clone()
}
