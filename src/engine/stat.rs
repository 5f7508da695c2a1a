use std::cell::Cell;

/// Resource and progress counters shared by the pool, the batches and the
/// drain loop of one engine.
#[derive(Default)]
pub struct CopyStat {
    slots_allocated: Cell<u64>,
    slots_released: Cell<u64>,
    requests_built: Cell<u64>,
    requests_released: Cell<u64>,
    submitted: Cell<u64>,
    completed: Cell<u64>,
    wait_calls: Cell<u64>,
    bytes_written: Cell<u64>,
}

fn bump(cell: &Cell<u64>, n: u64) {
    cell.set(cell.get() + n);
}

impl CopyStat {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_slot_allocated(&self) {
        bump(&self.slots_allocated, 1);
    }

    pub(crate) fn add_slot_released(&self) {
        bump(&self.slots_released, 1);
    }

    pub(crate) fn add_requests_built(&self, n: usize) {
        bump(&self.requests_built, n as u64);
    }

    pub(crate) fn add_requests_released(&self, n: usize) {
        bump(&self.requests_released, n as u64);
    }

    pub(crate) fn add_submitted(&self, n: usize) {
        bump(&self.submitted, n as u64);
    }

    pub(crate) fn add_completed(&self, n: usize) {
        bump(&self.completed, n as u64);
    }

    pub(crate) fn add_wait_call(&self) {
        bump(&self.wait_calls, 1);
    }

    pub(crate) fn add_bytes_written(&self, n: usize) {
        bump(&self.bytes_written, n as u64);
    }

    pub fn slots_allocated(&self) -> u64 {
        self.slots_allocated.get()
    }

    pub fn slots_released(&self) -> u64 {
        self.slots_released.get()
    }

    pub fn requests_built(&self) -> u64 {
        self.requests_built.get()
    }

    pub fn requests_released(&self) -> u64 {
        self.requests_released.get()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.get()
    }

    pub fn completed(&self) -> u64 {
        self.completed.get()
    }

    pub fn wait_calls(&self) -> u64 {
        self.wait_calls.get()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.get()
    }

    /// `true` when every slot and request descriptor handed out has been
    /// released exactly once.
    pub fn is_balanced(&self) -> bool {
        self.slots_allocated.get() == self.slots_released.get()
            && self.requests_built.get() == self.requests_released.get()
    }
}

impl std::fmt::Debug for CopyStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyStat")
            .field("slots_allocated", &self.slots_allocated.get())
            .field("slots_released", &self.slots_released.get())
            .field("requests_built", &self.requests_built.get())
            .field("requests_released", &self.requests_released.get())
            .field("submitted", &self.submitted.get())
            .field("completed", &self.completed.get())
            .field("wait_calls", &self.wait_calls.get())
            .field("bytes_written", &self.bytes_written.get())
            .finish()
    }
}
