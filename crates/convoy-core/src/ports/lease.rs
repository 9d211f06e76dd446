//! Liveness lease (wake lock) port.
//!
//! The scheduler holds a lease while there is work pending or in flight. A
//! lease expires on its own unless renewed, so a wedged task cannot keep the
//! process awake forever; long-running tasks renew it through
//! `TaskContext::heartbeat`.

pub trait LeaseProvider: Send + Sync {
    fn acquire(&self, why: &str) -> Box<dyn Lease>;
}

pub trait Lease: Send + Sync {
    /// Push the expiry out by another full timeout.
    fn renew(&self, why: &str);

    fn is_expired(&self) -> bool;

    fn release(self: Box<Self>, why: &str);
}
