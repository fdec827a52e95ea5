//! Clock abstractions used by the protocol state machine.
use crate::net::LocalTime;
use std::sync::{Arc, Mutex};

/// Clock that tells the time.
pub trait Clock: Clone {
    /// Tell the time in local time.
    fn local_time(&self) -> LocalTime;
}

/// A clock whose owner may move it forward.
///
/// The transport reactor sets the time on every loop iteration; tests set it
/// by hand.
pub trait AdjustableClock: Clock {
    /// Set the local time.
    fn set(&mut self, local_time: LocalTime);
}

/// Clock with interior mutability.
#[derive(Debug, Clone)]
pub struct RefClock<T: Clock> {
    inner: Arc<Mutex<T>>,
}

impl<T: Clock> std::ops::Deref for RefClock<T> {
    type Target = Arc<Mutex<T>>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: Clock> From<T> for RefClock<T> {
    fn from(other: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(other)),
        }
    }
}

impl<T: Clock> Clock for RefClock<T> {
    fn local_time(&self) -> LocalTime {
        self.inner.lock().unwrap().local_time()
    }
}

impl AdjustableClock for RefClock<LocalTime> {
    fn set(&mut self, local_time: LocalTime) {
        *self.inner.lock().unwrap() = local_time;
    }
}

impl Clock for LocalTime {
    fn local_time(&self) -> LocalTime {
        *self
    }
}
