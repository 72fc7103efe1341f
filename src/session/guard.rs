//! Scoped release of session resources.
//!
//! Each resource is wrapped on acquisition. Releasing is explicit during an
//! orderly close and automatic on drop, so an early return or a panic while
//! releasing one resource still releases the rest. A guard releases at most
//! once.

use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};

use crate::error::VoiceResult;

pub struct Guarded<T> {
    name: &'static str,
    inner: T,
    release_fn: fn(&mut T) -> VoiceResult<()>,
    released: bool,
}

impl<T> Guarded<T> {
    pub fn new(name: &'static str, inner: T, release_fn: fn(&mut T) -> VoiceResult<()>) -> Self {
        Self {
            name,
            inner,
            release_fn,
            released: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release now. Errors are logged, not returned: the caller always
    /// continues with the next resource.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        debug!("Releasing {}", self.name);
        if let Err(e) = (self.release_fn)(&mut self.inner) {
            warn!("Failed to release {}: {}", self.name, e);
        }
    }

    /// Mark as released without running the release function, for
    /// resources that were shut down through another path
    pub fn disarm(&mut self) {
        self.released = true;
    }
}

impl<T> Deref for Guarded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for Guarded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for Guarded<T> {
    fn drop(&mut self) {
        self.release();
    }
}
