// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest notification handles used by the transports.
//!
//! How an interrupt actually reaches the guest (an eventfd, an irqfd, a
//! hypervisor call) is up to the embedder; transports only see these two
//! handle types.

use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;

/// An edge-triggered signal to the guest, such as an MSI-X vector.
#[derive(Clone)]
pub struct Interrupt {
    inner: Option<Arc<dyn Send + Sync + Fn()>>,
}

impl Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(if self.inner.is_some() { "Fn" } else { "Null" })
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::null()
    }
}

impl Interrupt {
    /// An interrupt that does nothing.
    pub fn null() -> Self {
        Self { inner: None }
    }

    /// Creates an interrupt from a function.
    ///
    /// The function will be called when [`Self::deliver`] is called.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: 'static + Send + Sync + Fn(),
    {
        Self {
            inner: Some(Arc::new(f)),
        }
    }

    /// Delivers the interrupt.
    pub fn deliver(&self) {
        if let Some(f) = &self.inner {
            f();
        }
    }
}

/// A level-triggered interrupt line, such as PCI INTx or the interrupt wired
/// to an MMIO device.
///
/// Only transitions are forwarded to the target.
pub struct LineInterrupt {
    debug_label: Arc<str>,
    is_high: Mutex<bool>,
    target: Option<Arc<dyn Send + Sync + Fn(bool)>>,
}

impl Debug for LineInterrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineInterrupt")
            .field("debug_label", &self.debug_label)
            .field("is_high", &*self.is_high.lock())
            .finish()
    }
}

impl LineInterrupt {
    /// Creates a line that is not connected to anything.
    pub fn detached() -> Self {
        Self {
            debug_label: "detached".into(),
            is_high: Mutex::new(false),
            target: None,
        }
    }

    /// Creates a line that calls `f` with the new level on every transition.
    pub fn from_fn<F>(debug_label: impl Into<Arc<str>>, f: F) -> Self
    where
        F: 'static + Send + Sync + Fn(bool),
    {
        Self {
            debug_label: debug_label.into(),
            is_high: Mutex::new(false),
            target: Some(Arc::new(f)),
        }
    }

    /// Sets the line level.
    pub fn set_level(&self, high: bool) {
        let mut is_high = self.is_high.lock();
        if *is_high == high {
            return;
        }
        *is_high = high;
        tracing::trace!(line = %self.debug_label, high, "line level");
        if let Some(target) = &self.target {
            target(high);
        }
    }

    /// Returns the current line level.
    pub fn is_high(&self) -> bool {
        *self.is_high.lock()
    }
}

impl Drop for LineInterrupt {
    fn drop(&mut self) {
        self.set_level(false);
    }
}
