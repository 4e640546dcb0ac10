// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A virtio device: a set of queues bound to one transport.

use crate::iovec::InOutIov;
use crate::iovec::IoVec;
use crate::queue::QueueError;
use crate::queue::QueueParams;
use crate::queue::UsedRecord;
use crate::queue::VirtQueue;
use crate::spec::VIRTIO_DEVICE_NEEDS_RESET;
use crate::transport::BindError;
use crate::transport::DeviceIds;
use crate::transport::Transport;
use crate::transport::TransportKind;
use crate::transport::TransportResources;
use crate::transport::VirtioTransport;
use guestmem::GuestMemory;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("queue {0} does not exist")]
    NoSuchQueue(u16),
    #[error("device already has the maximum of {0} queues")]
    TooManyQueues(u16),
    #[error("queue {queue} error")]
    Queue {
        queue: u16,
        #[source]
        source: QueueError,
    },
    #[error("device is not bound to a transport")]
    NotBound,
    #[error("device needs reset")]
    NeedsReset,
}

#[derive(Debug)]
pub struct VirtioDevice {
    name: Arc<str>,
    features: u64,
    max_queues: u16,
    mem: GuestMemory,
    queues: Vec<VirtQueue>,
    transport: Option<VirtioTransport>,
    status: u32,
}

/// Reports a malformed chain as a device error: the device asks the driver
/// to reset it and raises a config change interrupt.
fn report_malformed(
    name: &str,
    transport: Option<&VirtioTransport>,
    status: &mut u32,
    queue: u16,
    err: QueueError,
) -> DeviceError {
    tracelimit::error_ratelimited!(
        device = name,
        queue,
        error = &err as &dyn std::error::Error,
        "malformed descriptor chain"
    );
    *status |= VIRTIO_DEVICE_NEEDS_RESET;
    if let Some(transport) = transport {
        transport.signal_config();
    }
    DeviceError::Queue { queue, source: err }
}

impl VirtioDevice {
    pub fn new(
        name: impl Into<Arc<str>>,
        features: u64,
        max_queues: u16,
        mem: GuestMemory,
    ) -> Self {
        Self {
            name: name.into(),
            features,
            max_queues,
            mem,
            queues: Vec::new(),
            transport: None,
            status: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.mem
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    /// Handles a driver write of the device status. `NEEDS_RESET` is owned by
    /// the device and only a reset clears it.
    pub fn set_status(&mut self, status: u32) {
        if status == 0 {
            self.reset();
        } else {
            self.status = status | (self.status & VIRTIO_DEVICE_NEEDS_RESET);
        }
    }

    pub fn needs_reset(&self) -> bool {
        self.status & VIRTIO_DEVICE_NEEDS_RESET != 0
    }

    pub fn transport(&self) -> Option<&VirtioTransport> {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut VirtioTransport> {
        self.transport.as_mut()
    }

    pub fn queue_count(&self) -> u16 {
        self.queues.len() as u16
    }

    pub fn queue(&self, queue: u16) -> Result<&VirtQueue, DeviceError> {
        self.queues
            .get(queue as usize)
            .ok_or(DeviceError::NoSuchQueue(queue))
    }

    pub fn queue_mut(&mut self, queue: u16) -> Result<&mut VirtQueue, DeviceError> {
        self.queues
            .get_mut(queue as usize)
            .ok_or(DeviceError::NoSuchQueue(queue))
    }

    /// Builds the next queue from the parameters the driver programmed and
    /// returns its index.
    pub fn add_queue(&mut self, params: QueueParams) -> Result<u16, DeviceError> {
        let index = self.queue_count();
        if index >= self.max_queues {
            return Err(DeviceError::TooManyQueues(self.max_queues));
        }
        let queue = VirtQueue::new(self.features, &self.mem, params)
            .map_err(|source| DeviceError::Queue { queue: index, source })?;
        self.queues.push(queue);
        Ok(index)
    }

    /// Binds the device to a transport and initializes it.
    ///
    /// Transport state is fully built before it is installed, so on failure
    /// the device is unchanged.
    pub fn bind(
        &mut self,
        kind: TransportKind,
        ids: DeviceIds,
        resources: TransportResources,
    ) -> Result<(), BindError> {
        if self.transport.is_some() {
            return Err(BindError::AlreadyBound);
        }
        let transport = VirtioTransport::new(kind, ids, resources, self.max_queues)?;
        tracing::info!(device = %self.name, transport = %kind, "binding virtio device");
        self.transport.insert(transport).init();
        Ok(())
    }

    /// Resets the device: the transport is quiesced and reinitialized, all
    /// queues are dropped and the status is cleared.
    pub fn reset(&mut self) {
        tracing::debug!(device = %self.name, "reset");
        if let Some(transport) = &mut self.transport {
            transport.exit();
        }
        self.queues.clear();
        self.status = 0;
        if let Some(transport) = &mut self.transport {
            transport.init();
        }
    }

    fn check_ready(&self) -> Result<(), DeviceError> {
        if self.needs_reset() {
            return Err(DeviceError::NeedsReset);
        }
        Ok(())
    }

    /// Pops and walks the next chain of `queue`. Returns `None` if the ring is
    /// empty.
    pub fn get_iov(&mut self, queue: u16) -> Result<Option<(u16, IoVec<'_>)>, DeviceError> {
        self.check_ready()?;
        let Self {
            name,
            mem,
            queues,
            transport,
            status,
            ..
        } = self;
        let q = queues
            .get_mut(queue as usize)
            .ok_or(DeviceError::NoSuchQueue(queue))?;
        match q.get_iov(mem) {
            Ok(r) => Ok(Some(r)),
            Err(QueueError::Empty) => Ok(None),
            Err(err) if err.is_guest_error() => {
                Err(report_malformed(name, transport.as_ref(), status, queue, err))
            }
            Err(source) => Err(DeviceError::Queue { queue, source }),
        }
    }

    /// As [`Self::get_iov`], with guest-relative naming of the buffers.
    pub fn get_inout_iov(
        &mut self,
        queue: u16,
    ) -> Result<Option<(u16, InOutIov<'_>)>, DeviceError> {
        Ok(self
            .get_iov(queue)?
            .map(|(head, iov)| (head, InOutIov::from(iov))))
    }

    /// Walks the chain at `head` of `queue` without popping it. An out of
    /// range `head` is the caller's mistake and does not mark the device as
    /// needing reset.
    pub fn get_head_iov(&mut self, queue: u16, head: u16) -> Result<IoVec<'_>, DeviceError> {
        self.check_ready()?;
        let Self {
            name,
            mem,
            queues,
            transport,
            status,
            ..
        } = self;
        let q = queues
            .get(queue as usize)
            .ok_or(DeviceError::NoSuchQueue(queue))?;
        if head >= q.size() {
            return Err(DeviceError::Queue {
                queue,
                source: QueueError::InvalidHead {
                    index: head,
                    size: q.size(),
                },
            });
        }
        q.get_head_iov(mem, head).map_err(|err| {
            if err.is_guest_error() {
                report_malformed(name, transport.as_ref(), status, queue, err)
            } else {
                DeviceError::Queue { queue, source: err }
            }
        })
    }

    pub fn post_used(
        &mut self,
        queue: u16,
        head: u16,
        len: u32,
    ) -> Result<UsedRecord, DeviceError> {
        self.check_ready()?;
        self.queue_mut(queue)?
            .post_used(head, len)
            .map_err(|source| DeviceError::Queue { queue, source })
    }

    pub fn should_signal(&mut self, queue: u16) -> Result<bool, DeviceError> {
        self.check_ready()?;
        self.queue_mut(queue)?
            .should_signal()
            .map_err(|source| DeviceError::Queue { queue, source })
    }

    /// Publishes the completion of chain `head` and interrupts the guest if
    /// it asked to be.
    pub fn complete(&mut self, queue: u16, head: u16, len: u32) -> Result<UsedRecord, DeviceError> {
        self.check_ready()?;
        if self.transport.is_none() {
            return Err(DeviceError::NotBound);
        }
        let record = self.post_used(queue, head, len)?;
        if self.should_signal(queue)? {
            if let Some(transport) = &self.transport {
                transport.signal_queue(queue);
            }
        }
        Ok(record)
    }

    /// Pops the next chain of `queue`, passes its buffers to `f` and
    /// completes it with the number of bytes `f` returns. Returns false if
    /// the ring was empty.
    pub fn process_next<F>(&mut self, queue: u16, f: F) -> Result<bool, DeviceError>
    where
        F: FnOnce(u16, &IoVec<'_>) -> u32,
    {
        self.check_ready()?;
        if self.transport.is_none() {
            return Err(DeviceError::NotBound);
        }
        let (head, len) = match self.get_iov(queue)? {
            Some((head, iov)) => (head, f(head, &iov)),
            None => return Ok(false),
        };
        self.complete(queue, head, len)?;
        Ok(true)
    }
}

impl Drop for VirtioDevice {
    fn drop(&mut self) {
        if let Some(transport) = &mut self.transport {
            transport.exit();
        }
    }
}
