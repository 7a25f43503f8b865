use std::{
    fmt::Display,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    libc,
    poll::{poll, PollFd, PollFlags},
};
use tracing::{debug, debug_span, error, trace};

use crate::{
    collections::DynArray,
    device::{Device, Outcome, State},
    endpoint::Interest,
    error::Error,
};

/// Identifies a device for as long as it is in a [`Selector`].
/// Unlike an index, an id is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What came of a single pass of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// No device was live, so there was nothing to wait for.
    Idle,

    /// Waited, then handled this many ready descriptors.
    /// Zero if the wait timed out.
    Events(usize),
}

#[derive(Debug)]
struct Slot {
    id: DeviceId,
    device: Device,
}

/// Owns devices and drives them by waiting for their descriptors to become ready.
///
/// Devices keep their index for as long as the selector lives.
/// The exception is connections which have gone [`State::Inactive`]:
/// a newly accepted connection may take over their slot.
#[derive(Debug, Default)]
pub struct Selector {
    slots: DynArray<Slot>,
    next_id: u64,
}

fn poll_flags(interest: Interest) -> PollFlags {
    let mut flags = PollFlags::empty();
    if interest.read {
        flags |= PollFlags::POLLIN | PollFlags::POLLPRI;
    }
    if interest.write {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

// Milliseconds for poll(2), where -1 waits forever. Rounds up so a deadline is not missed.
fn poll_timeout(timeout: Option<Duration>, deadline: Option<Instant>) -> libc::c_int {
    let until_deadline = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));

    let wait = match (timeout, until_deadline) {
        (Some(timeout), Some(until_deadline)) => Some(timeout.min(until_deadline)),
        (timeout, until_deadline) => timeout.or(until_deadline),
    };

    match wait {
        None => -1,
        Some(wait) => {
            let millis = (wait.as_micros() + 999) / 1000;
            libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
        }
    }
}

impl Selector {
    /// An empty selector.
    pub fn new() -> Self {
        Self::default()
    }

    fn new_id(&mut self) -> DeviceId {
        let id = DeviceId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Add a device at the end.
    /// It is opened on the next pass.
    pub fn add(&mut self, device: Device) -> Result<DeviceId, Error> {
        let id = self.new_id();
        debug!(%id, %device, index = self.slots.len(), "Adding device");
        self.slots.append(Slot { id, device })?;

        Ok(id)
    }

    // Accepted connections go in the first spent connection slot, if any.
    fn place(&mut self, device: Device) -> Result<DeviceId, Error> {
        let spent = self
            .slots
            .iter()
            .position(|slot| slot.device.is_connection() && slot.device.state() == State::Inactive);

        match spent {
            Some(index) => {
                let id = self.new_id();
                debug!(%id, %device, index, "Reusing slot");
                self.slots.put(Slot { id, device }, index)?;
                Ok(id)
            }
            None => self.add(device),
        }
    }

    /// Number of devices, spent ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if there are no devices.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The device at `index`.
    pub fn device(&self, index: usize) -> Result<&Device, Error> {
        self.slots.get(index).map(|slot| &slot.device)
    }

    /// The device at `index`, mutably.
    pub fn device_mut(&mut self, index: usize) -> Result<&mut Device, Error> {
        self.slots.get_mut(index).map(|slot| &mut slot.device)
    }

    /// Where the device with the given id is.
    pub fn index_of(&self, id: DeviceId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    /// The id of the device at `index`.
    pub fn id_at(&self, index: usize) -> Result<DeviceId, Error> {
        self.slots.get(index).map(|slot| slot.id)
    }

    /// The device with the given id.
    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.slots
            .iter()
            .find(|slot| slot.id == id)
            .map(|slot| &slot.device)
    }

    /// The device with the given id, mutably.
    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.slots
            .iter_mut()
            .find(|slot| slot.id == id)
            .map(|slot| &mut slot.device)
    }

    /// All devices, in order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.slots.iter().map(|slot| &slot.device)
    }

    /// All devices in order, mutably.
    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.slots.iter_mut().map(|slot| &mut slot.device)
    }

    /// Run one pass of the loop.
    ///
    /// Every device is prepared (which opens or finishes closing devices as needed),
    /// then we wait up to `timeout` for any live descriptor to become ready,
    /// `None` meaning no limit.
    /// The wait is cut short if a device has paced output due sooner.
    ///
    /// Ready devices are handled in order, for each one reading before writing
    /// before looking at error conditions.
    /// Connections accepted during the pass are added at the end of it.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<Pass, Error> {
        let mut watched = Vec::with_capacity(self.slots.len());
        let mut fds = Vec::with_capacity(self.slots.len());
        let mut deadline: Option<Instant> = None;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some((fd, interest)) = slot.device.prepare() {
                fds.push(PollFd::new(fd, poll_flags(interest)));
                watched.push((index, slot.id));
            }

            if let Some(due) = slot.device.deadline() {
                deadline = Some(deadline.map_or(due, |earliest| earliest.min(due)));
            }
        }

        if fds.is_empty() {
            debug!("No live devices");
            return Ok(Pass::Idle);
        }

        let wait = poll_timeout(timeout, deadline);
        trace!(descriptors = fds.len(), wait, "Waiting");

        let mut remaining = match poll(&mut fds, wait) {
            Ok(ready) => usize::try_from(ready).unwrap_or_default(),
            Err(Errno::EINTR) => {
                debug!("Wait interrupted");
                return Err(Error::SelectorWait(Errno::EINTR));
            }
            Err(e) => {
                error!(error = %e, "Waiting for devices failed");
                return Err(Error::SelectorWait(e));
            }
        };

        let mut handled = 0;
        let mut spawned = vec![];

        for (pollfd, (index, id)) in fds.iter().zip(&watched) {
            if remaining == 0 {
                break;
            }

            let Some(revents) = pollfd.revents().filter(|revents| !revents.is_empty()) else {
                continue;
            };
            remaining -= 1;

            let slot = self.slots.get_mut(*index)?;
            if slot.id != *id {
                continue;
            }
            handled += 1;

            let device = &mut slot.device;
            let _span = debug_span!("device", %id).entered();
            trace!(?revents, "Ready");

            let mut outcomes = vec![];
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) {
                outcomes.push(device.handle_read());
            }
            if revents.contains(PollFlags::POLLOUT) {
                outcomes.push(device.handle_write());
            }
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL)
                || (revents.contains(PollFlags::POLLHUP) && !revents.contains(PollFlags::POLLIN))
            {
                outcomes.push(device.handle_except());
            }

            spawned.extend(outcomes.into_iter().filter_map(|outcome| match outcome {
                Outcome::Spawn(device) => Some(device),
                _ => None,
            }));
        }

        for device in spawned {
            self.place(*device)?;
        }

        Ok(Pass::Events(handled))
    }

    /// Close every device for good.
    pub fn shutdown(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.device.retire();
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
