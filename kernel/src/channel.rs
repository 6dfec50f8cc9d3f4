//! Bidirectional byte-stream channels.
//!
//! A channel is a pair of endpoints. Writing on one endpoint appends to the
//! peer's buffer; reading consumes from one's own. Endpoints are owned by
//! tasks, transferable, and referenced from user space by opaque handles
//! resolved against the kernel-global table below, never by pointers.

use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::InterruptGuard;
use crate::tasks::task::TaskId;
use crate::trace;

/// Opaque endpoint handle: pair slot and side. Zero is never valid.
pub type EndpointHandle = u32;

/// Buffers start out this big and grow as writes demand.
pub const INITIAL_CAPACITY: usize = 8;

pub struct Endpoint {
    /// Handle of the other end; `None` once this end has been closed.
    peer: Option<EndpointHandle>,
    buffer: Vec<u8>,
    owner: TaskId,
}

impl Endpoint {
    fn new(peer: EndpointHandle, owner: TaskId) -> Endpoint {
        Endpoint {
            peer: Some(peer),
            buffer: Vec::with_capacity(INITIAL_CAPACITY),
            owner,
        }
    }
}

struct Pair {
    ends: [Endpoint; 2],
}

/// Outcome of a read request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadResult {
    /// The requested bytes were copied out and consumed.
    Complete,
    /// Fewer bytes than requested are buffered; nothing was consumed.
    Short(usize),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InvalidHandle;

static CHANNELS: Mutex<ChannelTable> = Mutex::new(ChannelTable::new());

pub struct ChannelTable {
    pairs: Vec<Option<Pair>>,
}

impl ChannelTable {
    pub const fn new() -> Self {
        ChannelTable { pairs: Vec::new() }
    }

    fn handle(slot: usize, side: usize) -> EndpointHandle {
        ((slot << 1) | side) as EndpointHandle + 1
    }

    fn resolve(handle: EndpointHandle) -> Option<(usize, usize)> {
        let raw = (handle as usize).checked_sub(1)?;
        Some((raw >> 1, raw & 1))
    }

    fn endpoint(&self, handle: EndpointHandle) -> Result<&Endpoint, InvalidHandle> {
        let (slot, side) = Self::resolve(handle).ok_or(InvalidHandle)?;
        self.pairs
            .get(slot)
            .and_then(|p| p.as_ref())
            .map(|p| &p.ends[side])
            .ok_or(InvalidHandle)
    }

    fn endpoint_mut(&mut self, handle: EndpointHandle) -> Result<&mut Endpoint, InvalidHandle> {
        let (slot, side) = Self::resolve(handle).ok_or(InvalidHandle)?;
        self.pairs
            .get_mut(slot)
            .and_then(|p| p.as_mut())
            .map(|p| &mut p.ends[side])
            .ok_or(InvalidHandle)
    }

    fn create(&mut self, owner: TaskId) -> (EndpointHandle, EndpointHandle) {
        let slot = self
            .pairs
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.pairs.push(None);
                self.pairs.len() - 1
            });
        let end1 = Self::handle(slot, 0);
        let end2 = Self::handle(slot, 1);
        self.pairs[slot] = Some(Pair {
            ends: [Endpoint::new(end2, owner), Endpoint::new(end1, owner)],
        });
        (end1, end2)
    }

    fn write(&mut self, handle: EndpointHandle, data: &[u8]) -> Result<(), InvalidHandle> {
        let Some(peer) = self.endpoint(handle)?.peer else {
            // The reader hung up; the write evaporates by design.
            trace!("write on closed endpoint {} dropped", handle);
            return Ok(());
        };
        let peer_end = self.endpoint_mut(peer).expect("peer endpoint vanished");
        peer_end.buffer.extend_from_slice(data);
        Ok(())
    }

    fn read(&mut self, handle: EndpointHandle, dst: &mut [u8]) -> Result<ReadResult, InvalidHandle> {
        let end = self.endpoint_mut(handle)?;
        if end.buffer.len() < dst.len() {
            return Ok(ReadResult::Short(end.buffer.len()));
        }
        dst.copy_from_slice(&end.buffer[..dst.len()]);
        end.buffer.drain(..dst.len());
        Ok(ReadResult::Complete)
    }

    /// Close one end. Returns true when this call destroyed the channel,
    /// i.e. the other end was already closed. Closing twice is a no-op.
    fn close(&mut self, handle: EndpointHandle) -> Result<bool, InvalidHandle> {
        let (slot, side) = Self::resolve(handle).ok_or(InvalidHandle)?;
        let pair = self
            .pairs
            .get_mut(slot)
            .and_then(|p| p.as_mut())
            .ok_or(InvalidHandle)?;

        if pair.ends[side].peer.is_none() {
            return Ok(false);
        }
        pair.ends[side].peer = None;

        if pair.ends[side ^ 1].peer.is_none() {
            self.pairs[slot] = None;
            return Ok(true);
        }
        Ok(false)
    }

    fn transfer_owner(&mut self, handle: EndpointHandle, new_owner: TaskId) -> Result<(), InvalidHandle> {
        self.endpoint_mut(handle)?.owner = new_owner;
        Ok(())
    }

    /// Close every endpoint the task owns, as task destruction demands.
    fn close_owned_by(&mut self, owner: TaskId) {
        for slot in 0..self.pairs.len() {
            for side in 0..2 {
                let owned = self.pairs[slot]
                    .as_ref()
                    .is_some_and(|p| p.ends[side].owner == owner);
                if owned {
                    let _ = self.close(Self::handle(slot, side));
                }
            }
        }
    }

    fn live_channels(&self) -> usize {
        self.pairs.iter().filter(|p| p.is_some()).count()
    }

    /// Buffered byte count on an endpoint.
    fn available(&self, handle: EndpointHandle) -> Result<usize, InvalidHandle> {
        Ok(self.endpoint(handle)?.buffer.len())
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        ChannelTable::new()
    }
}

/// Create an endpoint pair, both ends owned by `owner`.
pub fn create(owner: TaskId) -> (EndpointHandle, EndpointHandle) {
    let _guard = InterruptGuard::new();
    CHANNELS.lock().create(owner)
}

/// Append `data` to the peer's buffer; silently dropped when this end is
/// closed.
pub fn write(handle: EndpointHandle, data: &[u8]) -> Result<(), InvalidHandle> {
    let _guard = InterruptGuard::new();
    CHANNELS.lock().write(handle, data)
}

/// Copy exactly `dst.len()` bytes out of this end's buffer, or report how
/// many are available without consuming anything.
pub fn read(handle: EndpointHandle, dst: &mut [u8]) -> Result<ReadResult, InvalidHandle> {
    let _guard = InterruptGuard::new();
    CHANNELS.lock().read(handle, dst)
}

pub fn close(handle: EndpointHandle) -> Result<bool, InvalidHandle> {
    let _guard = InterruptGuard::new();
    CHANNELS.lock().close(handle)
}

pub fn transfer_owner(handle: EndpointHandle, new_owner: TaskId) -> Result<(), InvalidHandle> {
    let _guard = InterruptGuard::new();
    CHANNELS.lock().transfer_owner(handle, new_owner)
}

pub fn owner(handle: EndpointHandle) -> Result<TaskId, InvalidHandle> {
    let _guard = InterruptGuard::new();
    CHANNELS.lock().endpoint(handle).map(|e| e.owner)
}

pub fn available(handle: EndpointHandle) -> Result<usize, InvalidHandle> {
    let _guard = InterruptGuard::new();
    CHANNELS.lock().available(handle)
}

pub fn close_owned_by(owner: TaskId) {
    let _guard = InterruptGuard::new();
    CHANNELS.lock().close_owned_by(owner)
}

pub fn live_channels() -> usize {
    CHANNELS.lock().live_channels()
}

/// Drop every channel. Explicit teardown for tests and shutdown.
pub fn teardown() {
    let _guard = InterruptGuard::new();
    CHANNELS.lock().pairs.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::lock_kernel_state;
    use std::sync::MutexGuard;

    fn fresh() -> (MutexGuard<'static, ()>, EndpointHandle, EndpointHandle) {
        let guard = lock_kernel_state();
        teardown();
        let (h1, h2) = create(1);
        (guard, h1, h2)
    }

    #[test]
    fn endpoints_are_cross_linked() {
        let (_guard, h1, h2) = fresh();
        let table = CHANNELS.lock();
        assert_eq!(table.endpoint(h1).unwrap().peer, Some(h2));
        assert_eq!(table.endpoint(h2).unwrap().peer, Some(h1));
    }

    #[test]
    fn write_reaches_the_peer_in_order() {
        let (_guard, h1, h2) = fresh();
        write(h1, b"hello").unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(read(h2, &mut buf), Ok(ReadResult::Complete));
        assert_eq!(&buf, b"hello");

        // Nothing buffered on the writer's own end.
        let mut small = [0u8; 3];
        assert_eq!(read(h1, &mut small), Ok(ReadResult::Short(0)));

        write(h2, b"hi").unwrap();
        let mut reply = [0u8; 2];
        assert_eq!(read(h1, &mut reply), Ok(ReadResult::Complete));
        assert_eq!(&reply, b"hi");
    }

    #[test]
    fn short_read_consumes_nothing() {
        let (_guard, h1, h2) = fresh();
        write(h1, b"abc").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(read(h2, &mut buf), Ok(ReadResult::Short(3)));

        let mut exact = [0u8; 3];
        assert_eq!(read(h2, &mut exact), Ok(ReadResult::Complete));
        assert_eq!(&exact, b"abc");
    }

    #[test]
    fn partial_reads_shift_the_front() {
        let (_guard, h1, h2) = fresh();
        write(h1, b"abcdef").unwrap();

        let mut first = [0u8; 2];
        assert_eq!(read(h2, &mut first), Ok(ReadResult::Complete));
        assert_eq!(&first, b"ab");

        let mut rest = [0u8; 4];
        assert_eq!(read(h2, &mut rest), Ok(ReadResult::Complete));
        assert_eq!(&rest, b"cdef");
    }

    #[test]
    fn write_after_own_close_is_dropped() {
        let (_guard, h1, h2) = fresh();
        assert_eq!(close(h1), Ok(false));
        assert_eq!(write(h1, b"gone"), Ok(()));
        assert_eq!(available(h2), Ok(0));
    }

    #[test]
    fn close_is_idempotent_and_destroys_on_second_end() {
        let (_guard, h1, h2) = fresh();
        assert_eq!(close(h1), Ok(false));
        assert_eq!(close(h1), Ok(false));
        assert_eq!(live_channels(), 1);
        assert_eq!(close(h2), Ok(true));
        assert_eq!(live_channels(), 0);
        assert_eq!(close(h2), Err(InvalidHandle));
    }

    #[test]
    fn transfer_moves_ownership_only() {
        let (_guard, h1, h2) = fresh();
        transfer_owner(h2, 7).unwrap();
        assert_eq!(owner(h1), Ok(1));
        assert_eq!(owner(h2), Ok(7));
        // The peer link is untouched.
        write(h1, b"x").unwrap();
        assert_eq!(available(h2), Ok(1));
    }

    #[test]
    fn task_cleanup_closes_owned_ends() {
        let (_guard, h1, h2) = fresh();
        transfer_owner(h2, 9).unwrap();
        close_owned_by(1);
        // Only one side closed; channel alive until the other end goes.
        assert_eq!(live_channels(), 1);
        close_owned_by(9);
        assert_eq!(live_channels(), 0);
        let _ = (h1, h2);
    }

    #[test]
    fn cleanup_destroys_channels_fully_owned_by_the_task() {
        let _guard = lock_kernel_state();
        teardown();
        let (_h1, _h2) = create(4);
        close_owned_by(4);
        assert_eq!(live_channels(), 0);
    }
}
