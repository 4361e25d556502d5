// SPDX-License-Identifier: Apache-2.0
//! Fixed-capacity result buffer shared across policy controllers, the
//! scheduler, and the logger manager.
//!
//! Each declared channel is a contiguous memory-mapped region of
//! `capacity` rows; a slot index addresses one row across every channel at
//! once. A small refcount mask per slot tracks which registrants (loggers,
//! policy controllers) still hold a reference; a slot returns to the free
//! list only once every registered bit has cleared.

#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use threedb_proto::{ChannelSchema, DeclaredOutputs, ElementType, SlotIndex};

/// How long `allocate` waits on the release queue between free-list checks.
const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors raised by [`ResultBuffer`] operations.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// More than 8 registrants attempted to register.
    #[error("buffer already has the maximum of 8 registrants")]
    TooManyRegistrations,
    /// `free` was called with a registrant id outside `1..=8`.
    #[error("registrant id {0} is outside the valid 1..=8 range")]
    InvalidRegistrant(i16),
    /// An operation referenced a channel not present in the declared schema.
    #[error("channel {0:?} is not part of the declared schema")]
    UnknownChannel(String),
    /// A write's byte length didn't match the declared channel schema.
    #[error("payload for channel {0:?} does not match its declared shape/dtype")]
    DtypeMismatch(String),
    /// `decl` was attempted with a schema differing from the one already set.
    #[error("declared schema does not match the buffer's existing schema")]
    SchemaMismatch,
    /// An operation other than `declare` ran before the schema was set.
    #[error("buffer schema has not been declared yet")]
    NotDeclared,
    /// The buffer was closed while a caller was still waiting on it.
    #[error("buffer is closed")]
    Closed,
}

/// One release event posted by `free`.
///
/// `mask: None` is a force-release (used by the scheduler to drop a
/// duplicate result's slot regardless of who still holds it); `mask:
/// Some(bit)` clears exactly that registrant's bit.
struct ReleaseEvent {
    slot: SlotIndex,
    mask: Option<u8>,
}

struct ChannelStore {
    schema: ChannelSchema,
    mmap: Mutex<MmapMut>,
}

impl ChannelStore {
    fn new(schema: ChannelSchema, capacity: usize) -> std::io::Result<Self> {
        let total_len = schema.byte_len() * capacity;
        let mmap = MmapMut::map_anon(total_len.max(1))?;
        Ok(Self {
            schema,
            mmap: Mutex::new(mmap),
        })
    }

    fn row_range(&self, slot: SlotIndex) -> std::ops::Range<usize> {
        let stride = self.schema.byte_len();
        let start = stride * slot as usize;
        start..start + stride
    }

    fn write_row(&self, slot: SlotIndex, bytes: &[u8]) {
        let range = self.row_range(slot);
        self.mmap.lock()[range].copy_from_slice(bytes);
    }

    fn read_row(&self, slot: SlotIndex) -> Vec<u8> {
        let range = self.row_range(slot);
        self.mmap.lock()[range].to_vec()
    }
}

/// A decoded tensor view returned by [`ResultBuffer::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorView {
    /// Shape of this channel's row, as declared.
    pub shape: Vec<usize>,
    /// Element type of this channel's row, as declared.
    pub dtype: ElementType,
    /// Raw row bytes.
    pub bytes: Vec<u8>,
}

/// Fixed-capacity, shared-memory, refcounted slot table.
pub struct ResultBuffer {
    capacity: usize,
    channels: RwLock<Option<BTreeMap<String, ChannelStore>>>,
    refcounts: Vec<AtomicU8>,
    free_list: Mutex<std::collections::VecDeque<SlotIndex>>,
    registrant_count: Mutex<u8>,
    full_mask: AtomicU8,
    release_tx: Sender<ReleaseEvent>,
    release_rx: Receiver<ReleaseEvent>,
    valid_renders: AtomicU32,
    total_renders: AtomicU32,
}

impl ResultBuffer {
    /// Creates a buffer with `capacity` slots and no declared schema yet.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let free_list = (0..capacity as SlotIndex).collect();
        Self {
            capacity,
            channels: RwLock::new(None),
            refcounts: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
            free_list: Mutex::new(free_list),
            registrant_count: Mutex::new(0),
            full_mask: AtomicU8::new(0),
            release_tx,
            release_rx,
            valid_renders: AtomicU32::new(0),
            total_renders: AtomicU32::new(0),
        }
    }

    /// Fixed slot capacity of this buffer.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of distinct result pushes that were accepted and logged.
    #[must_use]
    pub fn valid_renders(&self) -> u32 {
        self.valid_renders.load(Ordering::Relaxed)
    }

    /// Number of result pushes observed, including duplicates.
    #[must_use]
    pub fn total_renders(&self) -> u32 {
        self.total_renders.load(Ordering::Relaxed)
    }

    /// Records one accepted, distinct result.
    pub fn record_valid_render(&self) {
        self.valid_renders.fetch_add(1, Ordering::Relaxed);
        self.total_renders.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one duplicate (force-freed) result.
    pub fn record_duplicate_render(&self) {
        self.total_renders.fetch_add(1, Ordering::Relaxed);
    }

    /// Idempotently sets the buffer's channel schema.
    ///
    /// The first call wins; subsequent calls must supply a byte-for-byte
    /// identical schema or the attempt is rejected.
    pub fn declare(&self, schema: &DeclaredOutputs) -> Result<(), BufferError> {
        let mut channels = self.channels.write();
        if let Some(existing) = channels.as_ref() {
            let existing_schema: DeclaredOutputs = existing
                .iter()
                .map(|(name, store)| (name.clone(), store.schema.clone()))
                .collect();
            return if &existing_schema == schema {
                Ok(())
            } else {
                tracing::warn!("rejecting decl: schema does not match the buffer's committed schema");
                Err(BufferError::SchemaMismatch)
            };
        }

        let mut built = BTreeMap::new();
        for (name, channel_schema) in schema {
            let store = ChannelStore::new(channel_schema.clone(), self.capacity)
                .map_err(|_| BufferError::DtypeMismatch(name.clone()))?;
            built.insert(name.clone(), store);
        }
        *channels = Some(built);
        tracing::info!(channels = schema.len(), capacity = self.capacity, "buffer schema declared");
        Ok(())
    }

    /// `true` once [`Self::declare`] has successfully committed a schema.
    #[must_use]
    pub fn is_declared(&self) -> bool {
        self.channels.read().is_some()
    }

    /// Registers a new consumer (logger, policy controller), returning its
    /// registrant id in `1..=8`.
    pub fn register(&self) -> Result<u8, BufferError> {
        let mut count = self.registrant_count.lock();
        if *count >= 8 {
            return Err(BufferError::TooManyRegistrations);
        }
        *count += 1;
        let id = *count;
        self.full_mask.fetch_or(registrant_bit(id)?, Ordering::SeqCst);
        Ok(id)
    }

    /// Writes `data` into a free slot and marks it held by every registrant.
    ///
    /// Blocks (draining the release queue) until a slot is available,
    /// implementing backpressure when the buffer is at capacity.
    pub fn allocate(&self, data: &BTreeMap<String, Vec<u8>>) -> Result<SlotIndex, BufferError> {
        let guard = self.channels.read();
        let channels = guard.as_ref().ok_or(BufferError::NotDeclared)?;

        for (name, store) in channels {
            let bytes = data
                .get(name)
                .ok_or_else(|| BufferError::UnknownChannel(name.clone()))?;
            if bytes.len() != store.schema.byte_len() {
                return Err(BufferError::DtypeMismatch(name.clone()));
            }
        }

        let slot = self.next_free_slot()?;
        for (name, store) in channels {
            store.write_row(slot, &data[name]);
        }

        let full_mask = self.full_mask.load(Ordering::SeqCst);
        self.refcounts[slot as usize].store(full_mask, Ordering::SeqCst);
        Ok(slot)
    }

    /// Reads every declared channel's row at `slot`.
    pub fn read(&self, slot: SlotIndex) -> Result<BTreeMap<String, TensorView>, BufferError> {
        let guard = self.channels.read();
        let channels = guard.as_ref().ok_or(BufferError::NotDeclared)?;
        Ok(channels
            .iter()
            .map(|(name, store)| {
                (
                    name.clone(),
                    TensorView {
                        shape: store.schema.shape.clone(),
                        dtype: store.schema.dtype,
                        bytes: store.read_row(slot),
                    },
                )
            })
            .collect())
    }

    /// Releases one registrant's hold on `slot`.
    ///
    /// `registrant == -1` force-releases the slot regardless of who still
    /// holds it, used by the scheduler to drop a duplicate result.
    pub fn free(&self, slot: SlotIndex, registrant: i16) -> Result<(), BufferError> {
        let mask = if registrant < 0 {
            None
        } else {
            Some(registrant_bit(registrant)?)
        };
        self.release_tx
            .send(ReleaseEvent { slot, mask })
            .map_err(|_| BufferError::Closed)
    }

    /// Drops the buffer's declared channels, releasing the backing memory.
    pub fn close(&self) {
        *self.channels.write() = None;
    }

    fn next_free_slot(&self) -> Result<SlotIndex, BufferError> {
        loop {
            self.drain_release_events();
            if let Some(idx) = self.free_list.lock().pop_front() {
                return Ok(idx);
            }
            match self.release_rx.recv_timeout(RELEASE_POLL_INTERVAL) {
                Ok(event) => self.apply_release_event(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(BufferError::Closed),
            }
        }
    }

    fn drain_release_events(&self) {
        while let Ok(event) = self.release_rx.try_recv() {
            self.apply_release_event(event);
        }
    }

    fn apply_release_event(&self, event: ReleaseEvent) {
        let counter = &self.refcounts[event.slot as usize];
        let remaining = match event.mask {
            None => {
                counter.store(0, Ordering::SeqCst);
                0
            }
            Some(bit) => counter.fetch_xor(bit, Ordering::SeqCst) & !bit,
        };
        if remaining == 0 {
            self.free_list.lock().push_back(event.slot);
        }
    }
}

fn registrant_bit(id: i16) -> Result<u8, BufferError> {
    if (1..=8).contains(&id) {
        Ok(1u8 << (id - 1))
    } else {
        Err(BufferError::InvalidRegistrant(id))
    }
}
