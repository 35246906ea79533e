#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ARRAY_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Device locator: a string-tagged backend class plus a device id.
///
/// Two contexts address the same device exactly when their `device_key`s
/// are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    array_class: String,
    device_id: String,
}

impl Context {
    #[must_use]
    pub fn new(array_class: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            array_class: array_class.into(),
            device_id: device_id.into(),
        }
    }

    #[must_use]
    pub fn array_class(&self) -> &str {
        &self.array_class
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn device_key(&self) -> (&str, &str) {
        (&self.array_class, &self.device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AsyncFlag {
    Async = 0,
    Unsafe = 1,
}

impl AsyncFlag {
    #[must_use]
    pub const fn bit(self) -> u8 {
        1u8 << (self as u8)
    }
}

/// Transfer flag bitset. `Async` queues the copy on the device transfer
/// stream; `Unsafe` skips defensive copies of overlapping transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AsyncFlagSet {
    bits: u8,
}

impl AsyncFlagSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    #[must_use]
    pub fn from_flags(flags: &[AsyncFlag]) -> Self {
        let mut out = Self::empty();
        for flag in flags {
            out.add(*flag);
        }
        out
    }

    pub fn add(&mut self, flag: AsyncFlag) {
        self.bits |= flag.bit();
    }

    #[must_use]
    pub const fn has(self, flag: AsyncFlag) -> bool {
        (self.bits & flag.bit()) != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayOp {
    Get,
    Cast,
    Clear,
}

/// Violation reported by an installed observer. The triggering array
/// operation is aborted before it mutates the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackViolation {
    PreclearedReuse,
    IdSpaceExhausted { limit: u32 },
}

impl fmt::Display for CallbackViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreclearedReuse => {
                write!(f, "re-get/cast of an array already dropped by preclear")
            }
            Self::IdSpaceExhausted { limit } => {
                write!(f, "synced array id space exhausted: limit={limit}")
            }
        }
    }
}

impl std::error::Error for CallbackViolation {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayError {
    NotMaterialized,
    SizeMismatch { expected: usize, actual: usize },
    Callback(CallbackViolation),
}

impl fmt::Display for ArrayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMaterialized => write!(f, "array has no materialized backing"),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "value count mismatch: expected={expected} actual={actual}")
            }
            Self::Callback(violation) => write!(f, "array callback violation: {violation}"),
        }
    }
}

impl std::error::Error for ArrayError {}

impl From<CallbackViolation> for ArrayError {
    fn from(value: CallbackViolation) -> Self {
        Self::Callback(value)
    }
}

/// Observer slot contract for array operations.
///
/// The observer is invoked before the operation mutates the array and may
/// veto it by returning a violation. Implementations must not perform
/// array operations of their own while installed; the slot is not
/// reentrant.
pub trait ArrayObserver {
    fn on_array_op(
        &mut self,
        array: &SyncedArray,
        op: ArrayOp,
        dtype: DType,
        ctx: &Context,
        write_only: bool,
    ) -> Result<(), CallbackViolation>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingTransfer {
    array_id: u64,
    bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
    pub completed: usize,
    pub peak_pending_bytes: usize,
}

/// The array subsystem: creates arrays, owns the single observer slot,
/// and models the per-device FIFO transfer streams that asynchronous
/// copies are queued on.
pub struct ArrayRuntime {
    observer: RefCell<Option<Rc<RefCell<dyn ArrayObserver>>>>,
    streams: RefCell<HashMap<(String, String), VecDeque<PendingTransfer>>>,
    stats: RefCell<TransferStats>,
    completed_log: RefCell<Vec<u64>>,
}

impl ArrayRuntime {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            observer: RefCell::new(None),
            streams: RefCell::new(HashMap::new()),
            stats: RefCell::new(TransferStats::default()),
            completed_log: RefCell::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn new_array(self: &Rc<Self>, size: usize, dtype: DType) -> SyncedArray {
        SyncedArray {
            state: Rc::new(RefCell::new(ArrayState {
                instance_id: NEXT_ARRAY_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
                size,
                dtype,
                data: Vec::new(),
                backings: Vec::new(),
                head: None,
            })),
            runtime: Rc::clone(self),
        }
    }

    /// Install `observer` into the slot. The slot holds one observer at a
    /// time; installing replaces any previous one.
    pub fn install_observer(&self, observer: Rc<RefCell<dyn ArrayObserver>>) {
        *self.observer.borrow_mut() = Some(observer);
    }

    pub fn uninstall_observer(&self) {
        *self.observer.borrow_mut() = None;
    }

    #[must_use]
    pub fn has_observer(&self) -> bool {
        self.observer.borrow().is_some()
    }

    /// Block until every queued transfer on `ctx`'s streams has completed.
    pub fn synchronize(&self, ctx: &Context) {
        let keys: Vec<(String, String)> = self
            .streams
            .borrow()
            .keys()
            .filter(|(a, b)| a == ctx.array_class() || b == ctx.array_class())
            .cloned()
            .collect();
        for key in keys {
            self.drain_stream(&key, None);
        }
    }

    #[must_use]
    pub fn pending_transfers(&self) -> usize {
        self.streams.borrow().values().map(VecDeque::len).sum()
    }

    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.streams
            .borrow()
            .values()
            .flatten()
            .map(|t| t.bytes)
            .sum()
    }

    #[must_use]
    pub fn stats(&self) -> TransferStats {
        *self.stats.borrow()
    }

    /// Instance ids of completed transfers, in completion order.
    #[must_use]
    pub fn completed_array_ids(&self) -> Vec<u64> {
        self.completed_log.borrow().clone()
    }

    fn notify(
        &self,
        array: &SyncedArray,
        op: ArrayOp,
        dtype: DType,
        ctx: &Context,
        write_only: bool,
    ) -> Result<(), ArrayError> {
        let observer = self.observer.borrow().clone();
        if let Some(observer) = observer {
            observer
                .borrow_mut()
                .on_array_op(array, op, dtype, ctx, write_only)
                .map_err(ArrayError::Callback)?;
        }
        Ok(())
    }

    fn enqueue_transfer(&self, src_class: &str, dst_class: &str, array_id: u64, bytes: usize) {
        let key = stream_key(src_class, dst_class);
        let mut streams = self.streams.borrow_mut();
        streams
            .entry(key)
            .or_default()
            .push_back(PendingTransfer { array_id, bytes });
        drop(streams);
        let pending = self.pending_bytes();
        let mut stats = self.stats.borrow_mut();
        if pending > stats.peak_pending_bytes {
            stats.peak_pending_bytes = pending;
        }
    }

    /// A synchronous copy serializes on the stream: everything queued
    /// before it completes first.
    fn join_pair(&self, src_class: &str, dst_class: &str) {
        self.drain_stream(&stream_key(src_class, dst_class), None);
    }

    /// Complete every queued transfer up to and including the last one
    /// referencing `array_id` on each stream (FIFO prefix).
    fn join_array(&self, array_id: u64) {
        let keys: Vec<(String, String)> = self.streams.borrow().keys().cloned().collect();
        for key in keys {
            let last = self
                .streams
                .borrow()
                .get(&key)
                .and_then(|q| q.iter().rposition(|t| t.array_id == array_id));
            if let Some(last) = last {
                self.drain_stream(&key, Some(last + 1));
            }
        }
    }

    fn drain_stream(&self, key: &(String, String), limit: Option<usize>) {
        let mut drained = Vec::new();
        {
            let mut streams = self.streams.borrow_mut();
            if let Some(queue) = streams.get_mut(key) {
                let n = limit.unwrap_or(queue.len()).min(queue.len());
                drained.extend(queue.drain(..n));
            }
        }
        let mut stats = self.stats.borrow_mut();
        let mut log = self.completed_log.borrow_mut();
        for transfer in drained {
            stats.completed += 1;
            log.push(transfer.array_id);
        }
    }

    fn count_immediate_transfer(&self, array_id: u64) {
        self.stats.borrow_mut().completed += 1;
        self.completed_log.borrow_mut().push(array_id);
    }
}

fn stream_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Backing {
    array_class: String,
    dtype: DType,
}

#[derive(Debug)]
struct ArrayState {
    instance_id: u64,
    size: usize,
    dtype: DType,
    data: Vec<f64>,
    backings: Vec<Backing>,
    head: Option<usize>,
}

/// Shared, lazily-materialized multi-device buffer.
///
/// Nothing is allocated until the first `get`/`cast`; the "head" backing
/// holds the authoritative copy, other backings are device mirrors kept
/// until a `cast` invalidates them.
#[derive(Clone)]
pub struct SyncedArray {
    state: Rc<RefCell<ArrayState>>,
    runtime: Rc<ArrayRuntime>,
}

/// Non-owning handle to a [`SyncedArray`]; `upgrade` fails once the array
/// has been dropped.
#[derive(Clone)]
pub struct WeakSyncedArray {
    state: Weak<RefCell<ArrayState>>,
    runtime: Weak<ArrayRuntime>,
}

impl WeakSyncedArray {
    #[must_use]
    pub fn upgrade(&self) -> Option<SyncedArray> {
        Some(SyncedArray {
            state: self.state.upgrade()?,
            runtime: self.runtime.upgrade()?,
        })
    }
}

impl SyncedArray {
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.state.borrow().instance_id
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.state.borrow().size
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.state.borrow().dtype
    }

    #[must_use]
    pub fn get_num_arrays(&self) -> usize {
        self.state.borrow().backings.len()
    }

    #[must_use]
    pub fn head_array_class(&self) -> Option<String> {
        let state = self.state.borrow();
        state
            .head
            .and_then(|i| state.backings.get(i))
            .map(|b| b.array_class.clone())
    }

    #[must_use]
    pub fn is_materialized_on(&self, ctx: &Context) -> bool {
        self.state
            .borrow()
            .backings
            .iter()
            .any(|b| b.array_class == ctx.array_class())
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakSyncedArray {
        WeakSyncedArray {
            state: Rc::downgrade(&self.state),
            runtime: Rc::downgrade(&self.runtime),
        }
    }

    #[must_use]
    pub fn same_array(&self, other: &SyncedArray) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    /// Ensure the array is present on `ctx` and readable as `dtype`. The
    /// head backing is unchanged; a missing mirror is filled by a copy
    /// from the head.
    pub fn get(&self, dtype: DType, ctx: &Context, flags: AsyncFlagSet) -> Result<(), ArrayError> {
        self.runtime.notify(self, ArrayOp::Get, dtype, ctx, false)?;
        if !flags.has(AsyncFlag::Async) {
            self.runtime.join_array(self.instance_id());
        }
        let (needs_copy, src_class, bytes) = {
            let mut state = self.state.borrow_mut();
            if state.head.is_none() {
                let size = state.size;
                state.data = vec![0.0; size];
                state.backings.push(Backing {
                    array_class: ctx.array_class().to_string(),
                    dtype,
                });
                state.head = Some(0);
                state.dtype = dtype;
                return Ok(());
            }
            let present = state
                .backings
                .iter()
                .any(|b| b.array_class == ctx.array_class() && b.dtype == dtype);
            if present {
                return Ok(());
            }
            let head_class = state
                .head
                .and_then(|i| state.backings.get(i))
                .map(|b| b.array_class.clone());
            state.backings.push(Backing {
                array_class: ctx.array_class().to_string(),
                dtype,
            });
            let bytes = state.size * dtype.size_of();
            match head_class {
                Some(src) if src != ctx.array_class() => (true, src, bytes),
                _ => (false, String::new(), 0),
            }
        };
        if needs_copy {
            if flags.has(AsyncFlag::Async) {
                self.runtime
                    .enqueue_transfer(&src_class, ctx.array_class(), self.instance_id(), bytes);
            } else {
                self.runtime.join_pair(&src_class, ctx.array_class());
                self.runtime.count_immediate_transfer(self.instance_id());
            }
        }
        Ok(())
    }

    /// Ensure the array is present on `ctx` as `dtype` and make that
    /// backing the head; every other backing is invalidated. With
    /// `write_only` no copy is issued, the destination is left
    /// uninitialized for the caller to fill.
    pub fn cast(
        &self,
        dtype: DType,
        ctx: &Context,
        write_only: bool,
        flags: AsyncFlagSet,
    ) -> Result<(), ArrayError> {
        self.runtime
            .notify(self, ArrayOp::Cast, dtype, ctx, write_only)?;
        if !flags.has(AsyncFlag::Async) {
            self.runtime.join_array(self.instance_id());
        }
        let (needs_copy, src_class, bytes) = {
            let mut state = self.state.borrow_mut();
            state.dtype = dtype;
            if state.head.is_none() {
                let size = state.size;
                state.data = vec![0.0; size];
                state.backings = vec![Backing {
                    array_class: ctx.array_class().to_string(),
                    dtype,
                }];
                state.head = Some(0);
                return Ok(());
            }
            let head_class = state
                .head
                .and_then(|i| state.backings.get(i))
                .map(|b| b.array_class.clone());
            let bytes = state.size * dtype.size_of();
            state.backings = vec![Backing {
                array_class: ctx.array_class().to_string(),
                dtype,
            }];
            state.head = Some(0);
            match head_class {
                Some(src) if src != ctx.array_class() && !write_only => (true, src, bytes),
                _ => (false, String::new(), 0),
            }
        };
        if needs_copy {
            if flags.has(AsyncFlag::Async) {
                self.runtime
                    .enqueue_transfer(&src_class, ctx.array_class(), self.instance_id(), bytes);
            } else {
                self.runtime.join_pair(&src_class, ctx.array_class());
                self.runtime.count_immediate_transfer(self.instance_id());
            }
        }
        Ok(())
    }

    /// Drop every backing. The next `get`/`cast` re-materializes lazily.
    pub fn clear(&self) -> Result<(), ArrayError> {
        // A clear targets no device; observers see a neutral context.
        let ctx = Context::new("", "");
        let dtype = self.dtype();
        self.runtime.notify(self, ArrayOp::Clear, dtype, &ctx, false)?;
        let mut state = self.state.borrow_mut();
        state.data.clear();
        state.backings.clear();
        state.head = None;
        Ok(())
    }

    /// Overwrite the logical contents through the head backing.
    pub fn store(&self, values: &[f64]) -> Result<(), ArrayError> {
        let mut state = self.state.borrow_mut();
        if state.head.is_none() {
            return Err(ArrayError::NotMaterialized);
        }
        if values.len() != state.size {
            return Err(ArrayError::SizeMismatch {
                expected: state.size,
                actual: values.len(),
            });
        }
        state.data.clear();
        state.data.extend_from_slice(values);
        Ok(())
    }

    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.state.borrow().data.clone()
    }
}
