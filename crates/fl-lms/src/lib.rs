#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use fl_core::{
    ArrayError, ArrayObserver, ArrayOp, ArrayRuntime, AsyncFlag, AsyncFlagSet, CallbackViolation,
    Context, DType, SyncedArray, WeakSyncedArray,
};
use serde::{Deserialize, Serialize};

fn async_unsafe() -> AsyncFlagSet {
    AsyncFlagSet::from_flags(&[AsyncFlag::Async, AsyncFlag::Unsafe])
}

fn unsafe_only() -> AsyncFlagSet {
    AsyncFlagSet::from_flags(&[AsyncFlag::Unsafe])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecTag {
    GetCast,
    Clear,
}

const fn rec_tag(op: ArrayOp) -> RecTag {
    match op {
        ArrayOp::Get | ArrayOp::Cast => RecTag::GetCast,
        ArrayOp::Clear => RecTag::Clear,
    }
}

/// One recorded array access. Created by the recorder in the first
/// iteration, annotated by the planner, read by the executor afterwards.
struct RecType {
    tag: RecTag,
    synced_array_id: u32,
    sawptr: WeakSyncedArray,
    size: usize,
    dtype: DType,
    ctx: Context,
    preclear: bool,
    swapped_out: bool,
    no_need_swap_out: bool,
    swapped_out_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LmsError {
    OutOfDeviceMemory {
        function_index: usize,
        budget: usize,
    },
    UnsupportedArrayClass {
        array_class: String,
    },
    EmptyDoubleBuffer,
    MultiDeviceDoubleBuffer {
        batches: usize,
    },
    ExpiredDoubleBuffer,
    Array(ArrayError),
}

impl fmt::Display for LmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfDeviceMemory {
                function_index,
                budget,
            } => write!(
                f,
                "out of device memory: working set of function {function_index} exceeds the prefetch budget of {budget} bytes"
            ),
            Self::UnsupportedArrayClass { array_class } => {
                write!(f, "unsupported array class: {array_class}")
            }
            Self::EmptyDoubleBuffer => write!(f, "double buffered input is empty"),
            Self::MultiDeviceDoubleBuffer { batches } => {
                write!(
                    f,
                    "double buffering cannot deal with {batches} device batches"
                )
            }
            Self::ExpiredDoubleBuffer => {
                write!(f, "double buffered array expired before it was resolved")
            }
            Self::Array(error) => write!(f, "array operation failure: {error}"),
        }
    }
}

impl std::error::Error for LmsError {}

impl From<ArrayError> for LmsError {
    fn from(value: ArrayError) -> Self {
        Self::Array(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapEventKind {
    Policy,
    Plan,
    Iteration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapEvent {
    pub ts_unix_ms: u128,
    pub kind: SwapEventKind,
    pub summary: String,
}

/// Append-only record of scheduling decisions, for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapLedger {
    entries: Vec<SwapEvent>,
}

impl SwapLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: SwapEventKind, summary: impl Into<String>) {
        self.entries.push(SwapEvent {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[SwapEvent] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

/// Per-function slice of the built schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionPlan {
    pub function_index: usize,
    pub swap_in_count: usize,
    pub swap_out_count: usize,
    pub wait_count: usize,
    pub prefetch_bytes: usize,
}

/// Serializable summary of a built schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleReport {
    pub record_count: usize,
    pub function_count: usize,
    pub max_bytes_swap_in: usize,
    pub max_bytes_swap_out: usize,
    pub preclear_count: usize,
    pub functions: Vec<FunctionPlan>,
}

impl ScheduleReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// How many pending uses of each `(array id, dtype)` remain inside the
/// prefetched window during planning.
#[derive(Default)]
struct QueuedArrayCounts {
    per_array: HashMap<u32, HashMap<DType, i64>>,
}

impl QueuedArrayCounts {
    fn count(&self, id: u32, dtype: DType) -> i64 {
        self.per_array
            .get(&id)
            .and_then(|m| m.get(&dtype))
            .copied()
            .unwrap_or(0)
    }

    fn increment(&mut self, id: u32, dtype: DType) {
        *self.per_array.entry(id).or_default().entry(dtype).or_insert(0) += 1;
    }

    fn decrement(&mut self, id: u32, dtype: DType) {
        *self.per_array.entry(id).or_default().entry(dtype).or_insert(0) -= 1;
    }

    fn total(&self, id: u32) -> i64 {
        self.per_array
            .get(&id)
            .map_or(0, |m| m.values().copied().sum())
    }

    /// Byte footprint across every dtype the id was queued under.
    fn bytes_across_dtypes(&self, id: u32, size: usize) -> usize {
        self.per_array
            .get(&id)
            .map_or(0, |m| m.keys().map(|dt| size * dt.size_of()).sum())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObserverMode {
    Record,
    Trace,
}

struct SchedulerInner {
    runtime: Rc<ArrayRuntime>,
    host_ctx: Context,
    device_ctx: Context,
    max_bytes_swap_in: usize,
    max_bytes_swap_out: usize,

    mode: ObserverMode,
    first_iter: bool,
    scheduled: bool,
    iter_count: usize,

    order: Vec<RecType>,
    func_block_ends: Vec<usize>,
    order_idx: usize,
    func_idx: usize,
    tail: usize,
    used_bytes_swap_out: usize,

    id_map: HashMap<u64, u32>,
    order_idx_by_id: HashMap<u32, Vec<usize>>,
    wrong_ordered: Vec<RecType>,
    precleared: HashMap<u64, bool>,
    swapped_out_flag: HashMap<u32, bool>,
    swapped_out_rec: HashMap<u32, usize>,

    swap_in_plan: Vec<Vec<usize>>,
    swap_out_plan: Vec<Vec<usize>>,
    wait_plan: Vec<Vec<usize>>,

    dali_handles: [[Option<WeakSyncedArray>; 2]; 2],
    dali_ids: [Option<u32>; 2],

    ledger: SwapLedger,
    self_handle: Weak<RefCell<SchedulerInner>>,
}

impl ArrayObserver for SchedulerInner {
    fn on_array_op(
        &mut self,
        array: &SyncedArray,
        op: ArrayOp,
        dtype: DType,
        ctx: &Context,
        write_only: bool,
    ) -> Result<(), CallbackViolation> {
        match self.mode {
            ObserverMode::Record => self.record_access(array, op, dtype, ctx, write_only),
            ObserverMode::Trace => self.trace_access(array, op, dtype, ctx),
        }
    }
}

impl SchedulerInner {
    fn init(&mut self) {
        self.tail = 0;
        self.used_bytes_swap_out = 0;
        self.order_idx = 0;
        self.func_idx = 0;
        self.wrong_ordered.clear();
        self.precleared.clear();
        self.id_map.clear();
        self.swapped_out_flag.clear();
        self.swapped_out_rec.clear();
    }

    fn reset(&mut self) {
        self.init();
        self.order.clear();
        self.func_block_ends.clear();
        self.order_idx_by_id.clear();
        self.swap_in_plan.clear();
        self.swap_out_plan.clear();
        self.wait_plan.clear();
        self.dali_handles = [[None, None], [None, None]];
        self.dali_ids = [None, None];
        self.first_iter = true;
        self.scheduled = false;
        self.iter_count = 0;
        self.mode = ObserverMode::Record;
        self.ledger
            .record(SwapEventKind::Policy, "scheduler reset to record mode");
    }

    fn set_callback(&self) {
        if let Some(handle) = self.self_handle.upgrade() {
            self.runtime.install_observer(handle);
        }
    }

    fn unset_callback(&self) {
        self.runtime.uninstall_observer();
    }

    //------------------------------------------------------------------
    //  Recording and tracing
    //------------------------------------------------------------------

    fn record_access(
        &mut self,
        array: &SyncedArray,
        op: ArrayOp,
        dtype: DType,
        ctx: &Context,
        _write_only: bool,
    ) -> Result<(), CallbackViolation> {
        if self.func_idx == 0 {
            // Accesses before the first function boundary are not managed.
            return Ok(());
        }
        let tag = rec_tag(op);
        if self.id_map.len() > u32::MAX as usize {
            return Err(CallbackViolation::IdSpaceExhausted { limit: u32::MAX });
        }
        let next_id = self.id_map.len() as u32;
        let id = *self.id_map.entry(array.instance_id()).or_insert(next_id);
        self.order.push(RecType {
            tag,
            synced_array_id: id,
            sawptr: array.downgrade(),
            size: array.size(),
            dtype,
            ctx: ctx.clone(),
            preclear: false,
            swapped_out: false,
            no_need_swap_out: false,
            swapped_out_bytes: 0,
        });
        self.order_idx_by_id
            .entry(id)
            .or_default()
            .push(self.order_idx);
        self.order_idx += 1;
        Ok(())
    }

    fn trace_access(
        &mut self,
        array: &SyncedArray,
        op: ArrayOp,
        dtype: DType,
        ctx: &Context,
    ) -> Result<(), CallbackViolation> {
        if self.func_idx == 0 {
            return Ok(());
        }
        let tag = rec_tag(op);
        let instance = array.instance_id();

        // A get/cast between an executed preclear and the traced clear
        // means the plan no longer matches reality.
        if self.precleared.get(&instance).copied().unwrap_or(false) {
            if tag == RecTag::Clear {
                self.precleared.insert(instance, false);
            } else {
                return Err(CallbackViolation::PreclearedReuse);
            }
        }

        let block_end = self
            .func_block_ends
            .get(self.func_idx - 1)
            .copied()
            .unwrap_or(0);
        let in_block = self.order_idx < block_end;

        let mut substitute_id = None;
        let mut out_of_order = false;
        if in_block {
            match self.order.get(self.order_idx) {
                Some(rec) => {
                    let fields_match = tag == rec.tag
                        && dtype == rec.dtype
                        && ctx.device_key() == rec.ctx.device_key();
                    let same_identity = rec
                        .sawptr
                        .upgrade()
                        .is_some_and(|h| h.instance_id() == instance);
                    if fields_match && !same_identity {
                        // The underlying array was replaced this iteration;
                        // repoint every recorded use of the id.
                        substitute_id = Some(rec.synced_array_id);
                    } else if !(fields_match && same_identity) {
                        out_of_order = true;
                    }
                }
                None => out_of_order = true,
            }
        } else {
            out_of_order = true;
        }

        if let Some(id) = substitute_id {
            let positions = self.order_idx_by_id.get(&id).cloned().unwrap_or_default();
            for position in positions {
                self.order[position].sawptr = array.downgrade();
            }
        } else if out_of_order {
            self.wrong_ordered.push(RecType {
                tag,
                synced_array_id: 0,
                sawptr: array.downgrade(),
                size: array.size(),
                dtype,
                ctx: ctx.clone(),
                preclear: false,
                swapped_out: false,
                no_need_swap_out: false,
                swapped_out_bytes: 0,
            });
        }

        self.order_idx += 1;
        Ok(())
    }

    //------------------------------------------------------------------
    //  Planning
    //------------------------------------------------------------------

    fn build_schedule(&mut self) -> Result<(), LmsError> {
        let function_count = self.func_block_ends.len();
        self.swap_in_plan = vec![Vec::new(); function_count];
        self.swap_out_plan = vec![Vec::new(); function_count];
        self.wait_plan = vec![Vec::new(); function_count];
        if function_count < 2 {
            self.scheduled = true;
            self.ledger.record(
                SwapEventKind::Plan,
                format!("nothing to plan across {function_count} function blocks"),
            );
            return Ok(());
        }

        self.schedule_preclear();

        let last_function = function_count - 1;
        let mut head = 0usize;
        let mut used_bytes_swap_in = 0usize;
        let mut counts = QueuedArrayCounts::default();

        for fid in 0..last_function {
            let prefetch = self.plan_swap_in(&mut head, &mut used_bytes_swap_in, &mut counts)?;
            if head < self.func_block_ends[fid] {
                return Err(LmsError::OutOfDeviceMemory {
                    function_index: fid,
                    budget: self.max_bytes_swap_in - self.max_bytes_swap_out,
                });
            }
            self.swap_in_plan[fid] = prefetch;
            self.swap_out_plan[fid] = self.plan_swap_out(&mut used_bytes_swap_in, &mut counts, fid)?;
            self.wait_plan[fid] = self.plan_wait_for_swap_out();
        }

        // Everything still in flight is awaited before the last block runs.
        self.wait_plan[last_function - 1] = self.plan_wait_for_all_swap_out();

        self.scheduled = true;
        self.ledger.record(
            SwapEventKind::Plan,
            format!(
                "schedule built over {} records in {function_count} function blocks",
                self.order.len()
            ),
        );
        Ok(())
    }

    /// Reverse pass: the last get/cast of an id before its clear is
    /// dropped in place instead of being swapped out.
    fn schedule_preclear(&mut self) {
        let mut clear_pending: HashMap<u32, bool> = HashMap::new();
        for i in (0..self.order.len()).rev() {
            let id = self.order[i].synced_array_id;
            if self.order[i].tag == RecTag::Clear {
                clear_pending.insert(id, true);
            } else {
                let flag = clear_pending.get(&id).copied().unwrap_or(false);
                self.order[i].preclear = flag;
                clear_pending.insert(id, false);
            }
        }
        let marked = self.order.iter().filter(|r| r.preclear).count();
        self.ledger.record(
            SwapEventKind::Plan,
            format!("preclear marked {marked} accesses"),
        );
    }

    fn plan_swap_in(
        &mut self,
        head: &mut usize,
        used_bytes_swap_in: &mut usize,
        counts: &mut QueuedArrayCounts,
    ) -> Result<Vec<usize>, LmsError> {
        // A host-side use makes the host pull the array synchronously;
        // prefetching it again in this pass would race that pull.
        let mut host_uses: HashMap<u32, bool> = HashMap::new();
        let mut prefetch = Vec::new();
        let budget = self.max_bytes_swap_in - self.max_bytes_swap_out;

        while *head < self.order.len() {
            let i = *head;
            if self.order[i].tag == RecTag::Clear {
                *head += 1;
                continue;
            }
            let on_device = self.order[i].ctx.array_class() == self.device_ctx.array_class();
            let on_host = self.order[i].ctx.array_class() == self.host_ctx.array_class();
            let id = self.order[i].synced_array_id;
            if on_device {
                let dtype = self.order[i].dtype;
                let bytes = self.order[i].size * dtype.size_of();
                if *used_bytes_swap_in + bytes > budget {
                    break;
                }
                if counts.count(id, dtype) == 0 {
                    if !host_uses.get(&id).copied().unwrap_or(false) {
                        prefetch.push(i);
                        if self.swapped_out_flag.get(&id).copied().unwrap_or(false) {
                            if let Some(&eviction) = self.swapped_out_rec.get(&id) {
                                // The array is still resident when this
                                // prefetch fires; the queued eviction is
                                // cancelled.
                                self.order[eviction].no_need_swap_out = true;
                            }
                            self.swapped_out_flag.insert(id, false);
                        }
                    }
                    *used_bytes_swap_in += bytes;
                }
                counts.increment(id, dtype);
                *head += 1;
            } else if on_host {
                host_uses.insert(id, true);
                *head += 1;
            } else {
                return Err(LmsError::UnsupportedArrayClass {
                    array_class: self.order[i].ctx.array_class().to_string(),
                });
            }
        }
        Ok(prefetch)
    }

    fn plan_swap_out(
        &mut self,
        used_bytes_swap_in: &mut usize,
        counts: &mut QueuedArrayCounts,
        fid: usize,
    ) -> Result<Vec<usize>, LmsError> {
        let start = if fid == 0 {
            0
        } else {
            self.func_block_ends[fid - 1]
        };
        let end = self.func_block_ends[fid];
        let mut evictions = Vec::new();

        for i in start..end {
            if self.order[i].tag == RecTag::Clear {
                continue;
            }
            let on_device = self.order[i].ctx.array_class() == self.device_ctx.array_class();
            let on_host = self.order[i].ctx.array_class() == self.host_ctx.array_class();
            let id = self.order[i].synced_array_id;
            let dtype = self.order[i].dtype;
            if on_device {
                if counts.total(id) == 1 {
                    // Last pending use in the queue.
                    evictions.push(i);
                    let size = self.order[i].size;
                    let bytes_all_dtypes = counts.bytes_across_dtypes(id, size);
                    if !self.order[i].preclear {
                        self.order[i].swapped_out = true;
                        self.swapped_out_flag.insert(id, true);
                        self.swapped_out_rec.insert(id, i);
                        self.used_bytes_swap_out += bytes_all_dtypes;
                        self.order[i].swapped_out_bytes = bytes_all_dtypes;
                    }
                    *used_bytes_swap_in = used_bytes_swap_in.saturating_sub(bytes_all_dtypes);
                }
                counts.decrement(id, dtype);
            } else if !on_host {
                return Err(LmsError::UnsupportedArrayClass {
                    array_class: self.order[i].ctx.array_class().to_string(),
                });
            }
        }
        Ok(evictions)
    }

    fn plan_wait_for_swap_out(&mut self) -> Vec<usize> {
        let mut waits = Vec::new();
        while self.used_bytes_swap_out > self.max_bytes_swap_out && self.tail < self.order.len() {
            self.plan_wait_step(&mut waits);
        }
        waits
    }

    fn plan_wait_for_all_swap_out(&mut self) -> Vec<usize> {
        let mut waits = Vec::new();
        while self.tail < self.order.len() {
            self.plan_wait_step(&mut waits);
        }
        waits
    }

    fn plan_wait_step(&mut self, waits: &mut Vec<usize>) {
        let i = self.tail;
        self.tail += 1;
        if self.order[i].swapped_out {
            waits.push(i);
            self.order[i].swapped_out = false;
            let bytes = self.order[i].swapped_out_bytes;
            self.used_bytes_swap_out = self.used_bytes_swap_out.saturating_sub(bytes);
            self.order[i].swapped_out_bytes = 0;
            let id = self.order[i].synced_array_id;
            self.swapped_out_flag.insert(id, false);
        }
    }

    //------------------------------------------------------------------
    //  Execution
    //------------------------------------------------------------------

    fn pre_callback(&mut self) -> Result<(), LmsError> {
        self.unset_callback();
        if self.func_idx > 0 {
            self.swap_out_step()?;
        }
        self.swap_in_step()?;
        self.set_callback();
        Ok(())
    }

    fn swap_out_step(&mut self) -> Result<(), LmsError> {
        let fid = self.func_idx - 1;
        if self.first_iter {
            self.func_block_ends.push(self.order_idx);
        }
        self.swap_out()?;
        if let Some(&end) = self.func_block_ends.get(fid) {
            if self.order_idx < end {
                // Fewer accesses than recorded; realign the comparator at
                // the start of the next block.
                self.order_idx = end;
            }
        }
        Ok(())
    }

    fn swap_in_step(&mut self) -> Result<(), LmsError> {
        self.func_idx += 1;
        if !self.first_iter {
            self.swap_in()?;
        }
        Ok(())
    }

    fn swap_in(&mut self) -> Result<(), LmsError> {
        let fid = self.func_idx - 1;
        let Some(prefetch) = self.swap_in_plan.get(fid) else {
            return Ok(());
        };
        for &i in prefetch {
            let rec = &self.order[i];
            if let Some(array) = rec.sawptr.upgrade() {
                array.get(rec.dtype, &rec.ctx, async_unsafe())?;
            }
        }
        Ok(())
    }

    fn swap_out(&mut self) -> Result<(), LmsError> {
        if self.first_iter {
            self.swap_out_first_iter()?;
            self.wait_for_swap_out_first_iter()
        } else {
            self.swap_out_scheduled()?;
            self.wait_for_swap_out_scheduled()
        }
    }

    fn swap_out_first_iter(&mut self) -> Result<(), LmsError> {
        let fid = self.func_idx - 1;
        let Some(&end) = self.func_block_ends.get(fid) else {
            return Ok(());
        };
        let start = if fid == 0 {
            0
        } else {
            self.func_block_ends[fid - 1]
        };
        for i in start..end {
            if self.order[i].tag == RecTag::Clear {
                continue;
            }
            let on_device = self.order[i].ctx.array_class() == self.device_ctx.array_class();
            let on_host = self.order[i].ctx.array_class() == self.host_ctx.array_class();
            if on_device {
                let Some(array) = self.order[i].sawptr.upgrade() else {
                    continue;
                };
                if array.get_num_arrays() == 0 {
                    continue;
                }
                array.cast(array.dtype(), &self.host_ctx, false, async_unsafe())?;
                let bytes = array.size() * array.dtype().size_of();
                self.used_bytes_swap_out += bytes;
                self.order[i].swapped_out = true;
                self.order[i].swapped_out_bytes = bytes;
            } else if !on_host {
                return Err(LmsError::UnsupportedArrayClass {
                    array_class: self.order[i].ctx.array_class().to_string(),
                });
            }
        }
        Ok(())
    }

    fn wait_for_swap_out_first_iter(&mut self) -> Result<(), LmsError> {
        while self.used_bytes_swap_out > self.max_bytes_swap_out && self.tail < self.order.len() {
            self.wait_step()?;
        }
        Ok(())
    }

    fn wait_for_all_swap_out(&mut self) -> Result<(), LmsError> {
        while self.tail < self.order.len() {
            self.wait_step()?;
        }
        Ok(())
    }

    /// Join the eviction at the tail cursor. The host-side get is a no-op
    /// copy but serializes behind the queued transfer.
    fn wait_step(&mut self) -> Result<(), LmsError> {
        let i = self.tail;
        self.tail += 1;
        if self.order[i].tag == RecTag::Clear {
            return Ok(());
        }
        if !self.order[i].swapped_out {
            return Ok(());
        }
        if let Some(array) = self.order[i].sawptr.upgrade() {
            if array.head_array_class().as_deref() == Some(self.host_ctx.array_class())
                && array.get_num_arrays() > 0
            {
                array.get(array.dtype(), &self.host_ctx, unsafe_only())?;
            }
        }
        self.order[i].swapped_out = false;
        let bytes = self.order[i].swapped_out_bytes;
        self.used_bytes_swap_out = self.used_bytes_swap_out.saturating_sub(bytes);
        self.order[i].swapped_out_bytes = 0;
        Ok(())
    }

    fn swap_out_scheduled(&mut self) -> Result<(), LmsError> {
        let fid = self.func_idx - 1;
        let evictions = self.swap_out_plan.get(fid).cloned().unwrap_or_default();
        for i in evictions {
            let (preclear, no_need) = {
                let rec = &self.order[i];
                (rec.preclear, rec.no_need_swap_out)
            };
            let Some(array) = self.order[i].sawptr.upgrade() else {
                continue;
            };
            if preclear {
                array.clear()?;
                self.precleared.insert(array.instance_id(), true);
            } else if !no_need {
                array.cast(array.dtype(), &self.host_ctx, false, async_unsafe())?;
            }
        }
        Ok(())
    }

    fn wait_for_swap_out_scheduled(&mut self) -> Result<(), LmsError> {
        let fid = self.func_idx - 1;
        let Some(waits) = self.wait_plan.get(fid) else {
            return Ok(());
        };
        for &i in waits {
            let rec = &self.order[i];
            if rec.no_need_swap_out {
                continue;
            }
            if let Some(array) = rec.sawptr.upgrade() {
                if array.head_array_class().as_deref() == Some(self.host_ctx.array_class())
                    && array.get_num_arrays() > 0
                {
                    array.get(array.dtype(), &self.host_ctx, unsafe_only())?;
                }
            }
        }
        Ok(())
    }

    /// Accesses that fell outside the recorded order are evicted
    /// synchronously; nothing is known about their future.
    fn swap_out_wrong_order(&mut self) -> Result<(), LmsError> {
        for i in 0..self.wrong_ordered.len() {
            if self.wrong_ordered[i].tag == RecTag::Clear {
                continue;
            }
            let on_device =
                self.wrong_ordered[i].ctx.array_class() == self.device_ctx.array_class();
            let on_host = self.wrong_ordered[i].ctx.array_class() == self.host_ctx.array_class();
            if on_device {
                let Some(array) = self.wrong_ordered[i].sawptr.upgrade() else {
                    continue;
                };
                if array.get_num_arrays() > 0 {
                    array.cast(
                        self.wrong_ordered[i].dtype,
                        &self.host_ctx,
                        false,
                        AsyncFlagSet::empty(),
                    )?;
                }
            } else if !on_host {
                return Err(LmsError::UnsupportedArrayClass {
                    array_class: self.wrong_ordered[i].ctx.array_class().to_string(),
                });
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), LmsError> {
        if self.func_idx > 0 {
            self.swap_out_step()?;
        }
        let stray = self.wrong_ordered.len();
        self.swap_out_wrong_order()?;
        self.wait_for_all_swap_out()?;

        if self.first_iter {
            self.init();
            self.build_schedule()?;
            self.ledger.record(
                SwapEventKind::Policy,
                "record mode complete, tracing from next iteration",
            );
        }

        // Host memory must not be touched while managed transfers are in
        // flight; the next iteration writes fresh input data into it.
        self.runtime.synchronize(&self.device_ctx);

        self.mode = ObserverMode::Trace;
        self.first_iter = false;
        self.iter_count += 1;
        self.ledger.record(
            SwapEventKind::Iteration,
            format!(
                "iteration {} finalized: {stray} stray accesses evicted synchronously",
                self.iter_count
            ),
        );
        Ok(())
    }

    //------------------------------------------------------------------
    //  Double buffering
    //------------------------------------------------------------------

    fn use_dali(&mut self, batches: &[[SyncedArray; 2]]) -> Result<(), LmsError> {
        if batches.is_empty() {
            return Err(LmsError::EmptyDoubleBuffer);
        }
        if batches.len() > 1 {
            return Err(LmsError::MultiDeviceDoubleBuffer {
                batches: batches.len(),
            });
        }
        let pair = &batches[0];

        if self.iter_count == 0 {
            self.dali_handles[0] = [Some(pair[0].downgrade()), Some(pair[1].downgrade())];
        } else if self.iter_count == 1 {
            for slot in 0..2 {
                let recorded = self.dali_handles[0][slot]
                    .as_ref()
                    .and_then(WeakSyncedArray::upgrade)
                    .ok_or(LmsError::ExpiredDoubleBuffer)?;
                self.dali_ids[slot] = self.order.iter().find_map(|rec| {
                    rec.sawptr
                        .upgrade()
                        .is_some_and(|h| h.same_array(&recorded))
                        .then_some(rec.synced_array_id)
                });
            }
            self.dali_handles[1] = [Some(pair[0].downgrade()), Some(pair[1].downgrade())];
            for slot in 0..2 {
                self.repoint_dali_slot(slot, &pair[slot].downgrade());
            }
        } else {
            let current = self.iter_count % 2;
            for slot in 0..2 {
                if let Some(handle) = self.dali_handles[current][slot].clone() {
                    self.repoint_dali_slot(slot, &handle);
                }
            }
        }
        Ok(())
    }

    fn repoint_dali_slot(&mut self, slot: usize, handle: &WeakSyncedArray) {
        if let Some(id) = self.dali_ids[slot] {
            let positions = self.order_idx_by_id.get(&id).cloned().unwrap_or_default();
            for position in positions {
                self.order[position].sawptr = handle.clone();
            }
        }
    }

    fn build_report(&self) -> ScheduleReport {
        let functions = (0..self.func_block_ends.len())
            .map(|fid| {
                let prefetch_bytes = self.swap_in_plan.get(fid).map_or(0, |plan| {
                    plan.iter()
                        .map(|&i| self.order[i].size * self.order[i].dtype.size_of())
                        .sum()
                });
                FunctionPlan {
                    function_index: fid,
                    swap_in_count: self.swap_in_plan.get(fid).map_or(0, Vec::len),
                    swap_out_count: self.swap_out_plan.get(fid).map_or(0, Vec::len),
                    wait_count: self.wait_plan.get(fid).map_or(0, Vec::len),
                    prefetch_bytes,
                }
            })
            .collect();
        ScheduleReport {
            record_count: self.order.len(),
            function_count: self.func_block_ends.len(),
            max_bytes_swap_in: self.max_bytes_swap_in,
            max_bytes_swap_out: self.max_bytes_swap_out,
            preclear_count: self.order.iter().filter(|r| r.preclear).count(),
            functions,
        }
    }
}

/// Swap-in/swap-out scheduler for training loops whose working set
/// exceeds device memory.
///
/// The first iteration records every array access between the pre-hooks;
/// at its end a schedule is built that prefetches arrays just before use
/// and evicts them after their last pending use, within a fixed device
/// budget. Later iterations replay the schedule and trace deviations.
pub struct SwapInOutScheduler {
    inner: Rc<RefCell<SchedulerInner>>,
}

impl SwapInOutScheduler {
    /// `bytes` is the total device budget; half of it is reserved for
    /// in-flight evictions.
    #[must_use]
    pub fn new(
        runtime: Rc<ArrayRuntime>,
        host_ctx: Context,
        device_ctx: Context,
        bytes: usize,
    ) -> Self {
        let inner = Rc::new(RefCell::new(SchedulerInner {
            runtime,
            host_ctx,
            device_ctx,
            max_bytes_swap_in: bytes,
            max_bytes_swap_out: bytes / 2,
            mode: ObserverMode::Record,
            first_iter: true,
            scheduled: false,
            iter_count: 0,
            order: Vec::new(),
            func_block_ends: Vec::new(),
            order_idx: 0,
            func_idx: 0,
            tail: 0,
            used_bytes_swap_out: 0,
            id_map: HashMap::new(),
            order_idx_by_id: HashMap::new(),
            wrong_ordered: Vec::new(),
            precleared: HashMap::new(),
            swapped_out_flag: HashMap::new(),
            swapped_out_rec: HashMap::new(),
            swap_in_plan: Vec::new(),
            swap_out_plan: Vec::new(),
            wait_plan: Vec::new(),
            dali_handles: [[None, None], [None, None]],
            dali_ids: [None, None],
            ledger: SwapLedger::new(),
            self_handle: Weak::new(),
        }));
        inner.borrow_mut().self_handle = Rc::downgrade(&inner);
        Self { inner }
    }

    /// Open an iteration: reset per-iteration state and install the
    /// observer.
    pub fn start_scheduling(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.init();
        inner.set_callback();
    }

    /// Close the iteration: run the tail swap-out, evict stray accesses,
    /// drain everything, build the schedule after the first iteration,
    /// and synchronize the device.
    pub fn end_scheduling(&self) -> Result<(), LmsError> {
        let mut inner = self.inner.borrow_mut();
        inner.unset_callback();
        inner.finalize()
    }

    /// Forget the recorded trace and return to record mode. The next
    /// completed iteration is observed from scratch.
    pub fn reset(&self) {
        self.inner.borrow_mut().reset();
    }

    /// Accept the double-buffered input pair for the coming iteration.
    /// Data loaders that alternate between two physical buffers recycle
    /// them under the ids recorded in the first iteration.
    pub fn use_dali(&self, batches: &[[SyncedArray; 2]]) -> Result<(), LmsError> {
        self.inner.borrow_mut().use_dali(batches)
    }

    pub fn pre_function_callback(&self) -> Result<(), LmsError> {
        self.inner.borrow_mut().pre_callback()
    }

    pub fn post_function_callback(&self) {}

    pub fn pre_update_callback(&self) -> Result<(), LmsError> {
        self.inner.borrow_mut().pre_callback()
    }

    pub fn post_update_callback(&self) {}

    #[must_use]
    pub fn iteration_count(&self) -> usize {
        self.inner.borrow().iter_count
    }

    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.inner.borrow().scheduled
    }

    #[must_use]
    pub fn max_bytes_swap_in(&self) -> usize {
        self.inner.borrow().max_bytes_swap_in
    }

    #[must_use]
    pub fn max_bytes_swap_out(&self) -> usize {
        self.inner.borrow().max_bytes_swap_out
    }

    #[must_use]
    pub fn used_bytes_swap_out(&self) -> usize {
        self.inner.borrow().used_bytes_swap_out
    }

    #[must_use]
    pub fn trace_len(&self) -> usize {
        self.inner.borrow().order.len()
    }

    #[must_use]
    pub fn function_block_ends(&self) -> Vec<usize> {
        self.inner.borrow().func_block_ends.clone()
    }

    /// Instance id each recorded access currently resolves to, in trace
    /// order. `None` for expired handles.
    #[must_use]
    pub fn traced_instance_ids(&self) -> Vec<Option<u64>> {
        self.inner
            .borrow()
            .order
            .iter()
            .map(|rec| rec.sawptr.upgrade().map(|h| h.instance_id()))
            .collect()
    }

    #[must_use]
    pub fn ledger_entries(&self) -> Vec<SwapEvent> {
        self.inner.borrow().ledger.entries().to_vec()
    }

    /// Summary of the built schedule, or `None` before the first
    /// iteration completes.
    #[must_use]
    pub fn schedule_report(&self) -> Option<ScheduleReport> {
        let inner = self.inner.borrow();
        inner.scheduled.then(|| inner.build_report())
    }
}

impl Drop for SwapInOutScheduler {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.try_borrow() {
            inner.runtime.uninstall_observer();
        }
    }
}
