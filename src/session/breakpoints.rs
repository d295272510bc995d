//! Breakpoint coordinator.
//!
//! GDB only offers an ignore count and a boolean condition per breakpoint.
//! Pass-count styles (equal, equal-or-greater, modulo) and break-when-changed
//! conditions are layered on top here, and re-armed after every presented stop.

use crate::error::{BindFailure, BreakpointError, TransportError};
use crate::gdb::parser::{parse_breakpoint, quote_mi_string};
use crate::gdb::{Breakpoint, MiChannel, ResultClass};
use crate::session::run_state::{RunState, RunStateTracker};
use crate::session::sync::TicketLock;
use crate::session::variables::VariableEvaluator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub type PendingId = u32;
pub type BreakpointId = u32;

/// Largest ignore count GDB accepts; used to mean "never stop again".
const IGNORE_FOREVER: i64 = i32::MAX as i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BreakpointLocation {
    FileLine { file: String, line: u32 },
    Function {
        name: String,
        #[serde(default)]
        offset: u32,
    },
    Address { address: String },
    Data { expression: String },
}

impl BreakpointLocation {
    fn kind(&self) -> &'static str {
        match self {
            BreakpointLocation::FileLine { .. } => "file-line",
            BreakpointLocation::Function { .. } => "function",
            BreakpointLocation::Address { .. } => "address",
            BreakpointLocation::Data { .. } => "data",
        }
    }

    fn is_supported(&self) -> bool {
        matches!(
            self,
            BreakpointLocation::FileLine { .. } | BreakpointLocation::Function { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassCountStyle {
    #[default]
    None,
    Equal,
    EqualOrGreater,
    Modulo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassCount {
    pub style: PassCountStyle,
    #[serde(default)]
    pub threshold: u32,
}

impl PassCount {
    pub fn new(style: PassCountStyle, threshold: u32) -> Self {
        Self { style, threshold }
    }

    /// Whether the `hits`-th hit should be presented as a stop.
    pub fn should_stop(&self, hits: u32) -> bool {
        match self.style {
            PassCountStyle::None => true,
            PassCountStyle::Equal => hits == self.threshold,
            PassCountStyle::EqualOrGreater => hits >= self.threshold,
            PassCountStyle::Modulo => self.threshold != 0 && hits % self.threshold == 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionStyle {
    #[default]
    None,
    WhenTrue,
    WhenChanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub style: ConditionStyle,
    #[serde(default)]
    pub expression: String,
}

/// What GDB is told about upcoming hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IgnoreCount {
    /// Stop on the k-th next hit (k >= 1).
    StopOn(u32),
    /// Stay armed but never stop.
    Never,
}

impl IgnoreCount {
    /// Map "stop on the n-th next hit" to GDB's terms; n below 1 means never.
    fn from_next_hit(n: i64) -> Self {
        if n < 1 {
            IgnoreCount::Never
        } else {
            IgnoreCount::StopOn(n.min(IGNORE_FOREVER) as u32)
        }
    }

    fn gdb_ignore(&self) -> i64 {
        match self {
            IgnoreCount::StopOn(k) => i64::from(*k) - 1,
            IgnoreCount::Never => IGNORE_FOREVER,
        }
    }
}

/// Ignore policy for a pass count given the hits so far.
pub fn compute_ignore(pass: &PassCount, hits: u32, when_changed: bool) -> IgnoreCount {
    if when_changed {
        return IgnoreCount::StopOn(1);
    }
    let n = i64::from(pass.threshold);
    let hits = i64::from(hits);
    match pass.style {
        PassCountStyle::None => IgnoreCount::StopOn(1),
        PassCountStyle::EqualOrGreater => IgnoreCount::from_next_hit((n - hits).max(1)),
        PassCountStyle::Equal => IgnoreCount::from_next_hit(n - hits),
        PassCountStyle::Modulo if n > 0 => IgnoreCount::from_next_hit(n - hits % n),
        PassCountStyle::Modulo => IgnoreCount::StopOn(1),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointRequest {
    pub location: BreakpointLocation,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub pass_count: Option<PassCount>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl BreakpointRequest {
    pub fn new(location: BreakpointLocation) -> Self {
        Self {
            location,
            condition: None,
            pass_count: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointStatus {
    Enabled,
    Disabled,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitDecision {
    Stop,
    Continue,
    /// The hit names no live breakpoint.
    Ignored,
}

/// Snapshot of a bound breakpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundBreakpoint {
    pub id: BreakpointId,
    pub pending_id: PendingId,
    pub gdb_id: u32,
    pub file: Option<String>,
    pub fullname: Option<String>,
    pub line: Option<u32>,
    pub function: Option<String>,
    pub address: String,
    pub enabled: bool,
    pub hit_count: u32,
    pub pass_count: PassCount,
    pub condition: Condition,
    pub ignore: IgnoreCount,
    /// Hit count the ignore policy was computed from.
    pub armed_at: u32,
}

#[derive(Debug)]
struct PendingBreakpoint {
    request: BreakpointRequest,
    enabled: bool,
    deleted: bool,
    bound: Vec<BreakpointId>,
}

#[derive(Debug)]
struct BoundData {
    gdb_id: u32,
    record: Breakpoint,
    enabled: bool,
    deleted: bool,
    hit_count: u32,
    pass: PassCount,
    condition: Condition,
    previous_value: Option<String>,
    ignore: IgnoreCount,
    armed_at: u32,
}

struct BoundEntry {
    id: BreakpointId,
    pending_id: PendingId,
    edit_lock: TicketLock,
    data: Mutex<BoundData>,
}

impl BoundEntry {
    fn data(&self) -> MutexGuard<'_, BoundData> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn snapshot(&self) -> BoundBreakpoint {
        let data = self.data();
        BoundBreakpoint {
            id: self.id,
            pending_id: self.pending_id,
            gdb_id: data.gdb_id,
            file: data.record.file.clone(),
            fullname: data.record.fullname.clone(),
            line: data.record.line,
            function: data.record.func.clone(),
            address: match data.record.addr.as_deref() {
                None | Some("<PENDING>") => "0x0".to_string(),
                Some(addr) => addr.to_string(),
            },
            enabled: data.enabled,
            hit_count: data.hit_count,
            pass_count: data.pass,
            condition: data.condition.clone(),
            ignore: data.ignore,
            armed_at: data.armed_at,
        }
    }
}

#[derive(Default)]
struct Table {
    next_pending: PendingId,
    next_bound: BreakpointId,
    pending: HashMap<PendingId, PendingBreakpoint>,
    bound: HashMap<BreakpointId, Arc<BoundEntry>>,
    by_gdb_id: HashMap<u32, BreakpointId>,
}

pub struct BreakpointCoordinator {
    gdb: Arc<dyn MiChannel>,
    run_state: Arc<RunStateTracker>,
    evaluator: Arc<VariableEvaluator>,
    /// Critical region shared by edits and hit processing.
    critical: TicketLock,
    table: Mutex<Table>,
}

impl BreakpointCoordinator {
    pub fn new(
        gdb: Arc<dyn MiChannel>,
        run_state: Arc<RunStateTracker>,
        evaluator: Arc<VariableEvaluator>,
    ) -> Self {
        Self {
            gdb,
            run_state,
            evaluator,
            critical: TicketLock::new(),
            table: Mutex::new(Table {
                next_pending: 1,
                next_bound: 1,
                ..Default::default()
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn entry(&self, id: BreakpointId) -> Result<Arc<BoundEntry>, BreakpointError> {
        self.table()
            .bound
            .get(&id)
            .cloned()
            .ok_or(BreakpointError::UnknownId(id))
    }

    fn live_entry(&self, id: BreakpointId) -> Result<Arc<BoundEntry>, BreakpointError> {
        let entry = self.entry(id)?;
        if entry.data().deleted {
            return Err(BreakpointError::Deleted(id));
        }
        Ok(entry)
    }

    /// Register a breakpoint description without touching GDB.
    pub fn create_pending(&self, request: BreakpointRequest) -> PendingId {
        let mut table = self.table();
        let id = table.next_pending;
        table.next_pending += 1;
        let enabled = request.enabled;
        table.pending.insert(
            id,
            PendingBreakpoint {
                request,
                enabled,
                deleted: false,
                bound: Vec::new(),
            },
        );
        id
    }

    /// Create and bind in one go.
    pub fn bind_request(&self, request: BreakpointRequest) -> Result<BoundBreakpoint, BindFailure> {
        let pending = self.create_pending(request);
        let result = self.bind(pending);
        if result.is_err() {
            self.table().pending.remove(&pending);
        }
        result
    }

    /// Bind a pending breakpoint to its (single) code location.
    pub fn bind(&self, pending_id: PendingId) -> Result<BoundBreakpoint, BindFailure> {
        let (request, enabled) = {
            let table = self.table();
            let pending = table
                .pending
                .get(&pending_id)
                .ok_or(BindFailure::ParentDeleted)?;
            if pending.deleted {
                return Err(BindFailure::ParentDeleted);
            }
            (pending.request.clone(), pending.enabled)
        };
        if !request.location.is_supported() {
            return Err(BindFailure::UnsupportedLocation(
                request.location.kind().to_string(),
            ));
        }
        if !self.gdb.monitor().is_connected() || self.run_state.state() == RunState::Done {
            return Err(BindFailure::NoActiveProcess);
        }

        let _critical = self.critical.lock();
        let _pause = self.run_state.artificial_break()?;

        let record = self.insert_location(&request.location)?;
        let gdb_id = record
            .id()
            .ok_or_else(|| BindFailure::Rejected(format!("bad breakpoint number {}", record.number)))?;
        info!("Bound breakpoint {} at {:?}", gdb_id, request.location);

        let entry = {
            let mut table = self.table();
            // The parent may have been deleted while GDB was busy
            let parent_deleted = table.pending.get(&pending_id).map_or(true, |p| p.deleted);
            if parent_deleted {
                drop(table);
                self.send_delete(gdb_id);
                return Err(BindFailure::ParentDeleted);
            }
            let id = table.next_bound;
            table.next_bound += 1;
            let hits = record.times;
            let entry = Arc::new(BoundEntry {
                id,
                pending_id,
                edit_lock: TicketLock::new(),
                data: Mutex::new(BoundData {
                    gdb_id,
                    record,
                    enabled: true,
                    deleted: false,
                    hit_count: hits,
                    pass: PassCount::default(),
                    condition: Condition::default(),
                    previous_value: None,
                    ignore: IgnoreCount::StopOn(1),
                    armed_at: hits,
                }),
            });
            table.bound.insert(id, Arc::clone(&entry));
            table.by_gdb_id.insert(gdb_id, id);
            if let Some(parent) = table.pending.get_mut(&pending_id) {
                parent.bound.push(id);
            }
            entry
        };

        if let Some(condition) = request.condition.as_ref().filter(|c| c.style != ConditionStyle::None) {
            if let Err(e) = self.apply_condition(&entry, condition) {
                warn!("Initial condition on breakpoint {} failed: {}", gdb_id, e);
            }
        }
        if let Some(pass) = request.pass_count.filter(|p| p.style != PassCountStyle::None) {
            if let Err(e) = self.apply_pass_count(&entry, pass) {
                warn!("Initial pass count on breakpoint {} failed: {}", gdb_id, e);
            }
        }
        if !enabled {
            if let Err(e) = self.apply_enable(&entry, false) {
                warn!("Failed to disable breakpoint {}: {}", gdb_id, e);
            }
        }
        Ok(entry.snapshot())
    }

    fn insert_location(&self, location: &BreakpointLocation) -> Result<Breakpoint, BindFailure> {
        match location {
            BreakpointLocation::FileLine { file, line } => {
                let record = self.break_insert(&format!("{}:{}", file, line))?;
                if !record.is_pending() {
                    return Ok(record);
                }
                let short = Path::new(file)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(file);
                if short == file {
                    return Ok(record);
                }
                // GDB may only know the file by its short name
                debug!("{}:{} is pending, retrying with {}", file, line, short);
                if let Some(id) = record.id() {
                    self.send_delete(id);
                }
                Ok(self.break_insert(&format!("{}:{}", short, line))?)
            }
            BreakpointLocation::Function { name, offset: 0 } => Ok(self.break_insert(name)?),
            BreakpointLocation::Function { name, offset } => {
                Ok(self.break_insert(&format!("*{}+{}", name, offset))?)
            }
            other => Err(BindFailure::UnsupportedLocation(other.kind().to_string())),
        }
    }

    fn break_insert(&self, location: &str) -> Result<Breakpoint, BindFailure> {
        let response = self
            .gdb
            .send_command(&format!("break-insert -f {}", quote_mi_string(location)))?;
        if let Some(message) = response.error_message() {
            return Err(BindFailure::Rejected(message));
        }
        parse_breakpoint(&response.results)
            .ok_or_else(|| BindFailure::Rejected(format!("no breakpoint in reply: {}", response.raw)))
    }

    fn send_delete(&self, gdb_id: u32) {
        if let Err(e) = self
            .gdb
            .send_expect(&format!("break-delete {}", gdb_id), ResultClass::Done)
        {
            warn!("Failed to delete breakpoint {}: {}", gdb_id, e);
        }
    }

    fn send_checked(&self, command: &str) -> Result<(), BreakpointError> {
        match self.gdb.send_expect(command, ResultClass::Done) {
            Ok(_) => Ok(()),
            Err(TransportError::Gdb { message }) => Err(BreakpointError::Rejected(message)),
            Err(e) => Err(e.into()),
        }
    }

    fn send_ignore(&self, gdb_id: u32, ignore: IgnoreCount) -> Result<(), BreakpointError> {
        if ignore == IgnoreCount::Never {
            warn!("Breakpoint {} will not stop again", gdb_id);
        }
        self.send_checked(&format!("break-after {} {}", gdb_id, ignore.gdb_ignore()))
    }

    /// Push the ignore policy for `pass` to GDB and commit it. Callers hold
    /// the edit lock and the critical region.
    fn apply_pass_count(&self, entry: &BoundEntry, pass: PassCount) -> Result<(), BreakpointError> {
        let (gdb_id, hits, when_changed) = {
            let data = entry.data();
            (
                data.gdb_id,
                data.hit_count,
                data.condition.style == ConditionStyle::WhenChanged,
            )
        };
        let ignore = compute_ignore(&pass, hits, when_changed);
        self.send_ignore(gdb_id, ignore)?;
        let mut data = entry.data();
        data.pass = pass;
        data.ignore = ignore;
        data.armed_at = hits;
        Ok(())
    }

    fn apply_condition(&self, entry: &BoundEntry, condition: &Condition) -> Result<(), BreakpointError> {
        let (gdb_id, old_style, hits, pass) = {
            let data = entry.data();
            (data.gdb_id, data.condition.style, data.hit_count, data.pass)
        };
        // GDB parses the expression here, before anything is reset
        if condition.style == ConditionStyle::WhenTrue {
            self.send_checked(&format!("break-condition {} {}", gdb_id, condition.expression))?;
        }
        if hits != 0 {
            self.reset_hit_count(entry, false)?;
        }
        let gdb_id = if hits != 0 { entry.data().gdb_id } else { gdb_id };

        let mut previous_value = None;
        match condition.style {
            ConditionStyle::WhenTrue if hits != 0 => {
                self.send_checked(&format!("break-condition {} {}", gdb_id, condition.expression))?;
            }
            ConditionStyle::WhenTrue => {}
            ConditionStyle::None => {
                self.send_checked(&format!("break-condition {}", gdb_id))?;
            }
            ConditionStyle::WhenChanged => {
                // GDB only sees an unconditional breakpoint; the comparison is ours
                self.send_checked(&format!("break-condition {}", gdb_id))?;
                self.send_ignore(gdb_id, IgnoreCount::StopOn(1))?;
                let current = self.evaluator.evaluate(&condition.expression, None);
                if current.valid {
                    previous_value = Some(current.value);
                }
            }
        }

        {
            let mut data = entry.data();
            data.condition = condition.clone();
            data.previous_value = previous_value;
            if condition.style == ConditionStyle::WhenChanged {
                data.ignore = IgnoreCount::StopOn(1);
                data.armed_at = data.hit_count;
            }
        }
        if old_style == ConditionStyle::WhenChanged && condition.style != ConditionStyle::WhenChanged {
            self.apply_pass_count(entry, pass)?;
        }
        Ok(())
    }

    fn apply_enable(&self, entry: &BoundEntry, enabled: bool) -> Result<(), BreakpointError> {
        let gdb_id = entry.data().gdb_id;
        let verb = if enabled { "enable" } else { "disable" };
        self.send_checked(&format!("break-{} {}", verb, gdb_id))?;
        entry.data().enabled = enabled;
        Ok(())
    }

    /// GDB cannot reset `times`, so the breakpoint is re-created under a new
    /// GDB id and its settings re-applied.
    fn reset_hit_count(&self, entry: &BoundEntry, reapply_condition: bool) -> Result<(), BreakpointError> {
        let (old_id, location, pass, condition, enabled) = {
            let data = entry.data();
            let location = match (&data.record.fullname, &data.record.file, data.record.line) {
                (Some(full), _, Some(line)) | (None, Some(full), Some(line)) => format!("{}:{}", full, line),
                _ => data
                    .record
                    .original_location
                    .clone()
                    .or_else(|| data.record.func.clone())
                    .unwrap_or_default(),
            };
            (data.gdb_id, location, data.pass, data.condition.clone(), data.enabled)
        };
        self.send_checked(&format!("break-delete {}", old_id))?;
        let record = self.break_insert(&location).map_err(|e| match e {
            BindFailure::Transport(t) => BreakpointError::Transport(t),
            other => BreakpointError::Rejected(other.to_string()),
        })?;
        let new_id = record
            .id()
            .ok_or_else(|| BreakpointError::Rejected(format!("bad breakpoint number {}", record.number)))?;
        debug!("Breakpoint {} re-created as {}", old_id, new_id);
        {
            let mut table = self.table();
            table.by_gdb_id.remove(&old_id);
            table.by_gdb_id.insert(new_id, entry.id);
        }
        {
            let mut data = entry.data();
            data.gdb_id = new_id;
            data.record = record;
            data.hit_count = 0;
        }
        self.apply_pass_count(entry, pass)?;
        if reapply_condition && condition.style == ConditionStyle::WhenTrue {
            self.send_checked(&format!("break-condition {} {}", new_id, condition.expression))?;
        }
        if !enabled {
            self.apply_enable(entry, false)?;
        }
        Ok(())
    }

    pub fn set_pass_count(&self, id: BreakpointId, pass: PassCount) -> Result<(), BreakpointError> {
        if pass.style == PassCountStyle::Modulo && pass.threshold == 0 {
            return Err(BreakpointError::InvalidThreshold(0));
        }
        let entry = self.live_entry(id)?;
        let _edit = entry.edit_lock.lock();
        let _critical = self.critical.lock();
        let _pause = self.run_state.artificial_break()?;
        self.apply_pass_count(&entry, pass)
    }

    pub fn set_condition(&self, id: BreakpointId, condition: Condition) -> Result<(), BreakpointError> {
        let entry = self.live_entry(id)?;
        let _edit = entry.edit_lock.lock();
        let _critical = self.critical.lock();
        let _pause = self.run_state.artificial_break()?;
        self.apply_condition(&entry, &condition)
    }

    /// Only resetting to zero is possible.
    pub fn set_hit_count(&self, id: BreakpointId, hits: u32) -> Result<(), BreakpointError> {
        if hits != 0 {
            return Err(BreakpointError::Rejected(
                "hit counts can only be reset to zero".to_string(),
            ));
        }
        let entry = self.live_entry(id)?;
        let _edit = entry.edit_lock.lock();
        let _critical = self.critical.lock();
        let _pause = self.run_state.artificial_break()?;
        self.reset_hit_count(&entry, true)
    }

    pub fn enable(&self, id: BreakpointId, enabled: bool) -> Result<(), BreakpointError> {
        let entry = self.live_entry(id)?;
        let _edit = entry.edit_lock.lock();
        let _pause = self.run_state.artificial_break()?;
        self.apply_enable(&entry, enabled)
    }

    pub fn enable_pending(&self, pending_id: PendingId, enabled: bool) -> Result<(), BreakpointError> {
        let children = {
            let mut table = self.table();
            let pending = table
                .pending
                .get_mut(&pending_id)
                .ok_or(BreakpointError::UnknownId(pending_id))?;
            pending.enabled = enabled;
            pending.bound.clone()
        };
        for id in children {
            self.enable(id, enabled)?;
        }
        Ok(())
    }

    pub fn delete(&self, id: BreakpointId) -> Result<(), BreakpointError> {
        let entry = self.live_entry(id)?;
        let _edit = entry.edit_lock.lock();
        let _critical = self.critical.lock();
        let _pause = self.run_state.artificial_break()?;
        let gdb_id = {
            let mut data = entry.data();
            data.deleted = true;
            data.gdb_id
        };
        if self.gdb.monitor().is_connected() {
            self.send_delete(gdb_id);
        }
        self.forget(&entry, gdb_id);
        info!("Deleted breakpoint {}", gdb_id);
        Ok(())
    }

    fn forget(&self, entry: &BoundEntry, gdb_id: u32) {
        let mut table = self.table();
        table.bound.remove(&entry.id);
        if table.by_gdb_id.get(&gdb_id) == Some(&entry.id) {
            table.by_gdb_id.remove(&gdb_id);
        }
        if let Some(parent) = table.pending.get_mut(&entry.pending_id) {
            parent.bound.retain(|b| *b != entry.id);
        }
    }

    /// Delete a pending breakpoint and every location bound from it.
    pub fn delete_pending(&self, pending_id: PendingId) -> Result<(), BreakpointError> {
        let children = {
            let mut table = self.table();
            let pending = table
                .pending
                .get_mut(&pending_id)
                .ok_or(BreakpointError::UnknownId(pending_id))?;
            pending.deleted = true;
            pending.bound.clone()
        };
        for id in children {
            match self.delete(id) {
                Ok(()) | Err(BreakpointError::Deleted(_)) | Err(BreakpointError::UnknownId(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.table().pending.remove(&pending_id);
        Ok(())
    }

    /// GDB deleted a breakpoint on its own (e.g. a temporary one).
    pub fn on_deleted_by_gdb(&self, gdb_id: u32) {
        let entry = {
            let table = self.table();
            table
                .by_gdb_id
                .get(&gdb_id)
                .and_then(|id| table.bound.get(id))
                .cloned()
        };
        if let Some(entry) = entry {
            entry.data().deleted = true;
            self.forget(&entry, gdb_id);
        }
    }

    /// Take `times` from `=breakpoint-modified` as the hit count, except in
    /// break-when-changed mode where hits are counted locally.
    pub fn record_hit_count(&self, gdb_id: u32, times: u32) {
        let entry = {
            let table = self.table();
            table
                .by_gdb_id
                .get(&gdb_id)
                .and_then(|id| table.bound.get(id))
                .cloned()
        };
        if let Some(entry) = entry {
            // Edits read the hit count inside the critical region
            let _critical = self.critical.lock();
            let mut data = entry.data();
            if data.condition.style != ConditionStyle::WhenChanged {
                data.hit_count = times;
            }
        }
    }

    /// Decide whether a stop at GDB breakpoint `gdb_id` is presented to the
    /// user, re-arming the ignore count for the next hit.
    pub fn on_hit(&self, gdb_id: u32) -> HitDecision {
        let entry = {
            let table = self.table();
            table
                .by_gdb_id
                .get(&gdb_id)
                .and_then(|id| table.bound.get(id))
                .cloned()
        };
        let Some(entry) = entry else {
            debug!("Hit on unknown breakpoint {}", gdb_id);
            return HitDecision::Ignored;
        };
        if entry.data().deleted {
            return HitDecision::Ignored;
        }
        // An edit is in flight: do not evaluate, just let it run
        let Some(_edit) = entry.edit_lock.try_lock() else {
            debug!("Breakpoint {} is being edited, skipping hit", gdb_id);
            return HitDecision::Continue;
        };
        let _critical = self.critical.lock();

        let (condition, pass, hits, previous) = {
            let data = entry.data();
            if data.deleted {
                return HitDecision::Ignored;
            }
            (data.condition.clone(), data.pass, data.hit_count, data.previous_value.clone())
        };

        if condition.style == ConditionStyle::WhenChanged {
            let current = self.evaluator.evaluate(&condition.expression, None);
            if !current.valid {
                debug!("Condition `{}` not evaluable: {}", condition.expression, current.value);
                return HitDecision::Continue;
            }
            if previous.as_deref() == Some(current.value.as_str()) {
                return HitDecision::Continue;
            }
            let mut data = entry.data();
            data.previous_value = Some(current.value);
            data.hit_count += 1;
            return if pass.should_stop(data.hit_count) {
                HitDecision::Stop
            } else {
                HitDecision::Continue
            };
        }

        if !pass.should_stop(hits) {
            return HitDecision::Continue;
        }
        match pass.style {
            PassCountStyle::Equal | PassCountStyle::Modulo => {
                if let Err(e) = self.apply_pass_count(&entry, pass) {
                    warn!("Failed to re-arm breakpoint {}: {}", gdb_id, e);
                }
            }
            PassCountStyle::None | PassCountStyle::EqualOrGreater => {}
        }
        HitDecision::Stop
    }

    pub fn hit_count(&self, id: BreakpointId) -> Result<u32, BreakpointError> {
        Ok(self.live_entry(id)?.data().hit_count)
    }

    pub fn state(&self, id: BreakpointId) -> BreakpointStatus {
        match self.entry(id) {
            Ok(entry) => {
                let data = entry.data();
                if data.deleted {
                    BreakpointStatus::Deleted
                } else if data.enabled {
                    BreakpointStatus::Enabled
                } else {
                    BreakpointStatus::Disabled
                }
            }
            Err(_) => BreakpointStatus::Deleted,
        }
    }

    pub fn get(&self, id: BreakpointId) -> Result<BoundBreakpoint, BreakpointError> {
        Ok(self.live_entry(id)?.snapshot())
    }

    pub fn list(&self) -> Vec<BoundBreakpoint> {
        let entries: Vec<Arc<BoundEntry>> = self.table().bound.values().cloned().collect();
        let mut list: Vec<BoundBreakpoint> = entries.iter().map(|e| e.snapshot()).collect();
        list.sort_by_key(|b| b.id);
        list
    }

    pub fn is_empty(&self) -> bool {
        self.table().bound.is_empty()
    }

    /// Program teardown: every breakpoint goes away without GDB round-trips.
    pub fn clear(&self) {
        let mut table = self.table();
        for entry in table.bound.values() {
            entry.data().deleted = true;
        }
        table.bound.clear();
        table.by_gdb_id.clear();
        table.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdb::testing::ScriptedGdb;
    use crate::gdb::GdbConfig;
    use std::thread;
    use std::time::Duration;

    const BKPT_4: &str = r#"^done,bkpt={number="4",type="breakpoint",disp="keep",enabled="y",addr="0x401136",func="tick",file="loop.c",fullname="/w/loop.c",line="9",times="0"}"#;

    fn coordinator() -> (Arc<ScriptedGdb>, Arc<RunStateTracker>, BreakpointCoordinator) {
        let gdb = ScriptedGdb::new();
        gdb.on("break-insert", BKPT_4);
        gdb.on("exec-", "^running");
        gdb.on("exec-interrupt", "^done");
        gdb.on("exec-arguments", "^done");
        let config = GdbConfig {
            interrupt_timeout_ms: 20,
            ..Default::default()
        };
        let run_state = Arc::new(RunStateTracker::new(gdb.clone(), &config));
        let evaluator = Arc::new(VariableEvaluator::new(gdb.clone(), &config));
        let coordinator = BreakpointCoordinator::new(gdb.clone(), Arc::clone(&run_state), evaluator);
        (gdb, run_state, coordinator)
    }

    fn file_line() -> BreakpointRequest {
        BreakpointRequest::new(BreakpointLocation::FileLine {
            file: "/w/loop.c".to_string(),
            line: 9,
        })
    }

    fn hits(coordinator: &BreakpointCoordinator, gdb_id: u32, range: std::ops::RangeInclusive<u32>) -> Vec<u32> {
        range
            .filter(|&hit| {
                coordinator.record_hit_count(gdb_id, hit);
                coordinator.on_hit(gdb_id) == HitDecision::Stop
            })
            .collect()
    }

    #[test]
    fn test_compute_ignore_styles() {
        let equal = PassCount::new(PassCountStyle::Equal, 5);
        assert_eq!(compute_ignore(&equal, 2, false), IgnoreCount::StopOn(3));
        assert_eq!(compute_ignore(&equal, 5, false), IgnoreCount::Never);
        assert_eq!(compute_ignore(&equal, 7, false), IgnoreCount::Never);

        let at_least = PassCount::new(PassCountStyle::EqualOrGreater, 5);
        assert_eq!(compute_ignore(&at_least, 2, false), IgnoreCount::StopOn(3));
        assert_eq!(compute_ignore(&at_least, 9, false), IgnoreCount::StopOn(1));

        let modulo = PassCount::new(PassCountStyle::Modulo, 3);
        assert_eq!(compute_ignore(&modulo, 0, false), IgnoreCount::StopOn(3));
        assert_eq!(compute_ignore(&modulo, 4, false), IgnoreCount::StopOn(2));
        assert_eq!(compute_ignore(&modulo, 4, true), IgnoreCount::StopOn(1));

        assert_eq!(IgnoreCount::StopOn(3).gdb_ignore(), 2);
        assert_eq!(IgnoreCount::Never.gdb_ignore(), 2147483647);
    }

    #[test]
    fn test_bind_file_line() {
        let (gdb, _run_state, coordinator) = coordinator();
        let bp = coordinator.bind_request(file_line()).unwrap();
        assert_eq!(bp.gdb_id, 4);
        assert_eq!(bp.line, Some(9));
        assert_eq!(gdb.sent(), vec!["break-insert -f \"/w/loop.c:9\"".to_string()]);
        assert_eq!(coordinator.state(bp.id), BreakpointStatus::Enabled);
    }

    #[test]
    fn test_bind_retries_short_name_when_pending() {
        let (gdb, _run_state, coordinator) = coordinator();
        gdb.once(
            "break-insert",
            r#"^done,bkpt={number="2",type="breakpoint",disp="keep",enabled="y",addr="<PENDING>",pending="/w/loop.c:9",times="0"}"#,
        );
        let bp = coordinator.bind_request(file_line()).unwrap();
        assert_eq!(bp.gdb_id, 4);
        assert_eq!(
            gdb.sent(),
            vec![
                "break-insert -f \"/w/loop.c:9\"".to_string(),
                "break-delete 2".to_string(),
                "break-insert -f \"loop.c:9\"".to_string(),
            ]
        );
    }

    #[test]
    fn test_unsupported_location_fails_without_gdb() {
        let (gdb, _run_state, coordinator) = coordinator();
        let request = BreakpointRequest::new(BreakpointLocation::Address {
            address: "0x400000".to_string(),
        });
        assert_eq!(
            coordinator.bind_request(request).unwrap_err(),
            BindFailure::UnsupportedLocation("address".to_string())
        );
        assert!(gdb.sent().is_empty());
    }

    #[test]
    fn test_bind_under_deleted_parent_fails() {
        let (_gdb, _run_state, coordinator) = coordinator();
        let pending = coordinator.create_pending(file_line());
        coordinator.delete_pending(pending).unwrap();
        assert_eq!(coordinator.bind(pending).unwrap_err(), BindFailure::ParentDeleted);
    }

    #[test]
    fn test_bind_without_process_fails() {
        let (gdb, _run_state, coordinator) = coordinator();
        gdb.monitor().set_connected(false);
        assert_eq!(
            coordinator.bind_request(file_line()).unwrap_err(),
            BindFailure::NoActiveProcess
        );
    }

    #[test]
    fn test_gdb_rejection_is_reported() {
        let (gdb, _run_state, coordinator) = coordinator();
        gdb.once("break-insert", r#"^error,msg="No source file named nope.c.""#);
        assert_eq!(
            coordinator.bind_request(file_line()).unwrap_err(),
            BindFailure::Rejected("No source file named nope.c.".to_string())
        );
    }

    #[test]
    fn test_modulo_three_stops_on_multiples() {
        let (gdb, _run_state, coordinator) = coordinator();
        let bp = coordinator.bind_request(file_line()).unwrap();
        coordinator
            .set_pass_count(bp.id, PassCount::new(PassCountStyle::Modulo, 3))
            .unwrap();
        assert_eq!(gdb.sent_matching("break-after"), vec!["break-after 4 2".to_string()]);
        assert_eq!(hits(&coordinator, 4, 1..=6), vec![3, 6]);
    }

    #[test]
    fn test_equal_stops_once_then_never() {
        let (gdb, _run_state, coordinator) = coordinator();
        let bp = coordinator.bind_request(file_line()).unwrap();
        coordinator
            .set_pass_count(bp.id, PassCount::new(PassCountStyle::Equal, 2))
            .unwrap();
        assert_eq!(hits(&coordinator, 4, 1..=5), vec![2]);
        assert_eq!(
            gdb.sent_matching("break-after").last().map(String::as_str),
            Some("break-after 4 2147483647")
        );
        assert_eq!(coordinator.get(bp.id).unwrap().ignore, IgnoreCount::Never);
    }

    #[test]
    fn test_equal_below_current_hits_never_stops() {
        let (gdb, _run_state, coordinator) = coordinator();
        let bp = coordinator.bind_request(file_line()).unwrap();
        coordinator.record_hit_count(4, 6);
        coordinator
            .set_pass_count(bp.id, PassCount::new(PassCountStyle::Equal, 3))
            .unwrap();
        assert_eq!(
            gdb.sent_matching("break-after"),
            vec!["break-after 4 2147483647".to_string()]
        );
    }

    #[test]
    fn test_equal_or_greater_then_delete_ignores_stray_hit() {
        let (_gdb, _run_state, coordinator) = coordinator();
        let bp = coordinator.bind_request(file_line()).unwrap();
        coordinator
            .set_pass_count(bp.id, PassCount::new(PassCountStyle::EqualOrGreater, 5))
            .unwrap();
        assert_eq!(hits(&coordinator, 4, 1..=5), vec![5]);
        coordinator.delete(bp.id).unwrap();
        assert!(coordinator.is_empty());
        assert_eq!(coordinator.on_hit(4), HitDecision::Ignored);
        assert_eq!(coordinator.state(bp.id), BreakpointStatus::Deleted);
    }

    #[test]
    fn test_break_when_changed_suppresses_same_value() {
        let (gdb, _run_state, coordinator) = coordinator();
        gdb.once("data-evaluate-expression", r#"^done,value="1""#);
        let bp = coordinator.bind_request(file_line()).unwrap();
        coordinator
            .set_condition(
                bp.id,
                Condition {
                    style: ConditionStyle::WhenChanged,
                    expression: "counter".to_string(),
                },
            )
            .unwrap();
        assert_eq!(gdb.sent_matching("break-condition"), vec!["break-condition 4".to_string()]);
        assert_eq!(gdb.sent_matching("break-after"), vec!["break-after 4 0".to_string()]);

        gdb.once("data-evaluate-expression", r#"^done,value="2""#);
        assert_eq!(coordinator.on_hit(4), HitDecision::Stop);
        gdb.once("data-evaluate-expression", r#"^done,value="2""#);
        assert_eq!(coordinator.on_hit(4), HitDecision::Continue);
        gdb.once("data-evaluate-expression", r#"^done,value="3""#);
        assert_eq!(coordinator.on_hit(4), HitDecision::Stop);
        // GDB's own count does not apply here
        coordinator.record_hit_count(4, 40);
        assert_eq!(coordinator.hit_count(bp.id).unwrap(), 2);
    }

    #[test]
    fn test_condition_change_resets_hits_and_reverifies_pass_count() {
        let (gdb, _run_state, coordinator) = coordinator();
        let bp = coordinator.bind_request(file_line()).unwrap();
        coordinator
            .set_condition(
                bp.id,
                Condition {
                    style: ConditionStyle::WhenChanged,
                    expression: "x".to_string(),
                },
            )
            .unwrap();
        coordinator
            .set_pass_count(bp.id, PassCount::new(PassCountStyle::EqualOrGreater, 4))
            .unwrap();
        gdb.once("data-evaluate-expression", r#"^done,value="9""#);
        coordinator.on_hit(4);
        gdb.clear_sent();
        gdb.on(
            "break-insert",
            r#"^done,bkpt={number="5",type="breakpoint",disp="keep",enabled="y",addr="0x401136",file="loop.c",fullname="/w/loop.c",line="9",times="0"}"#,
        );
        coordinator
            .set_condition(
                bp.id,
                Condition {
                    style: ConditionStyle::WhenTrue,
                    expression: "x > 3".to_string(),
                },
            )
            .unwrap();
        let sent = gdb.sent();
        assert_eq!(sent[0], "break-condition 4 x > 3");
        assert_eq!(sent[1], "break-delete 4");
        assert_eq!(sent[2], "break-insert -f \"/w/loop.c:9\"");
        assert!(sent.contains(&"break-condition 5 x > 3".to_string()));
        // Leaving break-when-changed re-arms the stored pass count
        assert_eq!(sent.last().map(String::as_str), Some("break-after 5 3"));
        let snapshot = coordinator.get(bp.id).unwrap();
        assert_eq!(snapshot.gdb_id, 5);
        assert_eq!(snapshot.hit_count, 0);
        assert_eq!(coordinator.on_hit(4), HitDecision::Ignored);
    }

    #[test]
    fn test_rejected_condition_keeps_previous_state() {
        let (gdb, _run_state, coordinator) = coordinator();
        let bp = coordinator.bind_request(file_line()).unwrap();
        gdb.once("break-condition", r#"^error,msg="No symbol \"nope\" in current context.""#);
        let err = coordinator
            .set_condition(
                bp.id,
                Condition {
                    style: ConditionStyle::WhenTrue,
                    expression: "nope == 1".to_string(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, BreakpointError::Rejected(_)));
        assert_eq!(coordinator.get(bp.id).unwrap().condition, Condition::default());
    }

    #[test]
    fn test_rejected_condition_after_hits_keeps_breakpoint() {
        let (gdb, _run_state, coordinator) = coordinator();
        let bp = coordinator.bind_request(file_line()).unwrap();
        coordinator
            .set_pass_count(bp.id, PassCount::new(PassCountStyle::EqualOrGreater, 5))
            .unwrap();
        coordinator.record_hit_count(4, 3);
        let before = coordinator.get(bp.id).unwrap();
        gdb.clear_sent();
        gdb.once("break-condition", r#"^error,msg="No symbol \"nope\" in current context.""#);
        let err = coordinator
            .set_condition(
                bp.id,
                Condition {
                    style: ConditionStyle::WhenTrue,
                    expression: "nope == 1".to_string(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, BreakpointError::Rejected(_)));
        assert_eq!(coordinator.get(bp.id).unwrap(), before);
        assert_eq!(before.hit_count, 3);
        assert_eq!(before.gdb_id, 4);
        assert!(gdb.sent_matching("break-delete").is_empty());
        assert!(gdb.sent_matching("break-insert").is_empty());
    }

    #[test]
    fn test_hit_count_update_waits_for_edit_in_progress() {
        let (_gdb, _run_state, coordinator) = coordinator();
        let coordinator = Arc::new(coordinator);
        let bp = coordinator.bind_request(file_line()).unwrap();

        let critical = coordinator.critical.lock();
        let updater = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.record_hit_count(4, 3))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(coordinator.get(bp.id).unwrap().hit_count, 0);
        drop(critical);
        updater.join().unwrap();
        assert_eq!(coordinator.get(bp.id).unwrap().hit_count, 3);
    }

    #[test]
    fn test_edit_while_running_interrupts_and_resumes() {
        let (gdb, run_state, coordinator) = coordinator();
        let bp = coordinator.bind_request(file_line()).unwrap();
        run_state.launch(None, &[]).unwrap();
        gdb.clear_sent();
        coordinator
            .set_pass_count(bp.id, PassCount::new(PassCountStyle::EqualOrGreater, 2))
            .unwrap();
        assert_eq!(
            gdb.sent(),
            vec![
                "exec-interrupt".to_string(),
                "break-after 4 1".to_string(),
                "exec-continue --thread-group i1".to_string(),
            ]
        );
        assert_eq!(run_state.state(), RunState::Run);
    }

    #[test]
    fn test_delete_pending_cascades() {
        let (_gdb, _run_state, coordinator) = coordinator();
        let pending = coordinator.create_pending(file_line());
        let bp = coordinator.bind(pending).unwrap();
        coordinator.enable_pending(pending, false).unwrap();
        assert_eq!(coordinator.state(bp.id), BreakpointStatus::Disabled);
        coordinator.delete_pending(pending).unwrap();
        assert!(coordinator.is_empty());
        assert_eq!(coordinator.bind(pending).unwrap_err(), BindFailure::ParentDeleted);
    }

    #[test]
    fn test_hit_count_reset_only_to_zero() {
        let (_gdb, _run_state, coordinator) = coordinator();
        let bp = coordinator.bind_request(file_line()).unwrap();
        coordinator.record_hit_count(4, 3);
        assert!(coordinator.set_hit_count(bp.id, 2).is_err());
        coordinator.set_hit_count(bp.id, 0).unwrap();
        assert_eq!(coordinator.hit_count(bp.id).unwrap(), 0);
    }

    #[test]
    fn test_concurrent_edits_and_hits_stay_consistent() {
        let (gdb, _run_state, coordinator) = coordinator();
        let coordinator = Arc::new(coordinator);
        let bp = coordinator.bind_request(file_line()).unwrap();

        let editor = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                for i in 0..50u32 {
                    let style = match i % 3 {
                        0 => PassCountStyle::Modulo,
                        1 => PassCountStyle::Equal,
                        _ => PassCountStyle::EqualOrGreater,
                    };
                    coordinator
                        .set_pass_count(bp.id, PassCount::new(style, 1 + i % 4))
                        .unwrap();
                }
            })
        };
        let hitter = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                for times in 1..=200u32 {
                    coordinator.record_hit_count(4, times);
                    coordinator.on_hit(4);
                }
            })
        };
        editor.join().unwrap();
        hitter.join().unwrap();

        let snapshot = coordinator.get(bp.id).unwrap();
        assert_eq!(
            snapshot.ignore,
            compute_ignore(&snapshot.pass_count, snapshot.armed_at, false)
        );
        let last = gdb.sent_matching("break-after").pop().unwrap();
        assert_eq!(last, format!("break-after 4 {}", snapshot.ignore.gdb_ignore()));

        // With nothing in flight an edit arms from the authoritative count
        coordinator
            .set_pass_count(bp.id, PassCount::new(PassCountStyle::EqualOrGreater, 300))
            .unwrap();
        let snapshot = coordinator.get(bp.id).unwrap();
        assert_eq!(snapshot.hit_count, 200);
        assert_eq!(snapshot.armed_at, snapshot.hit_count);
        assert_eq!(snapshot.ignore, IgnoreCount::StopOn(100));
    }
}
