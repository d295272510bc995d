//! Thread list and per-thread stack frame cache.

use crate::error::SessionError;
use crate::gdb::parser::{parse_stack_frames, parse_stack_variables, parse_thread_info};
use crate::gdb::{Frame, GdbConfig, InferiorMonitor, MiChannel, ResultClass, Thread, ThreadState};
use crate::session::variables::{VariableEvaluator, VariableInfo};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Compiler-generated locals hidden from the IDE.
const HIDDEN_VARIABLES: [&str; 1] = ["__func__"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub level: u32,
    pub addr: String,
    pub function: Option<String>,
    pub file: Option<String>,
    pub fullname: Option<String>,
    pub line: Option<u32>,
    pub locals: Vec<VariableInfo>,
    pub args: Vec<VariableInfo>,
}

impl StackFrame {
    fn same_function(&self, frame: &Frame) -> bool {
        self.level == frame.level && self.function == frame.func && self.file == frame.file
    }

    fn update_position(&mut self, frame: &Frame) {
        self.addr = frame.addr.clone();
        self.fullname = frame.fullname.clone();
        self.line = frame.line;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub id: String,
    pub target_id: String,
    pub name: String,
    pub state: ThreadState,
    pub priority: String,
    pub suspend_count: u32,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// GDB reports no scheduling priority.
const DEFAULT_PRIORITY: &str = "Normal";

/// Threads in the order of the last refresh, and the index of the current one.
pub type ThreadList = (Vec<Arc<DebugThread>>, Option<usize>);

#[derive(Debug)]
struct ThreadData {
    id: String,
    target_id: String,
    name: String,
    state: ThreadState,
    location: Option<Frame>,
    suspend_count: u32,
    frames: Option<Vec<StackFrame>>,
    /// Frame-info flags of the last served request; zero when nothing is cached.
    evaluated: u32,
}

/// One inferior thread. Kept across refreshes while the thread count is
/// stable, so holders of the `Arc` see the patched fields.
#[derive(Debug)]
pub struct DebugThread {
    data: Mutex<ThreadData>,
}

impl DebugThread {
    fn new(thread: Thread) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(ThreadData {
                name: Self::display_name(&thread.id, thread.name.as_deref()),
                id: thread.id,
                target_id: thread.target_id,
                state: thread.state,
                location: thread.frame,
                suspend_count: 0,
                frames: None,
                evaluated: 0,
            }),
        })
    }

    fn display_name(id: &str, name: Option<&str>) -> String {
        if id == "1" {
            "Main Thread".to_string()
        } else {
            match name {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => "<No Name>".to_string(),
            }
        }
    }

    fn data(&self) -> MutexGuard<'_, ThreadData> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn patch(&self, fresh: Thread) {
        let mut data = self.data();
        if data.id != fresh.id {
            data.frames = None;
            data.evaluated = 0;
            data.suspend_count = 0;
        }
        data.name = Self::display_name(&fresh.id, fresh.name.as_deref());
        data.id = fresh.id;
        data.target_id = fresh.target_id;
        data.state = fresh.state;
        data.location = fresh.frame;
    }

    pub fn id(&self) -> String {
        self.data().id.clone()
    }

    /// Suspension is bookkeeping only; GDB keeps running every thread.
    pub fn suspend(&self) -> u32 {
        let mut data = self.data();
        data.suspend_count += 1;
        data.suspend_count
    }

    pub fn resume(&self) -> u32 {
        let mut data = self.data();
        data.suspend_count = data.suspend_count.saturating_sub(1);
        data.suspend_count
    }

    pub fn summary(&self) -> ThreadSummary {
        let data = self.data();
        ThreadSummary {
            id: data.id.clone(),
            target_id: data.target_id.clone(),
            name: data.name.clone(),
            state: data.state.clone(),
            priority: DEFAULT_PRIORITY.to_string(),
            suspend_count: data.suspend_count,
            function: data.location.as_ref().and_then(|f| f.func.clone()),
            file: data
                .location
                .as_ref()
                .and_then(|f| f.fullname.clone().or_else(|| f.file.clone())),
            line: data.location.as_ref().and_then(|f| f.line),
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    threads: Vec<Arc<DebugThread>>,
    current: Option<String>,
    dirty: bool,
}

impl CacheInner {
    fn thread(&self, id: &str) -> Result<Arc<DebugThread>, SessionError> {
        self.threads
            .iter()
            .find(|t| t.data().id == id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownThread(id.to_string()))
    }

    fn listing(&self) -> ThreadList {
        let current = self
            .current
            .as_deref()
            .and_then(|id| self.threads.iter().position(|t| t.data().id == id));
        (self.threads.clone(), current)
    }
}

pub struct ThreadCache {
    gdb: Arc<dyn MiChannel>,
    monitor: Arc<InferiorMonitor>,
    evaluator: Arc<VariableEvaluator>,
    max_frames: usize,
    inner: Mutex<CacheInner>,
}

impl ThreadCache {
    pub fn new(gdb: Arc<dyn MiChannel>, evaluator: Arc<VariableEvaluator>, config: &GdbConfig) -> Self {
        let monitor = gdb.monitor();
        Self {
            gdb,
            monitor,
            evaluator,
            max_frames: config.max_stack_frames.max(1),
            inner: Mutex::new(CacheInner {
                dirty: true,
                ..Default::default()
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn thread(&self, id: &str) -> Result<Arc<DebugThread>, SessionError> {
        self.inner().thread(id)
    }

    /// Thread creation/exit seen: the next refresh must ask GDB.
    pub fn mark_threads_dirty(&self) {
        self.inner().dirty = true;
    }

    pub fn current_thread(&self) -> Option<String> {
        self.inner().current.clone()
    }

    /// Re-read the thread list. A changed thread count replaces the list;
    /// otherwise the existing threads are patched in place. `None` when GDB
    /// answers with no threads or an unreadable list; the cache is left as is.
    pub fn refresh_threads(&self) -> Result<Option<ThreadList>, SessionError> {
        {
            let inner = self.inner();
            if !inner.dirty && !inner.threads.is_empty() {
                return Ok(Some(inner.listing()));
            }
        }
        let response = self.gdb.send_expect("thread-info", ResultClass::Done)?;
        let Some((threads, current)) = parse_thread_info(&response.results) else {
            warn!("Unreadable thread list: {}", response.raw);
            return Ok(None);
        };
        if threads.is_empty() {
            debug!("GDB reports no threads");
            return Ok(None);
        }

        let mut inner = self.inner();
        if inner.threads.len() != threads.len() {
            debug!("Thread count {} -> {}", inner.threads.len(), threads.len());
            inner.threads = threads.into_iter().map(DebugThread::new).collect();
        } else {
            for (cached, fresh) in inner.threads.iter().zip(threads) {
                cached.patch(fresh);
            }
        }
        if let Some(current) = current {
            self.monitor.set_current_thread(current.clone());
            inner.current = Some(current);
        }
        inner.dirty = false;
        Ok(Some(inner.listing()))
    }

    /// Summaries of the cached threads, without asking GDB.
    pub fn summaries(&self) -> Vec<ThreadSummary> {
        self.inner().threads.iter().map(|t| t.summary()).collect()
    }

    /// Stack frames of `thread_id`. A repeat request with the same `flags`
    /// is answered from the cache.
    pub fn get_frames(&self, thread_id: &str, flags: u32) -> Result<Vec<StackFrame>, SessionError> {
        let current = self.current_thread();
        let thread = self.thread(thread_id)?;
        let previous = {
            let mut data = thread.data();
            if let Some(frames) = data.frames.as_ref().filter(|_| data.evaluated == flags) {
                return Ok(frames.clone());
            }
            data.frames.take().unwrap_or_default()
        };

        let switch = current.as_deref() != Some(thread_id);
        if switch {
            self.gdb
                .send_expect(&format!("thread-select {}", thread_id), ResultClass::Done)?;
        }
        let result = self.load_frames(thread_id, previous);
        if switch {
            if let Some(current) = current.as_deref() {
                if let Err(e) = self
                    .gdb
                    .send_expect(&format!("thread-select {}", current), ResultClass::Done)
                {
                    warn!("Failed to restore thread {}: {}", current, e);
                }
            }
        }
        let frames = result?;

        let mut data = thread.data();
        data.frames = Some(frames.clone());
        data.evaluated = flags;
        Ok(frames)
    }

    fn load_frames(&self, thread_id: &str, mut previous: Vec<StackFrame>) -> Result<Vec<StackFrame>, SessionError> {
        let response = self.gdb.send_expect(
            &format!("stack-list-frames 0 {}", self.max_frames - 1),
            ResultClass::Done,
        )?;
        let mut frames = Vec::new();
        for frame in parse_stack_frames(&response.results).into_iter().take(self.max_frames) {
            let reuse = previous
                .iter()
                .position(|p| p.same_function(&frame))
                .map(|i| previous.swap_remove(i));
            let stack_frame = match reuse {
                Some(mut cached) => {
                    cached.update_position(&frame);
                    cached
                }
                None => self.new_frame(thread_id, &frame)?,
            };
            frames.push(stack_frame);
        }
        Ok(frames)
    }

    fn new_frame(&self, thread_id: &str, frame: &Frame) -> Result<StackFrame, SessionError> {
        let response = self.gdb.send_command(&format!(
            "stack-list-variables --thread {} --frame {} --simple-values",
            thread_id, frame.level
        ))?;
        let mut locals = Vec::new();
        let mut args = Vec::new();
        if let Some(message) = response.error_message() {
            debug!("No variables for frame {}: {}", frame.level, message);
        } else {
            for var in parse_stack_variables(&response.results) {
                if HIDDEN_VARIABLES.contains(&var.name.as_str()) {
                    continue;
                }
                let node = self.evaluator.from_stack(&var);
                if var.is_arg {
                    args.push(node);
                } else {
                    locals.push(node);
                }
            }
        }
        Ok(StackFrame {
            level: frame.level,
            addr: frame.addr.clone(),
            function: frame.func.clone(),
            file: frame.file.clone(),
            fullname: frame.fullname.clone(),
            line: frame.line,
            locals,
            args,
        })
    }

    /// Run `f` on a cached frame, loading the thread's frames first if needed.
    pub fn with_frame<R>(
        &self,
        thread_id: &str,
        level: u32,
        f: impl FnOnce(&mut StackFrame) -> R,
    ) -> Result<R, SessionError> {
        let thread = self.thread(thread_id)?;
        let needs_load = thread.data().frames.is_none();
        if needs_load {
            self.get_frames(thread_id, 0)?;
        }
        let mut data = thread.data();
        let frame = data
            .frames
            .as_mut()
            .and_then(|frames| frames.iter_mut().find(|f| f.level == level))
            .ok_or_else(|| SessionError::InvalidState {
                operation: "select frame",
                state: format!("thread {} has no frame {}", thread_id, level),
            })?;
        Ok(f(frame))
    }

    /// Forget which frame-info requests were served, keeping the frames.
    pub fn clean_evaluated(&self) {
        for thread in self.inner().threads.iter() {
            thread.data().evaluated = 0;
        }
    }

    /// Drop every cached frame. Done before entering break mode.
    pub fn reset_frames(&self) {
        for thread in self.inner().threads.iter() {
            let mut data = thread.data();
            data.frames = None;
            data.evaluated = 0;
        }
    }

    /// Record where the current thread stopped.
    pub fn set_current_location(&self, file: Option<String>, line: Option<u32>) {
        let inner = self.inner();
        let Some(current) = inner.current.as_deref() else {
            return;
        };
        if let Ok(thread) = inner.thread(current) {
            let mut data = thread.data();
            let location = data.location.get_or_insert_with(Frame::default);
            location.fullname = file;
            location.line = line;
        }
    }

    pub fn set_current_thread(&self, thread_id: &str) -> Result<(), SessionError> {
        {
            let inner = self.inner();
            if inner.current.as_deref() == Some(thread_id) {
                return Ok(());
            }
            inner.thread(thread_id)?;
        }
        self.gdb
            .send_expect(&format!("thread-select {}", thread_id), ResultClass::Done)?;
        self.monitor.set_current_thread(thread_id.to_string());
        self.inner().current = Some(thread_id.to_string());
        Ok(())
    }

    /// Function at the top of `thread_id`'s stack, from the last refresh.
    pub fn function_name(&self, thread_id: &str) -> Result<Option<String>, SessionError> {
        let thread = self.thread(thread_id)?;
        let data = thread.data();
        Ok(data.location.as_ref().and_then(|f| f.func.clone()))
    }

    pub fn stack_depth(&self, thread_id: &str) -> Result<usize, SessionError> {
        let response = self.gdb.send_expect(
            &format!("stack-info-depth --thread {}", thread_id),
            ResultClass::Done,
        )?;
        Ok(response
            .get_string("depth")
            .and_then(|d| d.parse().ok())
            .unwrap_or(0))
    }

    pub fn clear(&self) {
        let mut inner = self.inner();
        inner.threads.clear();
        inner.current = None;
        inner.dirty = true;
    }
}
