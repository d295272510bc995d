//! Expression evaluation and lazy expansion of compound values through
//! short-lived GDB variable objects.

use crate::gdb::parser::{parse_var_children, parse_var_create, quote_mi_string};
use crate::gdb::{GdbConfig, MiChannel, Variable};
use crate::session::threads::StackFrame;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

const ACCESS_SPECIFIERS: [&str; 3] = ["private", "public", "protected"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalResult {
    /// The value, or GDB's error message when `valid` is false.
    pub value: String,
    pub valid: bool,
}

impl EvalResult {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            value: message.into(),
            valid: false,
        }
    }
}

/// A value as shown to the IDE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: String,
    pub value: String,
    pub valid: bool,
    /// Name GDB knows this node by, when it differs from `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gdb_name: Option<String>,
    #[serde(default)]
    pub is_arg: bool,
    /// `None` for leaves. `Some(vec![])` means children exist but have not
    /// been fetched yet.
    #[serde(default)]
    pub children: Option<Vec<VariableInfo>>,
}

impl VariableInfo {
    pub fn leaf(name: impl Into<String>, var_type: impl Into<String>, value: impl Into<String>, valid: bool) -> Self {
        Self {
            name: name.into(),
            var_type: var_type.into(),
            value: value.into(),
            valid,
            gdb_name: None,
            is_arg: false,
            children: None,
        }
    }

    pub fn is_expandable(&self) -> bool {
        self.children.is_some()
    }

    pub fn is_fetched(&self) -> bool {
        self.children.as_ref().is_some_and(|c| !c.is_empty())
    }

    fn is_null_pointer(&self) -> bool {
        self.var_type.contains('*') && self.value == "0x0"
    }
}

/// How child names are spelled relative to their parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentKind {
    Pointer,
    Array,
    Struct,
    StructArray,
    Other,
}

impl ParentKind {
    pub fn classify(var_type: &str) -> Self {
        let var_type = var_type.trim();
        if var_type.contains("struct") {
            if var_type.ends_with('*') {
                ParentKind::Pointer
            } else if var_type.contains('[') {
                ParentKind::StructArray
            } else {
                ParentKind::Struct
            }
        } else if var_type.contains('[') {
            ParentKind::Array
        } else if var_type.contains('*') {
            ParentKind::Pointer
        } else {
            ParentKind::Other
        }
    }
}

/// Translation table from GDB variable-object names to IDE names, scoped
/// to one expansion.
#[derive(Debug, Default)]
struct NameMap {
    entries: Vec<(String, String)>,
}

impl NameMap {
    fn insert(&mut self, gdb_name: &str, ide_name: &str) {
        self.remove(gdb_name);
        self.entries.push((gdb_name.to_string(), ide_name.to_string()));
    }

    fn remove(&mut self, gdb_name: &str) {
        self.entries.retain(|(g, _)| g != gdb_name);
    }

    /// Split a child name into the IDE name of its longest known parent and
    /// the remaining component.
    fn split<'a>(&self, gdb_name: &'a str) -> (String, &'a str) {
        let best = self
            .entries
            .iter()
            .filter(|(g, _)| {
                gdb_name.len() > g.len() + 1
                    && gdb_name.starts_with(g.as_str())
                    && gdb_name.as_bytes()[g.len()] == b'.'
            })
            .max_by_key(|(g, _)| g.len());
        match best {
            Some((g, ide)) => (ide.clone(), &gdb_name[g.len() + 1..]),
            None => match gdb_name.rfind('.') {
                Some(dot) => (gdb_name[..dot].to_string(), &gdb_name[dot + 1..]),
                None => (String::new(), gdb_name),
            },
        }
    }
}

fn is_access_level(gdb_name: &str) -> bool {
    let trimmed = gdb_name.trim_end_matches('"').trim_end_matches('.');
    ACCESS_SPECIFIERS
        .iter()
        .any(|s| trimmed.len() > s.len() && trimmed.ends_with(s) && trimmed.as_bytes()[trimmed.len() - s.len() - 1] == b'.')
}

fn strip_access_segments(component: &str) -> String {
    component
        .split('.')
        .filter(|seg| !seg.is_empty() && !ACCESS_SPECIFIERS.contains(seg))
        .collect::<Vec<_>>()
        .join(".")
}

fn ide_child_name(gdb_name: &str, kind: ParentKind, names: &NameMap) -> String {
    let (parent, rest) = names.split(gdb_name);
    let rest = strip_access_segments(rest);
    if rest.starts_with('*') {
        return format!("*({})", parent);
    }
    if parent.is_empty() {
        return rest;
    }
    match kind {
        ParentKind::Pointer => format!("{}->{}", parent, rest),
        ParentKind::Array | ParentKind::StructArray => format!("{}[{}]", parent, rest),
        ParentKind::Struct | ParentKind::Other => format!("{}.{}", parent, rest),
    }
}

fn needs_evaluation(value: &str) -> bool {
    value.is_empty() || value.contains("{...}") || (value.len() >= 2 && value.starts_with('[') && value.ends_with(']'))
}

/// Drop the NUL padding GDB prints after the end of C strings.
pub fn strip_nul_padding(value: &str) -> String {
    static INLINE: OnceLock<Regex> = OnceLock::new();
    static REPEATS: OnceLock<Regex> = OnceLock::new();
    let inline = INLINE.get_or_init(|| Regex::new(r#"\\000(?:[^"\\]|\\.)*""#).unwrap());
    let repeats = REPEATS.get_or_init(|| Regex::new(r#",? ?'\\000' <repeats \d+ times>"#).unwrap());
    let value = repeats.replace_all(value, "");
    inline.replace_all(&value, "\"").into_owned()
}

/// One step of an expression path: the separator and the component after it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PathStep {
    separator: String,
    component: String,
}

/// Split `a.b->c[i[2]]` into `a` plus steps on `.`, `->` and balanced
/// `[...]` boundaries.
fn split_path(expr: &str) -> (String, Vec<PathStep>) {
    let bytes = expr.as_bytes();
    let mut root = None;
    let mut steps = Vec::new();
    let mut separator = String::new();
    let mut start = 0;
    let mut i = 0;

    let flush = |text: &str, separator: &mut String, root: &mut Option<String>, steps: &mut Vec<PathStep>| {
        if root.is_none() {
            *root = Some(text.to_string());
        } else if !text.is_empty() || !separator.is_empty() {
            steps.push(PathStep {
                separator: std::mem::take(separator),
                component: text.to_string(),
            });
        }
    };

    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                flush(&expr[start..i], &mut separator, &mut root, &mut steps);
                separator = ".".to_string();
                i += 1;
                start = i;
            }
            b'-' if bytes.get(i + 1) == Some(&b'>') => {
                flush(&expr[start..i], &mut separator, &mut root, &mut steps);
                separator = "->".to_string();
                i += 2;
                start = i;
            }
            b'[' => {
                flush(&expr[start..i], &mut separator, &mut root, &mut steps);
                let mut depth = 0;
                let open = i;
                while i < bytes.len() {
                    match bytes[i] {
                        b'[' => depth += 1,
                        b']' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
                let close = (i + 1).min(bytes.len());
                separator = expr[open..close].to_string();
                i = close;
                start = i;
            }
            _ => i += 1,
        }
    }
    flush(&expr[start..], &mut separator, &mut root, &mut steps);
    (root.unwrap_or_default(), steps)
}

/// Variable object created for one expansion.
struct VarObject {
    name: String,
    var_type: String,
    numchild: u32,
    prefixed: bool,
}

pub struct VariableEvaluator {
    gdb: Arc<dyn MiChannel>,
    max_children: usize,
    next_var: AtomicU64,
}

impl VariableEvaluator {
    pub fn new(gdb: Arc<dyn MiChannel>, config: &GdbConfig) -> Self {
        Self {
            gdb,
            max_children: config.max_children,
            next_var: AtomicU64::new(1),
        }
    }

    /// Evaluate `expr` in the selected frame. When GDB refuses the IDE
    /// spelling, `gdb_name` is tried once instead.
    pub fn evaluate(&self, expr: &str, gdb_name: Option<&str>) -> EvalResult {
        let expr = expr.strip_suffix('.').unwrap_or(expr);
        if expr.is_empty() {
            return EvalResult::invalid("");
        }
        let mut result = self.evaluate_once(expr);
        if !result.valid {
            if let Some(alias) = gdb_name.filter(|n| *n != expr) {
                let retry = self.evaluate_once(alias);
                if retry.valid {
                    result = retry;
                }
            }
        }
        if result.valid {
            result.value = strip_nul_padding(&result.value);
        }
        result
    }

    fn evaluate_once(&self, expr: &str) -> EvalResult {
        match self
            .gdb
            .send_command(&format!("data-evaluate-expression {}", quote_mi_string(expr)))
        {
            Ok(response) => match response.error_message() {
                Some(message) => EvalResult::invalid(message),
                None => match response.get_string("value") {
                    Some(value) => EvalResult { value, valid: true },
                    None => EvalResult::invalid(""),
                },
            },
            Err(e) => EvalResult::invalid(e.to_string()),
        }
    }

    /// Evaluate on a worker thread and hand the result to `on_done`.
    pub fn evaluate_async<F>(self: &Arc<Self>, expr: String, on_done: F) -> std::io::Result<JoinHandle<()>>
    where
        F: FnOnce(EvalResult) + Send + 'static,
    {
        let evaluator = Arc::clone(self);
        thread::Builder::new()
            .name("gdb-eval".to_string())
            .spawn(move || on_done(evaluator.evaluate(&expr, None)))
    }

    /// Build the node for a `-stack-list-variables --simple-values` entry.
    /// Aggregates come without a value and are evaluated here.
    pub fn from_stack(&self, var: &Variable) -> VariableInfo {
        let var_type = var.var_type.clone().unwrap_or_default();
        let (value, valid, aggregate) = match &var.value {
            Some(value) => (value.clone(), true, false),
            None => {
                let result = self.evaluate(&var.name, None);
                (result.value, result.valid, true)
            }
        };
        let mut node = VariableInfo::leaf(&var.name, var_type, value, valid);
        node.is_arg = var.is_arg;
        if valid && (aggregate || (node.var_type.contains('*') && node.value != "0x0")) {
            node.children = Some(Vec::new());
        }
        node
    }

    fn create_var(&self, expr: &str) -> Option<VarObject> {
        let plain = !expr.is_empty() && !expr.contains(|c: char| c.is_whitespace() || c == '"');
        if plain {
            if let Some(var) = self.try_create_var(expr, expr) {
                return Some(VarObject { prefixed: false, ..var });
            }
        }
        // GDB rejects some names (leading '_', operators); use a synthesized one
        let name = format!("dbg_{}", self.next_var.fetch_add(1, Ordering::Relaxed));
        self.try_create_var(&name, expr)
            .map(|var| VarObject { prefixed: true, ..var })
    }

    fn try_create_var(&self, name: &str, expr: &str) -> Option<VarObject> {
        let response = self
            .gdb
            .send_command(&format!("var-create {} * {}", name, quote_mi_string(expr)))
            .ok()?;
        if response.is_error() {
            debug!("var-create {} failed: {:?}", name, response.error_message());
            return None;
        }
        let var = parse_var_create(&response.results)?;
        Some(VarObject {
            name: var.name,
            var_type: var.var_type.unwrap_or_default(),
            numchild: var.numchild,
            prefixed: false,
        })
    }

    fn delete_var(&self, name: &str) {
        if let Err(e) = self.gdb.send_command(&format!("var-delete {}", name)) {
            warn!("var-delete {} failed: {}", name, e);
        }
    }

    /// Fetch the children of `node` (one level), replacing any cached ones.
    pub fn expand(&self, node: &mut VariableInfo) {
        let Some(var) = self.create_var(&node.name) else {
            node.children = None;
            return;
        };
        if var.prefixed {
            node.gdb_name = Some(var.name.clone());
        }
        if node.var_type.is_empty() {
            node.var_type = var.var_type.clone();
        }
        let mut children = Vec::new();
        if var.numchild > 0 {
            let mut names = NameMap::default();
            names.insert(&var.name, &node.name);
            self.list_children(&var.name, ParentKind::classify(&node.var_type), &mut names, &mut children);
        }
        self.delete_var(&var.name);
        node.children = if children.is_empty() && var.numchild == 0 {
            None
        } else {
            Some(children)
        };
    }

    fn list_children(&self, gdb_parent: &str, kind: ParentKind, names: &mut NameMap, out: &mut Vec<VariableInfo>) {
        let command = format!("var-list-children --all-values {} 0 {}", gdb_parent, self.max_children);
        let response = match self.gdb.send_command(&command) {
            Ok(r) if !r.is_error() => r,
            Ok(r) => {
                debug!("Listing children of {} failed: {:?}", gdb_parent, r.error_message());
                return;
            }
            Err(e) => {
                warn!("Listing children of {} failed: {}", gdb_parent, e);
                return;
            }
        };

        for child in parse_var_children(&response.results) {
            if child.name.contains("::") {
                continue;
            }
            if is_access_level(&child.name) {
                // Synthetic public/private/protected level: its children
                // belong to the same IDE parent
                let (parent_ide, _) = names.split(&child.name);
                names.insert(&child.name, &parent_ide);
                self.list_children(&child.name, kind, names, out);
                names.remove(&child.name);
                continue;
            }

            let ide_name = ide_child_name(&child.name, kind, names);
            let raw_value = child.value.clone().unwrap_or_default();
            let (value, valid) = if needs_evaluation(&raw_value) {
                let result = self.evaluate(&ide_name, Some(&child.name));
                (result.value, result.valid)
            } else {
                (strip_nul_padding(&raw_value), true)
            };
            let mut node = VariableInfo::leaf(ide_name, child.var_type.clone().unwrap_or_default(), value, valid);
            node.gdb_name = Some(child.name.clone());
            if valid && child.numchild > 0 && node.value != "0x0" {
                node.children = Some(Vec::new());
            }
            out.push(node);
        }
    }

    /// Resolve `expr` against the locals, arguments and cached children of
    /// `frame`, evaluating fresh whatever is not cached.
    pub fn resolve(&self, expr: &str, frame: &mut StackFrame) -> VariableInfo {
        let expr = expr.trim();
        let (root, steps) = split_path(expr);
        let mut search = root.clone();
        let mut is_root = true;
        let mut consumed = 0;

        let mut node = frame
            .locals
            .iter_mut()
            .chain(frame.args.iter_mut())
            .find(|v| v.name == search);

        while let Some(current) = node.take() {
            if consumed == steps.len() {
                node = Some(current);
                break;
            }
            let step = &steps[consumed];
            let candidate = format!("{}{}{}", search, step.separator, step.component);
            if current.is_expandable() && !current.is_fetched() {
                self.expand(current);
            }
            let found = current
                .children
                .as_mut()
                .and_then(|children| children.iter_mut().find(|c| c.name == candidate));
            match found {
                Some(child) => {
                    search = candidate;
                    consumed += 1;
                    is_root = false;
                    node = Some(child);
                }
                None => {
                    node = None;
                    break;
                }
            }
        }

        match node {
            Some(cached) => {
                let result = self.evaluate(&search, cached.gdb_name.as_deref());
                let changed = cached.value != result.value;
                cached.value = result.value;
                cached.valid = result.valid;
                if cached.is_null_pointer() || !cached.valid {
                    cached.children = None;
                } else if (changed || !is_root)
                    && (cached.is_expandable() || cached.var_type.contains('*'))
                {
                    self.expand(cached);
                }
                cached.clone()
            }
            None => self.resolve_fresh(expr),
        }
    }

    fn resolve_fresh(&self, expr: &str) -> VariableInfo {
        let result = self.evaluate(expr, None);
        if !result.valid {
            return VariableInfo::leaf(expr, "", result.value, false);
        }
        let Some(var) = self.create_var(expr) else {
            return VariableInfo::leaf(expr, "", result.value, true);
        };
        let mut node = VariableInfo::leaf(expr, var.var_type.clone(), result.value, true);
        if var.prefixed {
            node.gdb_name = Some(var.name.clone());
        }
        if var.numchild > 0 && !node.is_null_pointer() {
            let mut names = NameMap::default();
            names.insert(&var.name, expr);
            let mut children = Vec::new();
            self.list_children(&var.name, ParentKind::classify(&node.var_type), &mut names, &mut children);
            node.children = Some(children);
        }
        self.delete_var(&var.name);
        node
    }
}
