//! GDB Machine Interface (MI) Parser
//!
//! Parses GDB/MI output into structured Rust types.

use crate::error::TransportError;
use crate::gdb::types::*;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

type ParseResult<T> = std::result::Result<T, TransportError>;

fn malformed(what: &str, input: &str) -> TransportError {
    TransportError::Malformed(format!("{}: {}", what, input))
}

/// GDB/MI Parser
pub struct MiParser {
    // Token, record marker, class and optional results
    record_pattern: Regex,
    // ~"...", @"...", &"..."
    stream_pattern: Regex,
}

impl MiParser {
    pub fn new() -> Self {
        Self {
            record_pattern: Regex::new(r"^(\d*)([\^*+=])([A-Za-z0-9_-]+)(?:,(.*))?$").unwrap(),
            stream_pattern: Regex::new(r#"^([~@&])(".*")$"#).unwrap(),
        }
    }

    /// Parse a single line of GDB/MI output. Prompt and blank lines yield `None`.
    pub fn parse_line(&self, line: &str) -> ParseResult<Option<MiOutputRecord>> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || line.trim() == "(gdb)" {
            return Ok(None);
        }

        if let Some(caps) = self.record_pattern.captures(line) {
            let token = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
            let class = &caps[3];
            let results = match caps.get(4) {
                Some(m) => parse_results(m.as_str())?,
                None => Vec::new(),
            };
            let record = match &caps[2] {
                "^" => MiOutputRecord::Result {
                    token,
                    class: parse_result_class(class)?,
                    results,
                },
                "*" => match class {
                    "stopped" => MiOutputRecord::Async {
                        token,
                        class: AsyncClass::Stopped,
                        results,
                    },
                    "running" => MiOutputRecord::Async {
                        token,
                        class: AsyncClass::Running,
                        results,
                    },
                    other => return Err(malformed("unknown async class", other)),
                },
                "+" => MiOutputRecord::Status {
                    class: class.to_string(),
                    results,
                },
                _ => MiOutputRecord::Notification {
                    class: NotificationClass::from(class),
                    results,
                },
            };
            return Ok(Some(record));
        }

        if let Some(caps) = self.stream_pattern.captures(line) {
            let (content, rest) = parse_c_string(&caps[2])?;
            if !rest.is_empty() {
                return Err(malformed("trailing text after stream record", line));
            }
            let record = match &caps[1] {
                "~" => MiOutputRecord::Console(content),
                "@" => MiOutputRecord::Target(content),
                _ => MiOutputRecord::Log(content),
            };
            return Ok(Some(record));
        }

        // Inferior output that bypassed the MI channel
        Ok(Some(MiOutputRecord::Target(line.to_string())))
    }
}

impl Default for MiParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_result_class(s: &str) -> ParseResult<ResultClass> {
    match s {
        "done" => Ok(ResultClass::Done),
        "running" => Ok(ResultClass::Running),
        "connected" => Ok(ResultClass::Connected),
        "error" => Ok(ResultClass::Error),
        "exit" => Ok(ResultClass::Exit),
        _ => Err(malformed("unknown result class", s)),
    }
}

/// Parse a comma separated `variable=value` sequence.
pub fn parse_results(input: &str) -> ParseResult<Vec<MiResult>> {
    let mut results = Vec::new();
    let mut current = input;
    while !current.is_empty() {
        let (result, rest) = parse_result(current)?;
        results.push(result);
        current = match rest.strip_prefix(',') {
            Some(next) => next,
            None if rest.is_empty() => rest,
            None => return Err(malformed("expected ','", rest)),
        };
    }
    Ok(results)
}

fn parse_result(input: &str) -> ParseResult<(MiResult, &str)> {
    let eq_pos = input
        .find('=')
        .ok_or_else(|| malformed("no '=' in result", input))?;
    let variable = &input[..eq_pos];
    if variable.is_empty()
        || !variable
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(malformed("bad result name", input));
    }
    let (value, rest) = parse_value(&input[eq_pos + 1..])?;
    Ok((
        MiResult {
            variable: variable.to_string(),
            value,
        },
        rest,
    ))
}

fn parse_value(input: &str) -> ParseResult<(MiValue, &str)> {
    match input.chars().next() {
        Some('"') => {
            let (s, rest) = parse_c_string(input)?;
            Ok((MiValue::String(s), rest))
        }
        Some('{') => parse_tuple(input),
        Some('[') => parse_list(input),
        _ => Err(malformed("expected value", input)),
    }
}

fn parse_tuple(input: &str) -> ParseResult<(MiValue, &str)> {
    let mut tuple = HashMap::new();
    let mut current = &input[1..];
    if let Some(rest) = current.strip_prefix('}') {
        return Ok((MiValue::Tuple(tuple), rest));
    }
    loop {
        let (result, rest) = parse_result(current)?;
        tuple.insert(result.variable, result.value);
        if let Some(next) = rest.strip_prefix(',') {
            current = next;
        } else if let Some(next) = rest.strip_prefix('}') {
            return Ok((MiValue::Tuple(tuple), next));
        } else {
            return Err(malformed("unterminated tuple", input));
        }
    }
}

/// Lists hold either bare values or `name=value` results; a result element is
/// kept as a single-entry tuple so its name survives.
fn parse_list(input: &str) -> ParseResult<(MiValue, &str)> {
    let mut list = Vec::new();
    let mut current = &input[1..];
    if let Some(rest) = current.strip_prefix(']') {
        return Ok((MiValue::List(list), rest));
    }
    loop {
        let rest = if matches!(current.chars().next(), Some('"' | '{' | '[')) {
            let (value, rest) = parse_value(current)?;
            list.push(value);
            rest
        } else {
            let (result, rest) = parse_result(current)?;
            let mut single = HashMap::new();
            single.insert(result.variable, result.value);
            list.push(MiValue::Tuple(single));
            rest
        };
        if let Some(next) = rest.strip_prefix(',') {
            current = next;
        } else if let Some(next) = rest.strip_prefix(']') {
            return Ok((MiValue::List(list), next));
        } else {
            return Err(malformed("unterminated list", input));
        }
    }
}

/// Parse a quoted MI c-string, undoing one level of escaping. Escapes other
/// than the simple ones (octal `\000` in particular) are kept verbatim so that
/// value post-processing can still see them.
pub fn parse_c_string(input: &str) -> ParseResult<(String, &str)> {
    let body = input
        .strip_prefix('"')
        .ok_or_else(|| malformed("string must start with '\"'", input))?;
    let mut result = String::new();
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if escaped {
            match c {
                'n' => result.push('\n'),
                't' => result.push('\t'),
                'r' => result.push('\r'),
                '\\' => result.push('\\'),
                '"' => result.push('"'),
                other => {
                    result.push('\\');
                    result.push(other);
                }
            }
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Ok((result, &body[i + 1..]));
        } else {
            result.push(c);
        }
    }
    Err(malformed("unterminated string", input))
}

/// Quote a value for use as a c-string argument of an MI command.
pub fn quote_mi_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Buffers raw reader output and hands back only complete lines.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every line it completes. `\r\n` endings are
    /// normalised.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let rest = std::mem::take(&mut self.pending);
            Some(String::from_utf8_lossy(&rest).into_owned())
        }
    }
}

fn tuple_string(tuple: &MiTuple, key: &str) -> Option<String> {
    tuple.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn tuple_number<T: std::str::FromStr>(tuple: &MiTuple, key: &str) -> Option<T> {
    tuple.get(key).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
}

/// Items of a list whose elements are either bare tuples or `key={...}`.
fn list_tuples<'a>(list: &'a [MiValue], key: &'a str) -> impl Iterator<Item = &'a MiTuple> + 'a {
    list.iter().filter_map(move |item| {
        let tuple = item.as_tuple()?;
        if tuple.len() == 1 {
            if let Some(inner) = tuple.get(key).and_then(|v| v.as_tuple()) {
                return Some(inner);
            }
        }
        Some(tuple)
    })
}

/// Parse breakpoint from MI results
pub fn parse_breakpoint(results: &[MiResult]) -> Option<Breakpoint> {
    find_result(results, "bkpt")
        .and_then(|v| v.as_tuple())
        .and_then(parse_breakpoint_tuple)
}

pub fn parse_breakpoint_tuple(tuple: &MiTuple) -> Option<Breakpoint> {
    Some(Breakpoint {
        number: tuple_string(tuple, "number")?,
        breakpoint_type: tuple_string(tuple, "type").unwrap_or_default(),
        enabled: tuple_string(tuple, "enabled")
            .map(|s| s == "y")
            .unwrap_or(true),
        addr: tuple_string(tuple, "addr"),
        func: tuple_string(tuple, "func"),
        file: tuple_string(tuple, "file"),
        fullname: tuple_string(tuple, "fullname"),
        line: tuple_number(tuple, "line"),
        times: tuple_number(tuple, "times").unwrap_or(0),
        original_location: tuple_string(tuple, "original-location"),
        condition: tuple_string(tuple, "cond"),
        ignore_count: tuple_number(tuple, "ignore"),
    })
}

/// Parse frame from MI results
pub fn parse_frame(results: &[MiResult]) -> Option<Frame> {
    find_result(results, "frame")
        .and_then(|v| v.as_tuple())
        .map(parse_frame_tuple)
}

fn parse_frame_tuple(tuple: &MiTuple) -> Frame {
    Frame {
        level: tuple_number(tuple, "level").unwrap_or(0),
        addr: tuple_string(tuple, "addr").unwrap_or_default(),
        func: tuple_string(tuple, "func"),
        file: tuple_string(tuple, "file"),
        fullname: tuple_string(tuple, "fullname"),
        line: tuple_number(tuple, "line"),
    }
}

/// Parse stack frames from stack-list-frames response
pub fn parse_stack_frames(results: &[MiResult]) -> Vec<Frame> {
    find_result(results, "stack")
        .and_then(|v| v.as_list())
        .map(|list| list_tuples(list, "frame").map(parse_frame_tuple).collect())
        .unwrap_or_default()
}

/// Parse `-thread-info`. Returns the threads and the current thread id, or
/// `None` when the reply carries no thread list at all.
pub fn parse_thread_info(results: &[MiResult]) -> Option<(Vec<Thread>, Option<String>)> {
    let list = find_result(results, "threads")?.as_list()?;
    let threads = list
        .iter()
        .filter_map(|v| v.as_tuple())
        .filter_map(|tuple| {
            Some(Thread {
                id: tuple_string(tuple, "id")?,
                target_id: tuple_string(tuple, "target-id").unwrap_or_default(),
                name: tuple_string(tuple, "name"),
                frame: tuple
                    .get("frame")
                    .and_then(|v| v.as_tuple())
                    .map(parse_frame_tuple),
                state: match tuple_string(tuple, "state").as_deref() {
                    Some("running") => ThreadState::Running,
                    _ => ThreadState::Stopped,
                },
                core: tuple_number(tuple, "core"),
            })
        })
        .collect();
    Some((threads, find_string(results, "current-thread-id")))
}

/// Parse locals and arguments from `-stack-list-variables --simple-values`.
pub fn parse_stack_variables(results: &[MiResult]) -> Vec<Variable> {
    let Some(list) = find_result(results, "variables").and_then(|v| v.as_list()) else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|v| v.as_tuple())
        .filter_map(|tuple| {
            Some(Variable {
                name: tuple_string(tuple, "name")?,
                exp: None,
                value: tuple_string(tuple, "value"),
                var_type: tuple_string(tuple, "type"),
                numchild: 0,
                is_arg: tuple_string(tuple, "arg").as_deref() == Some("1"),
            })
        })
        .collect()
}

/// Parse variable from var-create response
pub fn parse_var_create(results: &[MiResult]) -> Option<Variable> {
    Some(Variable {
        name: find_string(results, "name")?,
        exp: None,
        value: find_string(results, "value"),
        var_type: find_string(results, "type"),
        numchild: find_string(results, "numchild")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        is_arg: false,
    })
}

/// Parse variable children from var-list-children response
pub fn parse_var_children(results: &[MiResult]) -> Vec<Variable> {
    let children: Vec<Variable> = find_result(results, "children")
        .and_then(|v| v.as_list())
        .map(|list| {
            list_tuples(list, "child")
                .filter_map(|tuple| {
                    Some(Variable {
                        name: tuple_string(tuple, "name")?,
                        exp: tuple_string(tuple, "exp"),
                        value: tuple_string(tuple, "value"),
                        var_type: tuple_string(tuple, "type"),
                        numchild: tuple_number(tuple, "numchild").unwrap_or(0),
                        is_arg: false,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    debug!("Parsed {} variable children", children.len());
    children
}
