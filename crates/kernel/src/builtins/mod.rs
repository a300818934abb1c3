// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Built-in functions, and the little command language connections use to call them.
//!
//! A command is a builtin name followed by its arguments, either in call form
//! (`string_hash("hello")`) or separated by whitespace (`kill_task 12`).

use std::sync::LazyLock;

use stunt_var::{ErrorCode, NOTHING, Obj, Var, v_float, v_int, v_obj, v_str, v_string};
use thiserror::Error;

use crate::builtins::bf_background::register_bf_background;
use crate::builtins::bf_server::register_bf_server;
use crate::tasks::background::BackgroundRequest;
use crate::tasks::task::{TaskBody, TaskContext, TaskInput, TaskResponse};

mod bf_background;
mod bf_server;

/// The arguments and other state passed to a built-in function.
pub struct BfCallState<'a, 'ctx> {
    /// The name of the invoked function.
    pub(crate) name: &'static str,
    /// Arguments passed to the function.
    pub(crate) args: Vec<Var>,
    pub(crate) ctx: &'a mut TaskContext<'ctx>,
}

impl BfCallState<'_, '_> {
    pub fn player(&self) -> Obj {
        self.ctx.player
    }

    /// Raises `E_PERM` unless the calling player is a wizard.
    fn check_wizard(&self) -> Result<(), BfErr> {
        if self.ctx.is_wizard(self.ctx.player) {
            return Ok(());
        }
        Err(BfErr::ErrMsg(
            ErrorCode::E_PERM,
            format!("{}() requires the caller to be a wizard", self.name),
        ))
    }

    fn arity(&self, min: usize, max: usize) -> Result<(), BfErr> {
        let n = self.args.len();
        if n < min || n > max {
            return Err(BfErr::ErrMsg(
                ErrorCode::E_ARGS,
                format!("{}() takes {min} to {max} arguments, got {n}", self.name),
            ));
        }
        Ok(())
    }

    fn str_arg(&self, index: usize) -> Result<&str, BfErr> {
        self.args[index].as_str().ok_or_else(|| {
            BfErr::ErrMsg(
                ErrorCode::E_TYPE,
                format!("{}() argument {} must be a string", self.name, index + 1),
            )
        })
    }

    fn int_arg(&self, index: usize) -> Result<i64, BfErr> {
        self.args[index].as_int().ok_or_else(|| {
            BfErr::ErrMsg(
                ErrorCode::E_TYPE,
                format!("{}() argument {} must be an integer", self.name, index + 1),
            )
        })
    }

    fn obj_arg(&self, index: usize) -> Result<Obj, BfErr> {
        self.args[index].as_obj().ok_or_else(|| {
            BfErr::ErrMsg(
                ErrorCode::E_TYPE,
                format!("{}() argument {} must be an object", self.name, index + 1),
            )
        })
    }
}

pub(crate) type BuiltinFunction = fn(&mut BfCallState<'_, '_>) -> Result<BfRet, BfErr>;

/// Return possibilities from a built-in function.
pub(crate) enum BfRet {
    /// Successful return, with a value for the caller.
    Ret(Var),
    /// Suspend the task on a background thread; its result is the function's return value.
    Background(BackgroundRequest),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub(crate) enum BfErr {
    #[error("{0}")]
    Code(ErrorCode),
    #[error("{0}: {1}")]
    ErrMsg(ErrorCode, String),
}

static BUILTINS: LazyLock<Vec<(&'static str, BuiltinFunction)>> = LazyLock::new(|| {
    let mut builtins = vec![];
    register_bf_background(&mut builtins);
    register_bf_server(&mut builtins);
    builtins
});

fn find_builtin(name: &str) -> Option<(&'static str, BuiltinFunction)> {
    BUILTINS.iter().find(|(n, _)| *n == name).copied()
}

/// Names of every built-in function, in registration order.
pub fn builtin_names() -> Vec<&'static str> {
    BUILTINS.iter().map(|(name, _)| *name).collect()
}

/// A task that calls one builtin and completes with what it returns.
pub struct BuiltinTask {
    name: &'static str,
    function: BuiltinFunction,
    args: Option<Vec<Var>>,
}

impl BuiltinTask {
    pub fn new(name: &str, args: Vec<Var>) -> Option<Self> {
        let (name, function) = find_builtin(name)?;
        Some(Self {
            name,
            function,
            args: Some(args),
        })
    }
}

impl TaskBody for BuiltinTask {
    fn step(&mut self, input: TaskInput, ctx: &mut TaskContext) -> TaskResponse {
        match input {
            TaskInput::Start => {
                let Some(args) = self.args.take() else {
                    return TaskResponse::Abort(format!("{}() was started twice", self.name));
                };
                let mut bf_args = BfCallState {
                    name: self.name,
                    args,
                    ctx,
                };
                match (self.function)(&mut bf_args) {
                    Ok(BfRet::Ret(value)) => TaskResponse::Complete(value),
                    Ok(BfRet::Background(request)) => TaskResponse::Background(request),
                    Err(e) => TaskResponse::Abort(e.to_string()),
                }
            }
            // Whatever the background thread produced, error maps included.
            TaskInput::Resume(value) => TaskResponse::Complete(value),
        }
    }

    fn describe(&self) -> String {
        format!("{}()", self.name)
    }
}

/// Parse a line of connection input into a builtin call.
pub fn parse_command(line: &str) -> Result<Box<dyn TaskBody>, String> {
    let line = line.trim();
    let name_end = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(line.len());
    let (name, rest) = line.split_at(name_end);
    if name.is_empty() {
        return Err(format!("Not a command: {line}"));
    }
    let rest = rest.trim();
    let rest = match rest.strip_prefix('(') {
        Some(inner) => inner
            .strip_suffix(')')
            .ok_or_else(|| format!("Unbalanced parentheses in: {line}"))?,
        None => rest,
    };
    let args = parse_args(rest)?;
    let task = BuiltinTask::new(name, args).ok_or_else(|| format!("Unknown built-in function: {name}"))?;
    Ok(Box::new(task))
}

fn parse_args(input: &str) -> Result<Vec<Var>, String> {
    let mut args = vec![];
    let mut chars = input.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
        let Some(&first) = chars.peek() else {
            return Ok(args);
        };
        if first == '"' {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => s.push(c),
                        None => return Err("Unterminated string".to_string()),
                    },
                    Some(c) => s.push(c),
                    None => return Err("Unterminated string".to_string()),
                }
            }
            args.push(v_string(s));
            continue;
        }
        let mut word = String::new();
        while let Some(c) = chars.next_if(|c| !c.is_whitespace() && *c != ',') {
            word.push(c);
        }
        args.push(parse_literal(&word)?);
    }
}

fn parse_literal(word: &str) -> Result<Var, String> {
    if let Some(id) = word.strip_prefix('#') {
        return id
            .parse::<i64>()
            .map(|id| v_obj(Obj::mk_id(id)))
            .map_err(|_| format!("Bad object number: {word}"));
    }
    if let Ok(i) = word.parse::<i64>() {
        return Ok(v_int(i));
    }
    if let Ok(f) = word.parse::<f64>() {
        return Ok(v_float(f));
    }
    if let Some(e) = ErrorCode::parse_str(word) {
        return Ok(stunt_var::v_err(e));
    }
    match word {
        "true" => Ok(v_int(1)),
        "false" => Ok(v_int(0)),
        "nothing" => Ok(v_obj(NOTHING)),
        // Anything else is taken as a bare string.
        _ => Ok(v_str(word)),
    }
}
