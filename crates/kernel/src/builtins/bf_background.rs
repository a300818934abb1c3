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

//! Builtins that run work on background threads, and the ones that manage those threads.

use std::time::Duration;

use minstant::Instant;
use sha2::{Digest, Sha256};
use stunt_var::{
    E_INTRPT, E_INVARG, ErrorCode, v_bool, v_error_map, v_float, v_int, v_list_iter, v_str,
    v_string,
};
use tracing::debug;

use crate::builtins::{BfCallState, BfErr, BfRet, BuiltinFunction};
use crate::tasks::background::BackgroundRequest;
use crate::tasks::sessions::SessionGuard;

/// How often a sleeping `background_test` checks whether it has been killed.
const BACKGROUND_TEST_SLICE: Duration = Duration::from_millis(100);

/// Usage: `str background_test([str message [, num seconds]])`
/// Waits `seconds` (default 5) on a background thread, then returns `message`.
fn bf_background_test(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(0, 2)?;
    let message = match bf_args.args.first() {
        Some(_) => bf_args.str_arg(0)?.to_string(),
        None => "Hello, world.".to_string(),
    };
    let seconds = match bf_args.args.get(1) {
        Some(_) => bf_args.int_arg(1)?,
        None => 5,
    };
    let Ok(seconds) = u64::try_from(seconds) else {
        return Err(BfErr::ErrMsg(
            E_INVARG,
            "background_test() needs a non-negative duration".to_string(),
        ));
    };

    let request = BackgroundRequest::new(
        "background_test",
        v_string(message),
        move |message, waiter| {
            let deadline = Instant::now() + Duration::from_secs(seconds);
            loop {
                let now = Instant::now();
                if now >= deadline {
                    return message;
                }
                if !waiter.is_active() {
                    return v_error_map(E_INTRPT, "background_test() was interrupted");
                }
                std::thread::sleep(BACKGROUND_TEST_SLICE.min(deadline - now));
            }
        },
    );
    Ok(BfRet::Background(request))
}

/// Usage: `str string_hash(str text)`
/// SHA-256 of `text` as upper-case hex, computed off the scheduler thread.
fn bf_string_hash(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(1, 1)?;
    let text = bf_args.str_arg(0)?.to_string();
    let request = BackgroundRequest::new("string_hash", v_string(text), |text, _waiter| {
        let Some(text) = text.as_str() else {
            return v_error_map(E_INVARG, "string_hash() needs a string");
        };
        v_string(sha256_hex(text))
    });
    Ok(BfRet::Background(request))
}

pub(crate) fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02X}")).collect()
}

/// Usage: `str connection_name_lookup()`
/// Resolves the peer name of the caller's connection. The connection is held open until the
/// lookup has finished.
fn bf_connection_name_lookup(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(0, 0)?;
    let Some(session) = bf_args.ctx.session else {
        return Err(BfErr::ErrMsg(
            E_INVARG,
            "connection_name_lookup() needs a connection".to_string(),
        ));
    };
    let Some(guard) = bf_args.ctx.sessions.acquire(session) else {
        return Err(BfErr::ErrMsg(E_INVARG, "Connection is gone".to_string()));
    };

    let request = BackgroundRequest::new(
        "connection_name_lookup",
        v_int(session as i64),
        |_session, waiter| {
            match waiter.extra::<SessionGuard>().and_then(|guard| guard.peer_name()) {
                Some(name) => v_string(name),
                None => v_error_map(E_INVARG, "Could not resolve connection name"),
            }
        },
    )
    .with_extra(guard)
    .with_cleanup(move |extra| {
        drop(extra);
        debug!(session, "Released connection after name lookup");
    });
    Ok(BfRet::Background(request))
}

/// Usage: `list threads()`
/// Handles of the background threads currently running.
fn bf_threads(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(0, 0)?;
    bf_args.check_wizard()?;
    let handles = bf_args.ctx.gateway.handles();
    Ok(BfRet::Ret(v_list_iter(
        handles.into_iter().map(|h| v_int(h.0 as i64)),
    )))
}

/// Usage: `list background_tasks()`
/// `{handle, task id, title, active, seconds running}` for each background thread.
fn bf_background_tasks(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(0, 0)?;
    bf_args.check_wizard()?;
    let waiters = bf_args.ctx.gateway.describe();
    Ok(BfRet::Ret(v_list_iter(waiters.into_iter().map(|w| {
        v_list_iter([
            v_int(w.handle.0 as i64),
            v_int(w.task_id as i64),
            v_str(&w.title),
            v_bool(w.active),
            v_float(w.elapsed.as_secs_f64()),
        ])
    }))))
}

/// Usage: `int set_thread_mode(int enabled)`
/// Turns background threading on or off for the whole server. Returns the previous mode.
fn bf_set_thread_mode(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(1, 1)?;
    bf_args.check_wizard()?;
    let enabled = bf_args.args[0].is_true();
    let previous = bf_args.ctx.gateway.set_threading(enabled);
    debug!(enabled, previous, "Background thread mode changed");
    Ok(BfRet::Ret(v_bool(previous)))
}

/// Usage: `int set_max_background_threads(int max)`
/// Returns the previous limit. Threads already running are unaffected. Wizard-only.
fn bf_set_max_background_threads(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(1, 1)?;
    bf_args.check_wizard()?;
    let max = match usize::try_from(bf_args.int_arg(0)?) {
        Ok(max) if max > 0 => max,
        _ => return Err(BfErr::Code(ErrorCode::E_INVARG)),
    };
    let previous = bf_args.ctx.gateway.set_max_threads(max);
    Ok(BfRet::Ret(v_int(previous as i64)))
}

fn bf_max_background_threads(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(0, 0)?;
    Ok(BfRet::Ret(v_int(bf_args.ctx.gateway.max_threads() as i64)))
}

pub(crate) fn register_bf_background(builtins: &mut Vec<(&'static str, BuiltinFunction)>) {
    builtins.push(("background_test", bf_background_test));
    builtins.push(("string_hash", bf_string_hash));
    builtins.push(("connection_name_lookup", bf_connection_name_lookup));
    builtins.push(("threads", bf_threads));
    builtins.push(("background_tasks", bf_background_tasks));
    builtins.push(("set_thread_mode", bf_set_thread_mode));
    builtins.push(("set_max_background_threads", bf_set_max_background_threads));
    builtins.push(("max_background_threads", bf_max_background_threads));
}
