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

use stunt_common::tasks::CheckpointReason;
use stunt_var::{
    AnonObject, E_INVARG, E_PERM, Waif, v_anon, v_bool, v_int, v_map, v_none, v_obj, v_str,
    v_waif,
};
use tracing::info;

use crate::builtins::{BfCallState, BfErr, BfRet, BuiltinFunction};

/// Usage: `int checkpoint()`
/// Asks for a checkpoint at the end of this scheduler tick. Returns false if one was already
/// pending.
fn bf_checkpoint(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(0, 0)?;
    bf_args.check_wizard()?;
    let fresh = bf_args.ctx.coordinator.request(CheckpointReason::Explicit);
    Ok(BfRet::Ret(v_bool(fresh)))
}

/// Usage: `none shutdown([str message])`
/// Shuts down the server, optionally with a message. Wizard-only.
fn bf_shutdown(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(0, 1)?;
    bf_args.check_wizard()?;
    let message = match bf_args.args.first() {
        Some(_) => Some(bf_args.str_arg(0)?.to_string()),
        None => None,
    };
    info!(player = %bf_args.player(), ?message, "Shutdown requested");
    bf_args.ctx.coordinator.request_shutdown(message);
    Ok(BfRet::Ret(v_none()))
}

/// Usage: `none kill_task(int task_id)`
/// Only the task's own player, or a wizard, may kill it.
fn bf_kill_task(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(1, 1)?;
    let task_id = bf_args.int_arg(0)?;
    let Ok(task_id) = usize::try_from(task_id) else {
        return Err(BfErr::Code(E_INVARG));
    };
    let Some(owner) = bf_args.ctx.task_owner(task_id) else {
        return Err(BfErr::ErrMsg(E_INVARG, format!("No such task: {task_id}")));
    };
    if owner != bf_args.player() {
        bf_args.check_wizard()?;
    }
    bf_args.ctx.kill_task(task_id);
    Ok(BfRet::Ret(v_none()))
}

/// Usage: `obj connect(obj player)`
/// Logs the calling connection in as `player`.
fn bf_connect(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(1, 1)?;
    let player = bf_args.obj_arg(0)?;
    if player.is_nothing() {
        return Err(BfErr::ErrMsg(E_INVARG, "Cannot connect as #-1".to_string()));
    }
    let Some(session) = bf_args.ctx.session else {
        return Err(BfErr::Code(E_PERM));
    };
    // Wizard connections can't be had just by asking.
    if player != bf_args.player() && bf_args.ctx.is_wizard(player) {
        bf_args.check_wizard()?;
    }
    if !bf_args.ctx.sessions.login(session, player) {
        return Err(BfErr::ErrMsg(E_INVARG, "Connection is gone".to_string()));
    }
    Ok(BfRet::Ret(v_obj(player)))
}

/// Usage: `waif new_waif(obj class)`
/// A lightweight object. Its finalizer runs once the last reference to it goes away.
fn bf_new_waif(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(1, 1)?;
    let class = bf_args.obj_arg(0)?;
    let owner = bf_args.player();
    let id = bf_args.ctx.new_object_id();
    let sink = bf_args.ctx.finalizers.sink();
    Ok(BfRet::Ret(v_waif(Waif::new(id, class, owner, vec![], sink))))
}

/// Usage: `anon create_anonymous(obj parent)`
fn bf_create_anonymous(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(1, 1)?;
    let parent = bf_args.obj_arg(0)?;
    let id = bf_args.ctx.new_object_id();
    let sink = bf_args.ctx.finalizers.sink();
    Ok(BfRet::Ret(v_anon(AnonObject::new(id, parent, sink))))
}

/// Usage: `map finalization_stats()`
fn bf_finalization_stats(bf_args: &mut BfCallState<'_, '_>) -> Result<BfRet, BfErr> {
    bf_args.arity(0, 0)?;
    let stats = bf_args.ctx.finalizers.stats();
    Ok(BfRet::Ret(v_map(vec![
        (v_str("queued"), v_int(stats.queued as i64)),
        (
            v_str("awaiting_finalizer"),
            v_int(stats.awaiting_finalizer as i64),
        ),
        (v_str("awaiting_release"), v_int(stats.awaiting_release as i64)),
    ])))
}

pub(crate) fn register_bf_server(builtins: &mut Vec<(&'static str, BuiltinFunction)>) {
    builtins.push(("checkpoint", bf_checkpoint));
    builtins.push(("shutdown", bf_shutdown));
    builtins.push(("kill_task", bf_kill_task));
    builtins.push(("connect", bf_connect));
    builtins.push(("new_waif", bf_new_waif));
    builtins.push(("create_anonymous", bf_create_anonymous));
    builtins.push(("finalization_stats", bf_finalization_stats));
}
