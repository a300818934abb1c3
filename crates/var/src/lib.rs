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

//! MOO values and the reference-counting ownership model underneath them.

pub mod encode;
mod error;
pub mod finalizable;
pub mod heap;
mod list;
mod map;
mod obj;
#[allow(clippy::module_inception)]
mod var;
mod variant;

pub use encode::{DecodingError, VarReader, VarWriter};
pub use error::{ErrorCode, ErrorCode::*};
pub use finalizable::{AnonObject, FinalizeSink, Pinned, SinkRef, Waif};
pub use heap::GcColor;
pub use list::List;
pub use map::Map;
pub use obj::{NOTHING, Obj, SYSTEM_OBJECT};
pub use var::{
    FinalizeError, Var, v_anon, v_bool, v_empty_list, v_err, v_error_map, v_float, v_int, v_list,
    v_list_iter, v_map, v_none, v_obj, v_objid, v_str, v_string, v_waif,
};
pub use variant::Variant;
