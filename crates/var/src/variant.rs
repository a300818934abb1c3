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

use crate::finalizable::{AnonObject, Waif};
use crate::heap::Ref;
use crate::{ErrorCode, List, Map, Obj};

/// Our series of types
#[derive(Clone, Debug)]
pub enum Variant {
    None,
    Int(i64),
    Float(f64),
    Obj(Obj),
    Err(ErrorCode),
    Str(Ref<String>),
    List(Ref<List>),
    Map(Ref<Map>),
    Anon(Ref<AnonObject>),
    Waif(Ref<Waif>),
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Variant::None, Variant::None) => true,
            (Variant::Int(a), Variant::Int(b)) => a == b,
            (Variant::Float(a), Variant::Float(b)) => a == b,
            (Variant::Obj(a), Variant::Obj(b)) => a == b,
            (Variant::Err(a), Variant::Err(b)) => a == b,
            (Variant::Str(a), Variant::Str(b)) => a.as_str() == b.as_str(),
            (Variant::List(a), Variant::List(b)) => a.ptr_eq(b) || **a == **b,
            (Variant::Map(a), Variant::Map(b)) => a.ptr_eq(b) || **a == **b,
            // Identity, not structure.
            (Variant::Anon(a), Variant::Anon(b)) => a.ptr_eq(b),
            (Variant::Waif(a), Variant::Waif(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}
