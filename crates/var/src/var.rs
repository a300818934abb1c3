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

use crate::finalizable::{AnonObject, Pinned, Waif};
use crate::heap::{HeapPayload, Ref};
use crate::variant::Variant;
use crate::{ErrorCode, List, Map, Obj};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// A MOO value. Scalars are stored inline; composites are counted heap references, so cloning
/// a `Var` is `share` and dropping one is `release`.
#[derive(Clone, Debug, PartialEq)]
pub struct Var(Variant);

#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum FinalizeError {
    #[error("value is already pending finalization")]
    AlreadyQueued,
    #[error("values of this type have no finalizer")]
    NotFinalizable,
}

impl Var {
    pub fn from_variant(variant: Variant) -> Self {
        Self(variant)
    }

    pub(crate) fn from_anon(r: Ref<AnonObject>) -> Self {
        Self(Variant::Anon(r))
    }

    pub(crate) fn from_waif(r: Ref<Waif>) -> Self {
        Self(Variant::Waif(r))
    }

    pub fn variant(&self) -> &Variant {
        &self.0
    }

    /// Hand a copy of this value to a second owner.
    pub fn share(&self) -> Var {
        self.clone()
    }

    /// Give up this owner's reference.
    pub fn release(self) {
        drop(self)
    }

    /// The logical reference count, or `None` for scalars which are not counted.
    pub fn refcount(&self) -> Option<usize> {
        match &self.0 {
            Variant::Str(r) => Some(r.refcount()),
            Variant::List(r) => Some(r.refcount()),
            Variant::Map(r) => Some(r.refcount()),
            Variant::Anon(r) => Some(r.refcount()),
            Variant::Waif(r) => Some(r.refcount()),
            _ => None,
        }
    }

    pub fn requires_finalizer(&self) -> bool {
        matches!(self.0, Variant::Anon(_) | Variant::Waif(_))
    }

    /// Claim the value's single finalization-queue slot and return a pin for it. Used by
    /// producers other than ordinary release: the cycle collector, and checkpoint restore.
    pub fn claim_for_finalization(&self) -> Result<Pinned, FinalizeError> {
        match &self.0 {
            Variant::Anon(r) => claim(r, || Pinned::Anon(r.cell().clone())),
            Variant::Waif(r) => claim(r, || Pinned::Waif(r.cell().clone())),
            _ => Err(FinalizeError::NotFinalizable),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self.0, Variant::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.0 {
            Variant::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<Obj> {
        match self.0 {
            Variant::Obj(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_err(&self) -> Option<ErrorCode> {
        match self.0 {
            Variant::Err(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.0 {
            Variant::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match &self.0 {
            Variant::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match &self.0 {
            Variant::Map(m) => Some(m),
            _ => None,
        }
    }

    /// `true` if this is an error map, i.e. a map with an error under the `"error"` key.
    pub fn is_error_map(&self) -> bool {
        self.error_map_code().is_some()
    }

    pub fn error_map_code(&self) -> Option<ErrorCode> {
        self.as_map()?.get(&v_str("error"))?.as_err()
    }

    pub fn is_true(&self) -> bool {
        match &self.0 {
            Variant::None | Variant::Obj(_) | Variant::Err(_) => false,
            Variant::Int(i) => *i != 0,
            Variant::Float(f) => *f != 0.0,
            Variant::Str(s) => !s.is_empty(),
            Variant::List(l) => !l.is_empty(),
            Variant::Map(m) => !m.is_empty(),
            Variant::Anon(_) | Variant::Waif(_) => false,
        }
    }
}

fn claim<T: HeapPayload>(
    r: &Ref<T>,
    pin: impl FnOnce() -> Pinned,
) -> Result<Pinned, FinalizeError> {
    if !r.header().mark_queued() {
        return Err(FinalizeError::AlreadyQueued);
    }
    Ok(pin())
}

fn quote(s: &str, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

/// Literal (`toliteral()`) form.
impl Display for Var {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Variant::None => f.write_str("None"),
            Variant::Int(i) => write!(f, "{i}"),
            Variant::Float(fl) => write!(f, "{fl:?}"),
            Variant::Obj(o) => write!(f, "{o}"),
            Variant::Err(e) => write!(f, "{e}"),
            Variant::Str(s) => quote(s, f),
            Variant::List(l) => {
                f.write_str("{")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("}")
            }
            Variant::Map(m) => {
                f.write_str("[")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k} -> {v}")?;
                }
                f.write_str("]")
            }
            Variant::Anon(a) => write!(f, "{:?}", **a),
            Variant::Waif(w) => write!(f, "{:?}", **w),
        }
    }
}

pub fn v_none() -> Var {
    Var(Variant::None)
}

pub fn v_int(i: i64) -> Var {
    Var(Variant::Int(i))
}

pub fn v_bool(b: bool) -> Var {
    v_int(i64::from(b))
}

pub fn v_float(f: f64) -> Var {
    Var(Variant::Float(f))
}

pub fn v_obj(o: Obj) -> Var {
    Var(Variant::Obj(o))
}

pub fn v_objid(id: i64) -> Var {
    v_obj(Obj::mk_id(id))
}

pub fn v_err(e: ErrorCode) -> Var {
    Var(Variant::Err(e))
}

pub fn v_str(s: &str) -> Var {
    v_string(s.to_string())
}

pub fn v_string(s: String) -> Var {
    Var(Variant::Str(Ref::new(s)))
}

pub fn v_list(elements: &[Var]) -> Var {
    v_list_iter(elements.iter().cloned())
}

pub fn v_list_iter<I: IntoIterator<Item = Var>>(elements: I) -> Var {
    Var(Variant::List(Ref::new(List::from_vec(
        elements.into_iter().collect(),
    ))))
}

pub fn v_empty_list() -> Var {
    v_list_iter(std::iter::empty())
}

pub fn v_map(pairs: Vec<(Var, Var)>) -> Var {
    Var(Variant::Map(Ref::new(Map::from_pairs(pairs))))
}

pub fn v_anon(anon: AnonObject) -> Var {
    Var(Variant::Anon(Ref::new(anon)))
}

pub fn v_waif(waif: Waif) -> Var {
    Var(Variant::Waif(Ref::new(waif)))
}

/// The error-shaped result background operations produce: `["error" -> code, "message" -> msg]`.
pub fn v_error_map(code: ErrorCode, message: &str) -> Var {
    v_map(vec![
        (v_str("error"), v_err(code)),
        (v_str("message"), v_str(message)),
    ])
}
