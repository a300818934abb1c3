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

use std::fmt::{Display, Formatter};
use strum::{EnumIter, FromRepr};
use ErrorCode::*;

/// The MOO error values, in the order (and with the integer codes) of a LambdaMOO/ToastStunt
/// textdump.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, FromRepr, EnumIter)]
#[allow(non_camel_case_types)]
pub enum ErrorCode {
    E_NONE = 0,
    E_TYPE = 1,
    E_DIV = 2,
    E_PERM = 3,
    E_PROPNF = 4,
    E_VERBNF = 5,
    E_VARNF = 6,
    E_INVIND = 7,
    E_RECMOVE = 8,
    E_MAXREC = 9,
    E_RANGE = 10,
    E_ARGS = 11,
    E_NACC = 12,
    E_INVARG = 13,
    E_QUOTA = 14,
    E_FLOAT = 15,
    // Toast extensions:
    E_FILE = 16,
    E_EXEC = 17,
    E_INTRPT = 18,
}

impl ErrorCode {
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "E_NONE" => Some(E_NONE),
            "E_TYPE" => Some(E_TYPE),
            "E_DIV" => Some(E_DIV),
            "E_PERM" => Some(E_PERM),
            "E_PROPNF" => Some(E_PROPNF),
            "E_VERBNF" => Some(E_VERBNF),
            "E_VARNF" => Some(E_VARNF),
            "E_INVIND" => Some(E_INVIND),
            "E_RECMOVE" => Some(E_RECMOVE),
            "E_MAXREC" => Some(E_MAXREC),
            "E_RANGE" => Some(E_RANGE),
            "E_ARGS" => Some(E_ARGS),
            "E_NACC" => Some(E_NACC),
            "E_INVARG" => Some(E_INVARG),
            "E_QUOTA" => Some(E_QUOTA),
            "E_FLOAT" => Some(E_FLOAT),
            "E_FILE" => Some(E_FILE),
            "E_EXEC" => Some(E_EXEC),
            "E_INTRPT" => Some(E_INTRPT),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            E_NONE => "E_NONE",
            E_TYPE => "E_TYPE",
            E_DIV => "E_DIV",
            E_PERM => "E_PERM",
            E_PROPNF => "E_PROPNF",
            E_VERBNF => "E_VERBNF",
            E_VARNF => "E_VARNF",
            E_INVIND => "E_INVIND",
            E_RECMOVE => "E_RECMOVE",
            E_MAXREC => "E_MAXREC",
            E_RANGE => "E_RANGE",
            E_ARGS => "E_ARGS",
            E_NACC => "E_NACC",
            E_INVARG => "E_INVARG",
            E_QUOTA => "E_QUOTA",
            E_FLOAT => "E_FLOAT",
            E_FILE => "E_FILE",
            E_EXEC => "E_EXEC",
            E_INTRPT => "E_INTRPT",
        }
    }

    /// The default human readable message for this error, as returned by `tostr()` on it.
    pub fn message(&self) -> &'static str {
        match self {
            E_NONE => "No error",
            E_TYPE => "Type mismatch",
            E_DIV => "Division by zero",
            E_PERM => "Permission denied",
            E_PROPNF => "Property not found",
            E_VERBNF => "Verb not found",
            E_VARNF => "Variable not found",
            E_INVIND => "Invalid indirection",
            E_RECMOVE => "Recursive move",
            E_MAXREC => "Too many verb calls",
            E_RANGE => "Range error",
            E_ARGS => "Incorrect number of arguments",
            E_NACC => "Move refused by destination",
            E_INVARG => "Invalid argument",
            E_QUOTA => "Resource limit exceeded",
            E_FLOAT => "Floating-point arithmetic error",
            E_FILE => "File system error",
            E_EXEC => "Exec error",
            E_INTRPT => "Interrupted",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
