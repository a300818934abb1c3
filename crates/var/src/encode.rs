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

//! Line-oriented value encoding in the style of a LambdaMOO/ToastStunt textdump: one line with the
//! type code, then the payload on following lines.

use crate::finalizable::{AnonObject, Pinned, SinkRef, Waif};
use crate::variant::Variant;
use crate::{
    ErrorCode, Obj, Var, v_err, v_float, v_int, v_list_iter, v_map, v_none, v_obj, v_string,
};
use std::io::{BufRead, Write};
use thiserror::Error;

pub const TYPE_INT: i64 = 0;
pub const TYPE_OBJ: i64 = 1;
pub const TYPE_STR: i64 = 2;
pub const TYPE_ERR: i64 = 3;
pub const TYPE_LIST: i64 = 4;
pub const TYPE_NONE: i64 = 6;
pub const TYPE_FLOAT: i64 = 9;
pub const TYPE_MAP: i64 = 10;
pub const TYPE_ANON: i64 = 12;
pub const TYPE_WAIF: i64 = 13;

/// Upper bound on capacity reserved up front for a list, map or waif read from input.
const MAX_PREALLOCATED: usize = 1024;

#[derive(Debug, Error)]
pub enum DecodingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected end of input at line {0}")]
    UnexpectedEof(usize),
    #[error("could not parse line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("unknown type code {code} at line {line}")]
    UnknownType { line: usize, code: i64 },
    #[error("value at line {0} cannot be pending finalization")]
    NotFinalizable(usize),
}

pub struct VarWriter<W: Write> {
    writer: W,
}

impl<W: Write> VarWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), std::io::Error> {
        writeln!(self.writer, "{line}")
    }

    fn write_num(&mut self, n: i64) -> Result<(), std::io::Error> {
        writeln!(self.writer, "{n}")
    }

    fn write_str_payload(&mut self, s: &str) -> Result<(), std::io::Error> {
        let escaped = s.replace('\\', "\\\\").replace('\n', "\\n");
        writeln!(self.writer, "{escaped}")
    }

    pub fn write_var(&mut self, v: &Var) -> Result<(), std::io::Error> {
        match v.variant() {
            Variant::None => self.write_num(TYPE_NONE),
            Variant::Int(i) => {
                self.write_num(TYPE_INT)?;
                self.write_num(*i)
            }
            Variant::Float(f) => {
                self.write_num(TYPE_FLOAT)?;
                writeln!(self.writer, "{f:?}")
            }
            Variant::Obj(o) => {
                self.write_num(TYPE_OBJ)?;
                self.write_num(o.id())
            }
            Variant::Err(e) => {
                self.write_num(TYPE_ERR)?;
                self.write_num(*e as i64)
            }
            Variant::Str(s) => {
                self.write_num(TYPE_STR)?;
                self.write_str_payload(s)
            }
            Variant::List(l) => {
                self.write_num(TYPE_LIST)?;
                self.write_num(l.len() as i64)?;
                for e in l.iter() {
                    self.write_var(e)?;
                }
                Ok(())
            }
            Variant::Map(m) => {
                self.write_num(TYPE_MAP)?;
                self.write_num(m.len() as i64)?;
                for (k, v) in m.iter() {
                    self.write_var(k)?;
                    self.write_var(v)?;
                }
                Ok(())
            }
            Variant::Anon(a) => self.write_anon(a),
            Variant::Waif(w) => self.write_waif(w),
        }
    }

    /// Write a value that is being held by a finalization queue.
    pub fn write_pinned(&mut self, p: &Pinned) -> Result<(), std::io::Error> {
        match p {
            Pinned::Anon(c) => self.write_anon(c.payload()),
            Pinned::Waif(c) => self.write_waif(c.payload()),
        }
    }

    fn write_anon(&mut self, a: &AnonObject) -> Result<(), std::io::Error> {
        self.write_num(TYPE_ANON)?;
        self.write_num(a.id() as i64)?;
        self.write_num(a.parent().id())
    }

    fn write_waif(&mut self, w: &Waif) -> Result<(), std::io::Error> {
        self.write_num(TYPE_WAIF)?;
        self.write_num(w.id() as i64)?;
        self.write_num(w.class().id())?;
        self.write_num(w.owner().id())?;
        self.write_num(w.propvals().len() as i64)?;
        for v in w.propvals() {
            self.write_var(v)?;
        }
        Ok(())
    }
}

/// Reads values back. Finalizable values are attached to `sink`, so that if their last reference
/// goes away after restore they are finalized the same as any other.
pub struct VarReader<R: BufRead> {
    reader: R,
    sink: SinkRef,
    line: usize,
}

impl<R: BufRead> VarReader<R> {
    pub fn new(reader: R, sink: SinkRef) -> Self {
        Self {
            reader,
            sink,
            line: 0,
        }
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn read_line(&mut self) -> Result<String, DecodingError> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf)?;
        self.line += 1;
        if n == 0 {
            return Err(DecodingError::UnexpectedEof(self.line));
        }
        if buf.ends_with('\n') {
            buf.pop();
            if buf.ends_with('\r') {
                buf.pop();
            }
        }
        Ok(buf)
    }

    pub fn read_num(&mut self) -> Result<i64, DecodingError> {
        let l = self.read_line()?;
        l.trim().parse().map_err(|e| DecodingError::Parse {
            line: self.line,
            message: format!("expected integer, got {l:?}: {e}"),
        })
    }

    fn read_str_payload(&mut self) -> Result<String, DecodingError> {
        let l = self.read_line()?;
        let mut out = String::with_capacity(l.len());
        let mut chars = l.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('\\') => out.push('\\'),
                other => {
                    return Err(DecodingError::Parse {
                        line: self.line,
                        message: format!("bad escape \\{other:?}"),
                    });
                }
            }
        }
        Ok(out)
    }

    /// A length read from the input. Callers must not trust it for allocation sizes.
    fn read_len(&mut self) -> Result<usize, DecodingError> {
        let n = self.read_num()?;
        usize::try_from(n).map_err(|_| DecodingError::Parse {
            line: self.line,
            message: format!("negative length {n}"),
        })
    }

    pub fn read_var(&mut self) -> Result<Var, DecodingError> {
        let code = self.read_num()?;
        let v = match code {
            TYPE_NONE => v_none(),
            TYPE_INT => v_int(self.read_num()?),
            TYPE_OBJ => v_obj(Obj::mk_id(self.read_num()?)),
            TYPE_FLOAT => {
                let l = self.read_line()?;
                let f = l.trim().parse().map_err(|e| DecodingError::Parse {
                    line: self.line,
                    message: format!("expected float, got {l:?}: {e}"),
                })?;
                v_float(f)
            }
            TYPE_ERR => {
                let n = self.read_num()?;
                let e = u8::try_from(n)
                    .ok()
                    .and_then(ErrorCode::from_repr)
                    .ok_or_else(|| DecodingError::Parse {
                        line: self.line,
                        message: format!("unknown error code {n}"),
                    })?;
                v_err(e)
            }
            TYPE_STR => v_string(self.read_str_payload()?),
            TYPE_LIST => {
                let len = self.read_len()?;
                let mut elements = Vec::with_capacity(len.min(MAX_PREALLOCATED));
                for _ in 0..len {
                    elements.push(self.read_var()?);
                }
                v_list_iter(elements)
            }
            TYPE_MAP => {
                let len = self.read_len()?;
                let mut pairs = Vec::with_capacity(len.min(MAX_PREALLOCATED));
                for _ in 0..len {
                    let k = self.read_var()?;
                    let v = self.read_var()?;
                    pairs.push((k, v));
                }
                v_map(pairs)
            }
            TYPE_ANON => {
                let id = self.read_num()? as u64;
                let parent = Obj::mk_id(self.read_num()?);
                crate::v_anon(AnonObject::new(id, parent, self.sink.clone()))
            }
            TYPE_WAIF => {
                let id = self.read_num()? as u64;
                let class = Obj::mk_id(self.read_num()?);
                let owner = Obj::mk_id(self.read_num()?);
                let len = self.read_len()?;
                let mut propvals = Vec::with_capacity(len.min(MAX_PREALLOCATED));
                for _ in 0..len {
                    propvals.push(self.read_var()?);
                }
                crate::v_waif(Waif::new(id, class, owner, propvals, self.sink.clone()))
            }
            code => {
                return Err(DecodingError::UnknownType {
                    line: self.line,
                    code,
                });
            }
        };
        Ok(v)
    }

    /// Read a value that was written with `write_pinned`, and return it already claimed for a
    /// finalization queue, holding no ordinary references.
    pub fn read_pinned(&mut self) -> Result<Pinned, DecodingError> {
        let v = self.read_var()?;
        let pinned = v
            .claim_for_finalization()
            .map_err(|_| DecodingError::NotFinalizable(self.line))?;
        // Dropping our reference leaves the count at zero; the claim keeps it out of the sink.
        drop(v);
        Ok(pinned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorCode::*, SYSTEM_OBJECT, v_anon, v_error_map, v_list, v_str};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn encode(v: &Var) -> String {
        let mut w = VarWriter::new(vec![]);
        w.write_var(v).unwrap();
        String::from_utf8(w.into_inner()).unwrap()
    }

    #[test]
    fn test_textdump_layout() {
        let v = v_list(&[v_int(5), v_str("a\nb"), v_err(E_PERM)]);
        assert_eq!(encode(&v), "4\n3\n0\n5\n2\na\\nb\n3\n3\n");
    }

    #[test]
    fn test_nested_decode() {
        let v = v_list(&[
            v_error_map(E_QUOTA, "back\\slash"),
            v_float(1.5),
            v_none(),
            v_obj(SYSTEM_OBJECT),
        ]);
        let text = encode(&v);
        let mut r = VarReader::new(Cursor::new(text), None);
        assert_eq!(r.read_var().unwrap(), v);
    }

    #[test]
    fn test_pinned_anon() {
        let a = v_anon(AnonObject::new(42, Obj::mk_id(7), None));
        let pinned = a.claim_for_finalization().unwrap();
        drop(a);
        let mut w = VarWriter::new(vec![]);
        w.write_pinned(&pinned).unwrap();
        let text = String::from_utf8(w.into_inner()).unwrap();
        assert_eq!(text, "12\n42\n7\n");

        let mut r = VarReader::new(Cursor::new(text), None);
        let restored = r.read_pinned().unwrap();
        assert_eq!(restored.id(), 42);
        assert_eq!(restored.refcount(), 0);
        assert!(restored.is_queued());
    }

    #[test]
    fn test_errors() {
        let mut r = VarReader::new(Cursor::new("99\n"), None);
        assert!(matches!(
            r.read_var(),
            Err(DecodingError::UnknownType { code: 99, .. })
        ));
        let mut r = VarReader::new(Cursor::new("4\n2\n0\n1\n"), None);
        assert!(matches!(r.read_var(), Err(DecodingError::UnexpectedEof(_))));
        let mut r = VarReader::new(Cursor::new("0\n5\n"), None);
        assert!(matches!(
            r.read_pinned(),
            Err(DecodingError::NotFinalizable(_))
        ));
    }

    #[test]
    fn test_huge_lengths_fail_without_allocating() {
        for input in [
            "4\n9223372036854775807\n",
            "10\n9223372036854775807\n",
            "13\n1\n1\n2\n9223372036854775807\n",
        ] {
            let mut r = VarReader::new(Cursor::new(input), None);
            assert!(
                matches!(r.read_var(), Err(DecodingError::UnexpectedEof(_))),
                "{input:?}"
            );
        }
        let mut r = VarReader::new(Cursor::new("4\n-3\n"), None);
        assert!(matches!(r.read_var(), Err(DecodingError::Parse { .. })));
    }
}
