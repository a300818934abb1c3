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

//! The object database, as far as the scheduler is concerned: a section of each checkpoint, and
//! the place finalizers and object destruction are looked up.

use std::io::{BufRead, Write};

use stunt_var::{DecodingError, Obj, Pinned, SYSTEM_OBJECT, Var, VarReader, VarWriter};
use tracing::debug;

use crate::tasks::task::TaskBody;

pub trait Database: Send {
    /// Write the object section of a checkpoint. Must be readable by `read_objects` from the
    /// same position, consuming exactly what was written.
    fn write_objects(&self, writer: &mut VarWriter<&mut dyn Write>) -> Result<(), std::io::Error>;

    fn read_objects(
        &mut self,
        reader: &mut VarReader<&mut dyn BufRead>,
    ) -> Result<(), DecodingError>;

    /// The task that runs `value`'s finalizer (its `recycle` verb), if it has one.
    fn finalizer(&mut self, value: Var) -> Option<Box<dyn TaskBody>>;

    /// The value is about to be freed for good.
    fn destroy(&mut self, value: &Pinned);

    /// Whether `player` carries the wizard flag. Server-control builtins require it.
    fn is_wizard(&self, player: Obj) -> bool;

    /// The highest anonymous object or waif id this database holds, so new ones don't collide.
    fn max_object_id(&self) -> u64 {
        0
    }
}

/// A database with no objects and no finalizers. Only the system object, which server-initiated
/// tasks run as, is a wizard.
pub struct NoopDatabase {}

impl Database for NoopDatabase {
    fn write_objects(&self, writer: &mut VarWriter<&mut dyn Write>) -> Result<(), std::io::Error> {
        writer.write_line("0 objects")
    }

    fn read_objects(
        &mut self,
        reader: &mut VarReader<&mut dyn BufRead>,
    ) -> Result<(), DecodingError> {
        reader.read_line()?;
        Ok(())
    }

    fn finalizer(&mut self, _value: Var) -> Option<Box<dyn TaskBody>> {
        None
    }

    fn destroy(&mut self, value: &Pinned) {
        debug!(?value, "Destroyed");
    }

    fn is_wizard(&self, player: Obj) -> bool {
        player == SYSTEM_OBJECT
    }
}
