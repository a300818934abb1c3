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

use crate::Var;
use crate::heap::HeapPayload;
use std::ops::Index;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct List(Vec<Var>);

impl List {
    pub fn from_vec(elements: Vec<Var>) -> Self {
        Self(elements)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Var> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Var> {
        self.0.get(index)
    }
}

impl Index<usize> for List {
    type Output = Var;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl HeapPayload for List {
    const MAY_CYCLE: bool = true;
}
