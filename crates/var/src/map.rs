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

/// Association of keys to values, kept in insertion order. Keys are unique.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Map(Vec<(Var, Var)>);

impl Map {
    pub fn from_pairs(pairs: Vec<(Var, Var)>) -> Self {
        let mut map = Map(Vec::with_capacity(pairs.len()));
        for (k, v) in pairs {
            map.insert(k, v);
        }
        map
    }

    fn insert(&mut self, key: Var, value: Var) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &Var) -> Option<&Var> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Var, &Var)> {
        self.0.iter().map(|(k, v)| (k, v))
    }
}

impl HeapPayload for Map {
    const MAY_CYCLE: bool = true;
}
