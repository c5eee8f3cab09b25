// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::GeneralRegisters;
use core::fmt::{Debug, Formatter, Result};

/// Registers an exit handler changed, for exit tracing.
pub struct GeneralRegistersDiff {
    old: GeneralRegisters,
    new: GeneralRegisters,
}

impl GeneralRegistersDiff {
    const RSP_INDEX: u8 = 4;

    pub fn new(old: GeneralRegisters, new: GeneralRegisters) -> Self {
        Self { old, new }
    }

    /// Returns `true` if the handler left every register untouched.
    pub fn is_same(&self) -> bool {
        self.old == self.new
    }

    /// Encodings of the registers whose value differs.
    pub fn changed(&self) -> impl Iterator<Item = u8> + '_ {
        (0..16u8)
            .filter(|&i| i != Self::RSP_INDEX)
            .filter(|&i| self.old.get_reg_of_index(i) != self.new.get_reg_of_index(i))
    }
}

impl Debug for GeneralRegistersDiff {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let mut map = f.debug_map();
        for i in self.changed() {
            map.key(&GeneralRegisters::register_name(i)).value(&format_args!(
                "{:#x} -> {:#x}",
                self.old.get_reg_of_index(i),
                self.new.get_reg_of_index(i)
            ));
        }
        map.finish()
    }
}
