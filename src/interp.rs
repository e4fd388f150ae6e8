use crate::elab::{Module, Node, NodeId, RamId, SubmoduleKind};
use crate::model::RAM64K_BYTES;

impl Module {
    // Advance one half-cycle and return the new clock level. The rising
    // edge is the state-updating tick.
    pub fn step(&mut self) -> bool {
        // publish the caller's input vector into the backing nodes
        for (bit, &node) in self.input_nodes.iter().enumerate() {
            self.nodes[node.0 as usize] = Node::Const(self.inputs[bit]);
        }

        self.load_states();

        let level = !self.clock_level();
        self.nodes[self.clock.0 as usize] = Node::Const(level);
        self.visited.fill(false);

        if level {
            // Every DFF's next value is computed against the previous
            // states of all DFFs, then the whole set commits at once.
            for k in 0..self.state_nodes.len() {
                let id = self.state_nodes[k];
                self.shadow[k] = match self.nodes[id.0 as usize] {
                    Node::Dff { d, .. } => {
                        let driver = self.slots[d.0 as usize];
                        self.eval_rising(driver)
                    }
                    _ => self.eval_rising(id),
                };
            }
            for k in 0..self.state_nodes.len() {
                let value = self.shadow[k];
                let id = self.state_nodes[k];
                match &mut self.nodes[id.0 as usize] {
                    Node::Dff { state, .. } | Node::RamOut { state, .. } => *state = value,
                    _ => {}
                }
            }
            // drop combinational memoisation so the output pass sees the
            // committed states and post-store memory
            self.visited.fill(false);
        }

        for bit in 0..self.output_nodes.len() {
            let node = self.output_nodes[bit];
            self.outputs[bit] = self.eval(node);
        }

        self.snapshot_states();
        level
    }

    // Rising-edge evaluator. DFFs yield their previous state, breaking
    // cycles; touching a RAM block runs its store-then-read cycle.
    fn eval_rising(&mut self, id: NodeId) -> bool {
        let i = id.0 as usize;
        if self.visited[i] {
            return match self.nodes[i] {
                Node::Dff { state, .. } => state,
                _ => self.cached[i],
            };
        }
        self.visited[i] = true;
        match self.nodes[i] {
            Node::Const(value) => {
                self.cached[i] = value;
                value
            }
            Node::Nand { a, b } => {
                let left = self.eval_rising(self.slots[a.0 as usize]);
                let right = self.eval_rising(self.slots[b.0 as usize]);
                let value = !(left && right);
                self.cached[i] = value;
                value
            }
            Node::Dff { state, .. } => {
                self.cached[i] = state;
                state
            }
            Node::RamOut { ram, .. } => {
                self.ram_cycle(ram);
                self.cached[i]
            }
        }
    }

    // Output-pass evaluator: never recurses through a DFF boundary, reads
    // RAM without storing.
    fn eval(&mut self, id: NodeId) -> bool {
        let i = id.0 as usize;
        if self.visited[i] {
            return match self.nodes[i] {
                Node::Dff { state, .. } => state,
                _ => self.cached[i],
            };
        }
        self.visited[i] = true;
        match self.nodes[i] {
            Node::Const(value) => {
                self.cached[i] = value;
                value
            }
            Node::Nand { a, b } => {
                let left = self.eval(self.slots[a.0 as usize]);
                let right = self.eval(self.slots[b.0 as usize]);
                let value = !(left && right);
                self.cached[i] = value;
                value
            }
            Node::Dff { state, .. } => {
                self.cached[i] = state;
                state
            }
            Node::RamOut { ram, .. } => {
                let addrs = self.rams[ram.0 as usize].addrs;
                let mut addr = 0usize;
                for (bit, slot) in addrs.iter().enumerate() {
                    if self.eval(self.slots[slot.0 as usize]) {
                        addr |= 1 << bit;
                    }
                }
                self.ram_publish(ram, addr);
                self.cached[i]
            }
        }
    }

    fn ram_cycle(&mut self, ram: RamId) {
        let r = &self.rams[ram.0 as usize];
        let (ins, load_slot, addrs) = (r.ins, r.load, r.addrs);

        let load = self.eval_rising(self.slots[load_slot.0 as usize]);
        let mut word = 0u16;
        for (bit, slot) in ins.iter().enumerate() {
            if self.eval_rising(self.slots[slot.0 as usize]) {
                word |= 1 << bit;
            }
        }
        let mut addr = 0usize;
        for (bit, slot) in addrs.iter().enumerate() {
            if self.eval_rising(self.slots[slot.0 as usize]) {
                addr |= 1 << bit;
            }
        }
        if load {
            let data = &mut self.rams[ram.0 as usize].data;
            data[addr] = word as u8;
            data[(addr + 1) % RAM64K_BYTES] = (word >> 8) as u8;
        }
        self.ram_publish(ram, addr);
    }

    fn ram_publish(&mut self, ram: RamId, addr: usize) {
        let data = &self.rams[ram.0 as usize].data;
        let word = data[addr] as u16 | (data[(addr + 1) % RAM64K_BYTES] as u16) << 8;
        let outs = self.rams[ram.0 as usize].outs;
        for (bit, out) in outs.iter().enumerate() {
            let i = out.0 as usize;
            self.visited[i] = true;
            self.cached[i] = word >> bit & 1 == 1;
        }
    }

    fn load_states(&mut self) {
        for si in 0..self.submodules.len() {
            let (off, len, kind) = {
                let sub = &self.submodules[si];
                (sub.dff_off, sub.dff_len, sub.kind)
            };
            match kind {
                SubmoduleKind::Dffs => {
                    for j in 0..len {
                        let id = self.state_nodes[off + j];
                        let value = self.submodules[si].states[j];
                        match &mut self.nodes[id.0 as usize] {
                            Node::Dff { state, .. } | Node::RamOut { state, .. } => *state = value,
                            _ => {}
                        }
                    }
                }
                SubmoduleKind::Ram64K => {
                    let Node::RamOut { ram, .. } = self.nodes[self.state_nodes[off].0 as usize]
                    else {
                        continue;
                    };
                    for byte in 0..RAM64K_BYTES {
                        let mut packed = 0u8;
                        for bit in 0..8 {
                            if self.submodules[si].states[byte * 8 + bit] {
                                packed |= 1 << bit;
                            }
                        }
                        self.rams[ram.0 as usize].data[byte] = packed;
                    }
                }
            }
        }
    }

    // bit i of RAM byte j lands at index j*8 + i
    fn snapshot_states(&mut self) {
        for si in 0..self.submodules.len() {
            let (off, len, kind) = {
                let sub = &self.submodules[si];
                (sub.dff_off, sub.dff_len, sub.kind)
            };
            match kind {
                SubmoduleKind::Dffs => {
                    for j in 0..len {
                        let id = self.state_nodes[off + j];
                        let value = match self.nodes[id.0 as usize] {
                            Node::Dff { state, .. } | Node::RamOut { state, .. } => state,
                            _ => false,
                        };
                        self.submodules[si].states[j] = value;
                    }
                }
                SubmoduleKind::Ram64K => {
                    let Node::RamOut { ram, .. } = self.nodes[self.state_nodes[off].0 as usize]
                    else {
                        continue;
                    };
                    for byte in 0..RAM64K_BYTES {
                        let packed = self.rams[ram.0 as usize].data[byte];
                        for bit in 0..8 {
                            self.submodules[si].states[byte * 8 + bit] = packed >> bit & 1 == 1;
                        }
                    }
                }
            }
        }
    }
}
