use log::debug;

use crate::error::{Error, Result};
use crate::model::{
    Connection, DescId, ModuleDesc, OutputDriver, Primitive, RAM64K_BYTES, RAM64K_STATE_BITS,
};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct NodeId(pub u32);

// a slot names the node currently driving one primitive input
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct SlotId(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct RamId(pub u32);

impl NodeId {
    pub(crate) const UNSET: NodeId = NodeId(u32::MAX);
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum Node {
    Const(bool),
    Nand { a: SlotId, b: SlotId },
    Dff { d: SlotId, state: bool },
    RamOut { ram: RamId, state: bool },
}

#[derive(Debug)]
pub(crate) struct Ram {
    pub data: Vec<u8>,
    pub ins: [SlotId; 16],
    pub load: SlotId,
    pub addrs: [SlotId; 16],
    pub outs: [NodeId; 16],
}

#[derive(Debug)]
pub(crate) struct Submodule {
    pub name: String,
    pub dff_off: usize,
    pub dff_len: usize,
    pub kind: SubmoduleKind,
    pub states: Vec<bool>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum SubmoduleKind {
    Dffs,
    Ram64K,
}

#[derive(Debug)]
pub struct Module {
    pub inputs: Vec<bool>,
    pub outputs: Vec<bool>,

    pub(crate) nodes: Vec<Node>,
    pub(crate) slots: Vec<NodeId>,
    pub(crate) rams: Vec<Ram>,
    // DFF and RAM-OUT nodes in elaboration order
    pub(crate) state_nodes: Vec<NodeId>,
    pub(crate) input_nodes: Vec<NodeId>,
    pub(crate) output_nodes: Vec<NodeId>,
    pub(crate) clock: NodeId,
    pub(crate) submodules: Vec<Submodule>,

    // transient per-step evaluation state
    pub(crate) visited: Vec<bool>,
    pub(crate) cached: Vec<bool>,
    pub(crate) shadow: Vec<bool>,
}

impl Module {
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn clock_level(&self) -> bool {
        matches!(self.nodes[self.clock.0 as usize], Node::Const(true))
    }

    // one bit per DFF in declaration order, or 65536*8 bits for a Ram64K
    pub fn state(&self, name: &str) -> Result<&[bool]> {
        self.submodules
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.states.as_slice())
            .ok_or_else(|| Error::Simulation(format!("submodule {name} does not exist")))
    }

    pub fn state_mut(&mut self, name: &str) -> Result<&mut [bool]> {
        self.submodules
            .iter_mut()
            .find(|s| s.name == name)
            .map(|s| s.states.as_mut_slice())
            .ok_or_else(|| Error::Simulation(format!("submodule {name} does not exist")))
    }
}

struct Instance {
    // per input bit, the slots that bit must drive
    sinks: Vec<Vec<SlotId>>,
    outputs: Vec<NodeId>,
    // state-node (offset, len) per part
    part_spans: Vec<(usize, usize)>,
}

struct Builder<'a> {
    descs: &'a [ModuleDesc],
    nodes: Vec<Node>,
    slots: Vec<NodeId>,
    rams: Vec<Ram>,
    state_nodes: Vec<NodeId>,
    const0: NodeId,
    const1: NodeId,
}

impl<'a> Builder<'a> {
    fn add_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn add_slot(&mut self) -> SlotId {
        let id = SlotId(self.slots.len() as u32);
        self.slots.push(NodeId::UNSET);
        id
    }

    // post-order: children exist before the enclosing module wires them up
    fn build(&mut self, desc_id: DescId) -> Result<Instance> {
        let desc: &'a ModuleDesc = &self.descs[desc_id.0 as usize];

        match desc.prim {
            Some(Primitive::Nand) => {
                let a = self.add_slot();
                let b = self.add_slot();
                let node = self.add_node(Node::Nand { a, b });
                return Ok(Instance {
                    sinks: vec![vec![a], vec![b]],
                    outputs: vec![node],
                    part_spans: Vec::new(),
                });
            }
            Some(Primitive::Dff) => {
                let d = self.add_slot();
                let node = self.add_node(Node::Dff { d, state: false });
                self.state_nodes.push(node);
                return Ok(Instance {
                    sinks: vec![vec![d]],
                    outputs: vec![node],
                    part_spans: Vec::new(),
                });
            }
            Some(Primitive::Ram64K) => return self.build_ram(),
            None => {}
        }

        let mut children = Vec::with_capacity(desc.parts.len());
        let mut part_spans = Vec::with_capacity(desc.parts.len());
        for part in &desc.parts {
            let start = self.state_nodes.len();
            let child = self.build(part.desc)?;
            part_spans.push((start, self.state_nodes.len() - start));
            children.push(child);
        }

        let mut sinks: Vec<Vec<SlotId>> = desc
            .sink_counts
            .iter()
            .map(|&count| Vec::with_capacity(count))
            .collect();

        for (pi, part) in desc.parts.iter().enumerate() {
            for (bit, conn) in part.connections.iter().enumerate() {
                match *conn {
                    Connection::External(param_bit) => {
                        sinks[param_bit].extend_from_slice(&children[pi].sinks[bit]);
                    }
                    Connection::Internal { part: sp, bit: sb } => {
                        let driver = children[sp].outputs[sb];
                        for &slot in &children[pi].sinks[bit] {
                            self.slots[slot.0 as usize] = driver;
                        }
                    }
                    Connection::Constant(value) => {
                        let driver = if value { self.const1 } else { self.const0 };
                        for &slot in &children[pi].sinks[bit] {
                            self.slots[slot.0 as usize] = driver;
                        }
                    }
                }
            }
        }

        let outputs = desc
            .drivers
            .iter()
            .map(|driver| match *driver {
                OutputDriver::Part { part, bit } => children[part].outputs[bit],
                OutputDriver::Constant(value) => {
                    if value {
                        self.const1
                    } else {
                        self.const0
                    }
                }
            })
            .collect();

        Ok(Instance {
            sinks,
            outputs,
            part_spans,
        })
    }

    fn build_ram(&mut self) -> Result<Instance> {
        let mut data = Vec::new();
        reserve(&mut data, RAM64K_BYTES)?;
        data.resize(RAM64K_BYTES, 0);

        let ram_id = RamId(self.rams.len() as u32);
        let ins = std::array::from_fn(|_| self.add_slot());
        let load = self.add_slot();
        let addrs = std::array::from_fn(|_| self.add_slot());
        let outs = std::array::from_fn(|_| {
            let node = self.add_node(Node::RamOut {
                ram: ram_id,
                state: false,
            });
            self.state_nodes.push(node);
            node
        });
        self.rams.push(Ram {
            data,
            ins,
            load,
            addrs,
            outs,
        });

        // sink order matches the declared interface: in[16], load, addr[16]
        let mut sinks = Vec::with_capacity(33);
        sinks.extend(ins.iter().map(|&s| vec![s]));
        sinks.push(vec![load]);
        sinks.extend(addrs.iter().map(|&s| vec![s]));

        Ok(Instance {
            sinks,
            outputs: outs.to_vec(),
            part_spans: Vec::new(),
        })
    }
}

pub(crate) fn instantiate(descs: &[ModuleDesc], desc_id: DescId) -> Result<Module> {
    let desc = &descs[desc_id.0 as usize];

    let mut nodes = Vec::new();
    reserve(&mut nodes, desc.node_count + desc.input_bits + 3)?;
    let mut builder = Builder {
        descs,
        nodes,
        slots: Vec::new(),
        rams: Vec::new(),
        state_nodes: Vec::with_capacity(desc.dff_count),
        const0: NodeId::UNSET,
        const1: NodeId::UNSET,
    };
    builder.const0 = builder.add_node(Node::Const(false));
    builder.const1 = builder.add_node(Node::Const(true));
    // the clock starts high so the first step is a low half-cycle
    let clock = builder.add_node(Node::Const(true));

    let root = builder.build(desc_id)?;

    if builder.nodes.len() != desc.node_count + 3 {
        return Err(Error::Internal(format!(
            "elaborated {} nodes but the description counts {}",
            builder.nodes.len() - 3,
            desc.node_count
        )));
    }
    if builder.state_nodes.len() != desc.dff_count {
        return Err(Error::Internal(format!(
            "elaborated {} state nodes but the description counts {}",
            builder.state_nodes.len(),
            desc.dff_count
        )));
    }

    // every module input bit is backed by a fresh constant node that
    // step() publishes the caller's input vector into
    let mut input_nodes = Vec::with_capacity(desc.input_bits);
    for bit in 0..desc.input_bits {
        let node = builder.add_node(Node::Const(false));
        input_nodes.push(node);
        for &slot in &root.sinks[bit] {
            builder.slots[slot.0 as usize] = node;
        }
    }

    if builder.slots.contains(&NodeId::UNSET) {
        return Err(Error::Internal(
            "an input slot was left without a driver".into(),
        ));
    }

    let mut submodules = Vec::new();
    for (pi, part) in desc.parts.iter().enumerate() {
        let Some(label) = &part.label else { continue };
        let (dff_off, dff_len) = root.part_spans[pi];
        let part_desc = &descs[part.desc.0 as usize];
        let (kind, bits) = if part_desc.prim == Some(Primitive::Ram64K) {
            (SubmoduleKind::Ram64K, RAM64K_STATE_BITS)
        } else {
            (SubmoduleKind::Dffs, dff_len)
        };
        let mut states = Vec::new();
        reserve(&mut states, bits)?;
        states.resize(bits, false);
        submodules.push(Submodule {
            name: label.clone(),
            dff_off,
            dff_len,
            kind,
            states,
        });
    }

    let node_total = builder.nodes.len();
    let state_total = builder.state_nodes.len();
    let module = Module {
        inputs: vec![false; desc.input_bits],
        outputs: vec![false; desc.output_bits],
        visited: vec![false; node_total],
        cached: vec![false; node_total],
        shadow: vec![false; state_total],
        nodes: builder.nodes,
        slots: builder.slots,
        rams: builder.rams,
        state_nodes: builder.state_nodes,
        input_nodes,
        output_nodes: root.outputs,
        clock,
        submodules,
    };
    debug!(
        "instantiated {}: {} nodes, {} state bits, {} ram blocks",
        desc.name,
        node_total,
        state_total,
        module.rams.len()
    );
    Ok(module)
}

fn reserve<T>(vec: &mut Vec<T>, additional: usize) -> Result<()> {
    vec.try_reserve_exact(additional)
        .map_err(|_| Error::Memory(format!("failed to allocate {additional} elements")))
}
