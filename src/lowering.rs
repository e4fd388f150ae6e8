use crate::ast::{self, Expr, ExprKind, Ident, Literal, Strings};
use crate::error::{bail_compile, ensure_compile, line_at, Result};
use crate::model::{
    Connection, DescId, ModuleDesc, OutputDriver, PartInst, MAX_INPUTS, MAX_OUTPUTS, MAX_PARTS,
    MAX_WIRES,
};

// A symbolic operand: a (possibly sliced) name or a constant bit. Width
// stays unknown until inference fills it in.
#[derive(Copy, Clone)]
struct Entry {
    pos: usize,
    kind: EntryKind,
    offset: usize,
    width: Option<usize>,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum EntryKind {
    Name(Ident),
    Const(bool),
}

struct PartSyms {
    inputs: Vec<Entry>,
    outputs: Vec<Entry>,
}

struct WireSyms {
    inputs: Vec<Entry>,
    output: Entry,
}

pub fn lower_module(
    code: &str,
    module: &ast::Module,
    ctx: &mut Strings,
    descs: &[ModuleDesc],
    id_counter: &mut u32,
) -> Result<ModuleDesc> {
    Lowering {
        code,
        ctx,
        descs,
        id_counter,
        module_name: String::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        parts: Vec::new(),
        part_descs: Vec::new(),
        part_labels: Vec::new(),
        part_poses: Vec::new(),
        wires: Vec::new(),
        wire_done: Vec::new(),
        wire_visiting: Vec::new(),
    }
    .run(module)
}

struct Lowering<'a> {
    code: &'a str,
    ctx: &'a mut Strings,
    descs: &'a [ModuleDesc],
    id_counter: &'a mut u32,

    module_name: String,
    inputs: Vec<Entry>,
    outputs: Vec<Entry>,
    parts: Vec<PartSyms>,
    part_descs: Vec<DescId>,
    part_labels: Vec<Option<Ident>>,
    part_poses: Vec<usize>,
    wires: Vec<WireSyms>,
    wire_done: Vec<bool>,
    wire_visiting: Vec<bool>,
}

impl<'a> Lowering<'a> {
    fn run(mut self, module: &ast::Module) -> Result<ModuleDesc> {
        self.module_name = self.ctx[module.name].to_string();
        let line = self.line(module.pos);

        for param in &module.params {
            let entry = self.interface_entry(param)?;
            self.inputs.push(entry);
        }
        for param in &module.outputs {
            let entry = self.interface_entry(param)?;
            self.outputs.push(entry);
        }
        let input_bits = abs_offset(&self.inputs, self.inputs.len());
        let output_bits = abs_offset(&self.outputs, self.outputs.len());
        ensure_compile!(
            input_bits <= MAX_INPUTS,
            line,
            "Module '{}' exceeds the maximum of {} input bits",
            self.module_name,
            MAX_INPUTS
        );
        ensure_compile!(
            output_bits <= MAX_OUTPUTS,
            line,
            "Module '{}' exceeds the maximum of {} output bits",
            self.module_name,
            MAX_OUTPUTS
        );

        for stmt in &module.body {
            match &stmt.inner {
                ast::StmtInner::Part(part) => self.add_part(stmt.pos, part)?,
                ast::StmtInner::Wire(wire) => self.add_wire(wire)?,
            }
        }
        ensure_compile!(
            !self.parts.is_empty() || !self.wires.is_empty(),
            line,
            "Module '{}' must contain at least one part or wire",
            self.module_name
        );

        for i in 0..self.parts.len() {
            self.infer_part(i)?;
        }
        self.wire_done = vec![false; self.wires.len()];
        self.wire_visiting = vec![false; self.wires.len()];
        for w in 0..self.wires.len() {
            self.infer_wire(w)?;
        }

        let mut conn_lists: Vec<Vec<Connection>> = vec![Vec::new(); self.parts.len()];
        for i in 0..self.parts.len() {
            self.connect_part(i, &mut conn_lists)?;
        }

        let mut drivers: Vec<Option<OutputDriver>> = vec![None; output_bits];
        self.connect_outputs(&mut drivers)?;
        for (bit, driver) in drivers.iter().enumerate() {
            if driver.is_none() {
                let entry = self.output_param_of_bit(bit);
                bail_compile!(
                    self.line(entry.pos),
                    "Module output '{}' is never driven",
                    self.entry_name(entry)
                );
            }
        }

        // connection lists must cover every input bit of every part
        for (i, conns) in conn_lists.iter().enumerate() {
            let desc = self.part_desc(i);
            ensure_compile!(
                conns.len() == desc.input_bits,
                self.line(self.part_poses[i]),
                "Part '{}' is wired to {} bits but declares {} input bits",
                desc.name,
                conns.len(),
                desc.input_bits
            );
        }

        // each input bit's total sink count, summed over the sinks the
        // consuming parts publish for the bits it feeds
        let mut sink_counts = vec![0usize; input_bits];
        for (i, conns) in conn_lists.iter().enumerate() {
            let desc = self.part_desc(i);
            for (bit, conn) in conns.iter().enumerate() {
                if let Connection::External(param_bit) = conn {
                    sink_counts[*param_bit] += desc.sink_counts[bit];
                }
            }
        }

        let node_count = (0..self.parts.len()).map(|i| self.part_desc(i).node_count).sum();
        let dff_count = (0..self.parts.len()).map(|i| self.part_desc(i).dff_count).sum();

        let parts = self
            .part_descs
            .iter()
            .zip(&self.part_labels)
            .zip(conn_lists)
            .map(|((&desc, &label), connections)| PartInst {
                desc,
                label: label.map(|l| self.ctx[l].to_string()),
                connections,
            })
            .collect();

        Ok(ModuleDesc {
            name: self.module_name,
            input_widths: self.inputs.iter().map(|e| e.width.unwrap_or(0)).collect(),
            output_widths: self.outputs.iter().map(|e| e.width.unwrap_or(0)).collect(),
            input_bits,
            output_bits,
            parts,
            drivers: drivers.into_iter().flatten().collect(),
            sink_counts,
            node_count,
            dff_count,
            prim: None,
        })
    }

    fn interface_entry(&self, param: &ast::Param) -> Result<Entry> {
        let width = match param.slice {
            None => 1,
            Some(ast::Slice { start, end: None }) => {
                ensure_compile!(
                    start >= 1,
                    self.line(param.pos),
                    "Bus width of '{}' must be at least 1",
                    &self.ctx[param.name]
                );
                start
            }
            Some(ast::Slice { end: Some(_), .. }) => bail_compile!(
                self.line(param.pos),
                "Parameter declaration must be a single input or bus[n]"
            ),
        };
        Ok(Entry {
            pos: param.pos,
            kind: EntryKind::Name(param.name),
            offset: 0,
            width: Some(width),
        })
    }

    fn add_part(&mut self, pos: usize, part: &ast::Part) -> Result<()> {
        ensure_compile!(
            self.parts.len() < MAX_PARTS,
            self.line(pos),
            "Module exceeds the maximum of {} parts",
            MAX_PARTS
        );
        if let Some(label) = part.label {
            ensure_compile!(
                !self.part_labels.contains(&Some(label)),
                self.line(pos),
                "Part name '{}' already exists in this module",
                &self.ctx[label]
            );
        }
        let module_name = &self.ctx[part.module];
        let Some(desc_id) = find_desc(self.descs, module_name) else {
            bail_compile!(
                self.line(pos),
                "Attempting to use nonexistent module '{}'",
                module_name
            );
        };
        let desc = &self.descs[desc_id.0 as usize];
        let (in_params, out_params) = (desc.input_widths.len(), desc.output_widths.len());

        let mut inputs = Vec::with_capacity(part.inputs.len());
        for expr in &part.inputs {
            let entry = self.entry(expr, false)?;
            inputs.push(entry);
        }
        ensure_compile!(
            inputs.len() == in_params,
            self.line(pos),
            "Argument count of '{}' doesn't match module declaration. Actual {} vs expected {}",
            &self.ctx[part.module],
            inputs.len(),
            in_params
        );

        let mut outputs = Vec::with_capacity(part.outputs.len());
        for expr in &part.outputs {
            let entry = self.entry(expr, true)?;
            outputs.push(entry);
        }
        ensure_compile!(
            outputs.len() == out_params,
            self.line(pos),
            "'{}' output count doesn't match module declaration",
            &self.ctx[part.module]
        );

        self.parts.push(PartSyms { inputs, outputs });
        self.part_descs.push(desc_id);
        self.part_labels.push(part.label);
        self.part_poses.push(pos);
        Ok(())
    }

    fn add_wire(&mut self, wire: &ast::Wire) -> Result<()> {
        let mut inputs = Vec::with_capacity(wire.inputs.len());
        for expr in &wire.inputs {
            let entry = self.entry(expr, false)?;
            inputs.push(entry);
        }
        let output = self.entry(&wire.output, true)?;
        ensure_compile!(
            self.wires.len() < MAX_WIRES,
            self.line(output.pos),
            "Module exceeds the maximum of {} wires",
            MAX_WIRES
        );
        self.wires.push(WireSyms { inputs, output });
        Ok(())
    }

    // `sink` positions (part outputs, wire outputs) only accept identifiers
    fn entry(&mut self, expr: &Expr, sink: bool) -> Result<Entry> {
        let line = self.line(expr.pos);
        match &expr.kind {
            ExprKind::Name { name, slice } => {
                let (offset, width) = match slice {
                    None => (0, None),
                    Some(ast::Slice { start, end: None }) => (*start, Some(1)),
                    Some(ast::Slice {
                        start,
                        end: Some(end),
                    }) => {
                        ensure_compile!(
                            end >= start,
                            line,
                            "Slice ending index must be larger than starting index"
                        );
                        (*start, Some(end - start + 1))
                    }
                };
                Ok(Entry {
                    pos: expr.pos,
                    kind: EntryKind::Name(*name),
                    offset,
                    width,
                })
            }
            ExprKind::Literal(lit) => {
                ensure_compile!(!sink, line, "Output must be an identifier");
                let value = match lit {
                    Literal::Int(0) => false,
                    Literal::Int(1) => true,
                    _ => bail_compile!(line, "Constant inputs must be 0 or 1"),
                };
                Ok(Entry {
                    pos: expr.pos,
                    kind: EntryKind::Const(value),
                    offset: 0,
                    width: None,
                })
            }
            ExprKind::Group(items) => {
                ensure_compile!(!sink, line, "Output must be an identifier");
                let mut inputs = Vec::with_capacity(items.len());
                for item in items {
                    let entry = self.entry(item, false)?;
                    inputs.push(entry);
                }
                ensure_compile!(
                    self.wires.len() < MAX_WIRES,
                    line,
                    "Module exceeds the maximum of {} wires",
                    MAX_WIRES
                );
                *self.id_counter += 1;
                let name = self.ctx.intern(&format!("_{}_", self.id_counter));
                let output = Entry {
                    pos: expr.pos,
                    kind: EntryKind::Name(name),
                    offset: 0,
                    width: None,
                };
                self.wires.push(WireSyms { inputs, output });
                Ok(output)
            }
        }
    }

    fn infer_part(&mut self, i: usize) -> Result<()> {
        let desc = self.part_desc(i);

        for j in 0..self.parts[i].outputs.len() {
            let mut entry = self.parts[i].outputs[j];
            if entry.width.is_some() {
                continue;
            }
            entry.width = Some(desc.output_widths[j]);
            self.parts[i].outputs[j] = entry;

            if let EntryKind::Name(name) = entry.kind {
                if let Some(idx) = self.module_output_idx(name) {
                    ensure_compile!(
                        self.outputs[idx].width == entry.width,
                        self.line(entry.pos),
                        "'{}' output does not match declared output width",
                        self.module_name
                    );
                }
            }
        }

        for j in 0..self.parts[i].inputs.len() {
            let mut entry = self.parts[i].inputs[j];
            if entry.width.is_some() {
                continue;
            }
            let width = desc.input_widths[j];
            entry.width = Some(width);
            self.parts[i].inputs[j] = entry;

            if let EntryKind::Name(name) = entry.kind {
                if let Some((p, sym)) = self.part_output(name) {
                    let actual = self.part_desc(p).output_widths[sym];
                    ensure_compile!(
                        actual == width,
                        self.line(entry.pos),
                        "Part expects input width of {}, but '{}' is of width {}",
                        width,
                        &self.ctx[name],
                        actual
                    );
                }
                if let Some(idx) = self.module_input_idx(name) {
                    ensure_compile!(
                        self.inputs[idx].width == Some(width),
                        self.line(entry.pos),
                        "'{}' input '{}' does not match declared input width",
                        desc.name,
                        &self.ctx[name]
                    );
                }
            }
        }
        Ok(())
    }

    // output width = sum of input widths; referenced wires resolve on demand
    fn infer_wire(&mut self, w: usize) -> Result<()> {
        if self.wire_done[w] {
            return Ok(());
        }
        let output = self.wires[w].output;
        ensure_compile!(
            !self.wire_visiting[w],
            self.line(output.pos),
            "wire '{}' is defined in terms of itself",
            self.entry_name(output)
        );
        self.wire_visiting[w] = true;

        let mut total = 0;
        for i in 0..self.wires[w].inputs.len() {
            let mut entry = self.wires[w].inputs[i];
            if let Some(width) = entry.width {
                total += width;
                continue;
            }
            let width = match entry.kind {
                EntryKind::Const(_) => 1,
                EntryKind::Name(name) => {
                    if let Some(idx) = self.module_input_idx(name) {
                        self.inputs[idx].width.unwrap_or(1)
                    } else if let Some((p, sym)) = self.part_output(name) {
                        self.part_desc(p).output_widths[sym]
                    } else if let Some(other) = self.wire_idx(name) {
                        self.infer_wire(other)?;
                        self.wires[other].output.width.unwrap_or(0)
                    } else {
                        bail_compile!(
                            self.line(entry.pos),
                            "'{}' not declared in module",
                            &self.ctx[name]
                        );
                    }
                }
            };
            entry.width = Some(width);
            self.wires[w].inputs[i] = entry;
            total += width;
        }

        if let Some(declared) = self.wires[w].output.width {
            ensure_compile!(
                declared == total,
                self.line(output.pos),
                "wire '{}' width does not match its inputs",
                self.entry_name(output)
            );
        }
        self.wires[w].output.width = Some(total);
        self.wire_done[w] = true;
        self.wire_visiting[w] = false;
        Ok(())
    }

    // resolution order: module input, sibling part output, wire, constant
    fn connect_part(&self, i: usize, conn_lists: &mut [Vec<Connection>]) -> Result<()> {
        let desc = self.part_desc(i);
        for j in 0..self.parts[i].inputs.len() {
            let entry = self.parts[i].inputs[j];
            let width = entry.width.unwrap_or(0);
            match entry.kind {
                EntryKind::Const(value) => {
                    for _ in 0..width {
                        conn_lists[i].push(Connection::Constant(value));
                    }
                }
                EntryKind::Name(name) => {
                    if let Some(idx) = self.module_input_idx(name) {
                        ensure_compile!(
                            width == desc.input_widths[j],
                            self.line(entry.pos),
                            "Input count does not match module declaration"
                        );
                        let off = abs_offset(&self.inputs, idx);
                        for k in 0..width {
                            conn_lists[i].push(Connection::External(off + entry.offset + k));
                        }
                    } else if let Some((p, sym)) = self.part_output(name) {
                        let out_off = abs_offset(&self.parts[p].outputs, sym);
                        for k in 0..width {
                            conn_lists[i].push(Connection::Internal {
                                part: p,
                                bit: out_off + entry.offset + k,
                            });
                        }
                    } else if let Some(wire) = self.wire_idx(name) {
                        let before = conn_lists[i].len();
                        self.expand_wire_to_part(wire, i, conn_lists)?;
                        let supplied = conn_lists[i].len() - before;
                        ensure_compile!(
                            supplied == width && entry.offset == 0,
                            self.line(entry.pos),
                            "Wire '{}' supplies {} bits but '{}' expects {}",
                            &self.ctx[name],
                            supplied,
                            desc.name,
                            width
                        );
                    } else {
                        bail_compile!(
                            self.line(entry.pos),
                            "Identifier '{}' not declared",
                            &self.ctx[name]
                        );
                    }
                }
            }
        }
        Ok(())
    }

    // one connection per source bit, transitively, in wire order
    fn expand_wire_to_part(
        &self,
        wire: usize,
        i: usize,
        conn_lists: &mut [Vec<Connection>],
    ) -> Result<()> {
        for entry in &self.wires[wire].inputs {
            let width = entry.width.unwrap_or(0);
            match entry.kind {
                EntryKind::Const(value) => {
                    for _ in 0..width {
                        conn_lists[i].push(Connection::Constant(value));
                    }
                }
                EntryKind::Name(name) => {
                    if let Some(other) = self.wire_idx(name) {
                        self.expand_wire_to_part(other, i, conn_lists)?;
                    } else if let Some(idx) = self.module_input_idx(name) {
                        let off = abs_offset(&self.inputs, idx);
                        for k in 0..width {
                            conn_lists[i].push(Connection::External(off + entry.offset + k));
                        }
                    } else if let Some((p, sym)) = self.part_output(name) {
                        let out_off = abs_offset(&self.parts[p].outputs, sym);
                        for k in 0..width {
                            conn_lists[i].push(Connection::Internal {
                                part: p,
                                bit: out_off + entry.offset + k,
                            });
                        }
                    } else {
                        bail_compile!(
                            self.line(entry.pos),
                            "'{}' not declared",
                            &self.ctx[name]
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn connect_outputs(&self, drivers: &mut [Option<OutputDriver>]) -> Result<()> {
        for i in 0..self.parts.len() {
            let mut cursor = 0;
            for entry in &self.parts[i].outputs {
                let width = entry.width.unwrap_or(0);
                if let EntryKind::Name(name) = entry.kind {
                    if let Some(idx) = self.module_output_idx(name) {
                        let declared = self.outputs[idx].width.unwrap_or(0);
                        ensure_compile!(
                            entry.offset + width <= declared,
                            self.line(entry.pos),
                            "Output is larger in width than module output"
                        );
                        let out_off = abs_offset(&self.outputs, idx);
                        for k in 0..width {
                            self.set_driver(
                                drivers,
                                out_off + entry.offset + k,
                                OutputDriver::Part {
                                    part: i,
                                    bit: cursor + k,
                                },
                                entry,
                            )?;
                        }
                    }
                }
                cursor += width;
            }
        }

        for w in 0..self.wires.len() {
            let output = self.wires[w].output;
            let EntryKind::Name(name) = output.kind else {
                continue;
            };
            if let Some(idx) = self.module_output_idx(name) {
                let mut cursor = abs_offset(&self.outputs, idx) + output.offset;
                self.expand_wire_to_output(w, &mut cursor, drivers)?;
            }
        }
        Ok(())
    }

    fn expand_wire_to_output(
        &self,
        wire: usize,
        cursor: &mut usize,
        drivers: &mut [Option<OutputDriver>],
    ) -> Result<()> {
        for entry in &self.wires[wire].inputs {
            let width = entry.width.unwrap_or(0);
            match entry.kind {
                EntryKind::Const(value) => {
                    ensure_compile!(
                        *cursor < drivers.len(),
                        self.line(entry.pos),
                        "Wire drives more bits than the module output holds"
                    );
                    drivers[*cursor] = Some(OutputDriver::Constant(value));
                    *cursor += 1;
                }
                EntryKind::Name(name) => {
                    if let Some(other) = self.wire_idx(name) {
                        self.expand_wire_to_output(other, cursor, drivers)?;
                    } else if self.module_input_idx(name).is_some() {
                        bail_compile!(
                            self.line(entry.pos),
                            "Invalid connection. Module input '{}' is connected to module output",
                            &self.ctx[name]
                        );
                    } else if let Some((p, sym)) = self.part_output(name) {
                        let out_off = abs_offset(&self.parts[p].outputs, sym);
                        for k in 0..width {
                            ensure_compile!(
                                *cursor < drivers.len(),
                                self.line(entry.pos),
                                "Wire drives more bits than the module output holds"
                            );
                            drivers[*cursor] = Some(OutputDriver::Part {
                                part: p,
                                bit: out_off + entry.offset + k,
                            });
                            *cursor += 1;
                        }
                    } else {
                        bail_compile!(
                            self.line(entry.pos),
                            "'{}' not declared",
                            &self.ctx[name]
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn set_driver(
        &self,
        drivers: &mut [Option<OutputDriver>],
        bit: usize,
        driver: OutputDriver,
        entry: &Entry,
    ) -> Result<()> {
        ensure_compile!(
            bit < drivers.len(),
            self.line(entry.pos),
            "Output is larger in width than module output"
        );
        ensure_compile!(
            drivers[bit].is_none(),
            self.line(entry.pos),
            "Module output '{}' is driven more than once",
            self.entry_name(*entry)
        );
        drivers[bit] = Some(driver);
        Ok(())
    }

    fn part_desc(&self, i: usize) -> &'a ModuleDesc {
        &self.descs[self.part_descs[i].0 as usize]
    }

    fn module_input_idx(&self, name: Ident) -> Option<usize> {
        self.inputs.iter().position(|e| e.kind == EntryKind::Name(name))
    }

    fn module_output_idx(&self, name: Ident) -> Option<usize> {
        self.outputs.iter().position(|e| e.kind == EntryKind::Name(name))
    }

    fn part_output(&self, name: Ident) -> Option<(usize, usize)> {
        for (p, part) in self.parts.iter().enumerate() {
            if let Some(sym) = part
                .outputs
                .iter()
                .position(|e| e.kind == EntryKind::Name(name))
            {
                return Some((p, sym));
            }
        }
        None
    }

    fn wire_idx(&self, name: Ident) -> Option<usize> {
        self.wires
            .iter()
            .position(|w| w.output.kind == EntryKind::Name(name))
    }

    fn entry_name(&self, entry: Entry) -> &str {
        match entry.kind {
            EntryKind::Name(name) => &self.ctx[name],
            EntryKind::Const(_) => "constant",
        }
    }

    fn output_param_of_bit(&self, bit: usize) -> Entry {
        let mut off = 0;
        for entry in &self.outputs {
            let width = entry.width.unwrap_or(0);
            if bit < off + width {
                return *entry;
            }
            off += width;
        }
        unreachable!("output bit within declared range")
    }

    fn line(&self, pos: usize) -> usize {
        line_at(self.code, pos)
    }
}

fn abs_offset(entries: &[Entry], end: usize) -> usize {
    entries[..end].iter().map(|e| e.width.unwrap_or(0)).sum()
}

pub fn find_desc(descs: &[ModuleDesc], name: &str) -> Option<DescId> {
    descs
        .iter()
        .position(|d| d.name == name)
        .map(|i| DescId(i as u32))
}
