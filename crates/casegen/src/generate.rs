use std::collections::BTreeSet;

use crate::analysis::{CodeSection, LabelTable};
use crate::cwriter::CWriter;
use crate::database::{self, Bundle};
use crate::emitter::Emitter;
use crate::errors::CodegenError;
use crate::stack::{StackOffset, Storage};

#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateOptions {
    pub trace_stacks: bool,
}

/// Generate the dispatch cases for every instruction in the bundle, in
/// declaration order. Each instruction's output is buffered separately
/// and appended whole, so a parallel caller could emit independent
/// instructions concurrently against the shared read-only label table.
pub fn generate(bundle: &Bundle, options: &GenerateOptions) -> Result<String, CodegenError> {
    let labels = database::label_table(bundle);
    let deallocs = database::non_escaping_deallocs(bundle);
    let mut pieces: Vec<String> = Vec::new();
    for def in &bundle.instructions {
        let code = database::resolve(def)?;
        let mut out = CWriter::new();
        emit_case(&mut out, &code, &labels, &deallocs, options.trace_stacks)?;
        pieces.push(out.finish());
    }
    let mut text = String::from("// This file is generated by casegen.\n// Do not edit!\n\n");
    for piece in &pieces {
        text.push_str(piece);
        text.push('\n');
    }
    Ok(text)
}

fn emit_case(
    out: &mut CWriter,
    code: &CodeSection,
    labels: &LabelTable,
    deallocs: &BTreeSet<String>,
    trace_stacks: bool,
) -> Result<(), CodegenError> {
    out.start_line();
    out.emit_str(&format!("TARGET({}) {{\n", code.name));
    let storage = Storage::for_section(code);
    declare_inputs(out, code);
    declare_outputs(out, code);
    let mut emitter = Emitter::new(out, labels, deallocs, trace_stacks);
    let (reachable, mut storage) = emitter.emit_tokens(code, storage)?;
    // A body ending in an unconditional transfer gets no fall-through
    // epilogue; its jump already left the stack in the target's state.
    if reachable {
        let end = code.body.last();
        storage.flush(out).map_err(|e| match end {
            Some(tkn) => CodegenError::at(e.0, tkn),
            None => CodegenError::new(e.0, 1, 1),
        })?;
        out.start_line();
        out.emit_str("DISPATCH();\n");
    }
    out.start_line();
    out.emit_str("}\n");
    Ok(())
}

/// Declare a local binding per input slot and load it from its real
/// stack location. Array operands bind a pointer to their first slot.
fn declare_inputs(out: &mut CWriter, code: &CodeSection) {
    let total = StackOffset::of_items(&code.inputs);
    let mut cursor = total.negated();
    for item in &code.inputs {
        out.start_line();
        let ty = item.c_type();
        if ty.ends_with('*') {
            out.emit_str(&format!("{}{};\n", ty, item.name));
        } else {
            out.emit_str(&format!("{} {};\n", ty, item.name));
        }
        if item.is_array() {
            out.emit_str(&format!(
                "{} = &stack_pointer[{}];\n",
                item.name,
                cursor.as_c_expr()
            ));
        } else {
            out.emit_str(&format!(
                "{} = stack_pointer[{}];\n",
                item.name,
                cursor.as_c_expr()
            ));
        }
        cursor.push_item(item);
    }
}

/// Outputs get a bare declaration; the body defines them. A name shared
/// with an input reuses the input's binding.
fn declare_outputs(out: &mut CWriter, code: &CodeSection) {
    for item in &code.outputs {
        if code.inputs.iter().any(|i| i.name == item.name) {
            continue;
        }
        out.start_line();
        let ty = item.c_type();
        if ty.ends_with('*') {
            out.emit_str(&format!("{}{};\n", ty, item.name));
        } else {
            out.emit_str(&format!("{} {};\n", ty, item.name));
        }
    }
}
