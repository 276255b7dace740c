use std::fmt;
use std::fmt::Write as _;

use crate::analysis::{CodeSection, StackItem};
use crate::cwriter::CWriter;

/// A stack-discipline violation. Carries no location; the emitter
/// attaches the offending token when converting to a `CodegenError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackError(pub String);

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StackError {}

fn stack_error(message: impl Into<String>) -> StackError {
    StackError(message.into())
}

/// Statically known distance between the real stack pointer and the
/// logical stack base: an integer plus symbolic array-size terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackOffset {
    num: i64,
    pos: Vec<String>,
    neg: Vec<String>,
}

impl StackOffset {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn of_items(items: &[StackItem]) -> Self {
        let mut off = Self::zero();
        for item in items {
            off.push_item(item);
        }
        off
    }

    pub fn push_item(&mut self, item: &StackItem) {
        match &item.size {
            Some(size) => {
                if let Some(i) = self.neg.iter().position(|t| t == size) {
                    self.neg.remove(i);
                } else {
                    self.pos.push(size.clone());
                }
            }
            None => self.num += 1,
        }
    }

    pub fn pop_item(&mut self, item: &StackItem) {
        match &item.size {
            Some(size) => {
                if let Some(i) = self.pos.iter().position(|t| t == size) {
                    self.pos.remove(i);
                } else {
                    self.neg.push(size.clone());
                }
            }
            None => self.num -= 1,
        }
    }

    pub fn negated(&self) -> Self {
        Self {
            num: -self.num,
            pos: self.neg.clone(),
            neg: self.pos.clone(),
        }
    }

    pub fn minus(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.num -= other.num;
        for term in &other.pos {
            if let Some(i) = out.pos.iter().position(|t| t == term) {
                out.pos.remove(i);
            } else {
                out.neg.push(term.clone());
            }
        }
        for term in &other.neg {
            if let Some(i) = out.neg.iter().position(|t| t == term) {
                out.neg.remove(i);
            } else {
                out.pos.push(term.clone());
            }
        }
        out
    }

    pub fn as_int(&self) -> Option<i64> {
        if self.pos.is_empty() && self.neg.is_empty() {
            Some(self.num)
        } else {
            None
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_int() == Some(0)
    }

    pub fn as_c_expr(&self) -> String {
        let mut s = String::new();
        for term in &self.pos {
            if s.is_empty() {
                s.push_str(term);
            } else {
                let _ = write!(s, " + {term}");
            }
        }
        for term in &self.neg {
            if s.is_empty() {
                let _ = write!(s, "-{term}");
            } else {
                let _ = write!(s, " - {term}");
            }
        }
        if self.num != 0 || s.is_empty() {
            if s.is_empty() {
                s = self.num.to_string();
            } else if self.num > 0 {
                let _ = write!(s, " + {}", self.num);
            } else {
                let _ = write!(s, " - {}", -self.num);
            }
        }
        s
    }
}

/// One symbolic operand slot: the declared item plus its current
/// tracking state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub item: StackItem,
    pub defined: bool,
    pub in_memory: bool,
}

/// Compensation emitted on the current branch to make two diverging
/// storage snapshots meet in a single state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAction {
    /// Lower the real stack pointer by the given (negative) delta.
    AdjustSp(StackOffset),
}

/// Symbolic operand-stack bookkeeping for one instruction: input slots
/// already on the stack at entry, output slots the instruction will
/// push, and whether the real stack pointer has been spilled to the
/// frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storage {
    pub inputs: Vec<Slot>,
    pub outputs: Vec<Slot>,
    pub sp_offset: StackOffset,
    pub spilled: bool,
}

impl Storage {
    pub fn for_section(code: &CodeSection) -> Self {
        let inputs = code
            .inputs
            .iter()
            .map(|item| Slot {
                item: item.clone(),
                defined: true,
                in_memory: true,
            })
            .collect::<Vec<_>>();
        let outputs = code
            .outputs
            .iter()
            .map(|item| Slot {
                item: item.clone(),
                defined: false,
                in_memory: false,
            })
            .collect();
        let sp_offset = StackOffset::of_items(&code.inputs);
        Self {
            inputs,
            outputs,
            sp_offset,
            spilled: false,
        }
    }

    /// Drop live-input bookkeeping before a transfer that hands cleanup
    /// to a label. Fails if an input value exists only in a local
    /// binding: the label cannot release what is not on the stack.
    pub fn clear_inputs(&mut self, reason: &str) -> Result<(), StackError> {
        for slot in &self.inputs {
            if slot.defined && !slot.in_memory {
                return Err(stack_error(format!(
                    "'{}' is still live {reason}",
                    slot.item.name
                )));
            }
        }
        for slot in &mut self.inputs {
            slot.defined = false;
        }
        Ok(())
    }

    /// Emit release code for every live input, in reverse declaration
    /// order. The real stack pointer is lowered to the base first so a
    /// release that runs arbitrary code never sees a dying reference
    /// still reachable from the stack.
    pub fn close_inputs(&mut self, out: &mut CWriter) -> Result<(), StackError> {
        if self.spilled {
            return Err(stack_error("cannot close inputs while the stack is spilled"));
        }
        if !self.sp_offset.is_zero() {
            out.start_line();
            out.emit_str(&format!(
                "stack_pointer += {};\n",
                self.sp_offset.negated().as_c_expr()
            ));
            out.emit_str("assert(WITHIN_STACK_BOUNDS());\n");
            self.sp_offset = StackOffset::zero();
        }
        for slot in self.inputs.iter_mut().rev() {
            if !slot.defined {
                continue;
            }
            out.start_line();
            match &slot.item.size {
                Some(size) => {
                    out.emit_str(&format!("for (int _i = {size}; --_i >= 0;) {{\n"));
                    out.emit_str(&format!("StackRef_CLOSE({}[_i]);\n", slot.item.name));
                    out.emit_str("}\n");
                }
                None => {
                    out.emit_str(&format!("StackRef_CLOSE({});\n", slot.item.name));
                }
            }
            slot.defined = false;
            slot.in_memory = false;
        }
        Ok(())
    }

    /// Mark the named input dead without emitting release code.
    pub fn kill(&mut self, name: &str) -> Result<(), StackError> {
        for slot in &mut self.inputs {
            if slot.item.name == name {
                slot.defined = false;
                return Ok(());
            }
        }
        Err(stack_error(format!(
            "'{name}' is not a live input-only variable"
        )))
    }

    pub fn kill_all_inputs(&mut self) {
        for slot in &mut self.inputs {
            slot.defined = false;
        }
    }

    /// Mark `name` dead because an emitted call consumes it. When the
    /// call escapes, a live input above the killed one on the stack is
    /// an ownership-ordering violation: the escaping callee could
    /// observe or release it through the stack while a local binding
    /// still owns it.
    pub fn kill_checked(&mut self, name: &str, escapes: bool) -> Result<(), StackError> {
        let mut live: Option<String> = None;
        for i in (0..self.inputs.len()).rev() {
            if self.inputs[i].item.name == name {
                if escapes {
                    if let Some(live) = live {
                        return Err(stack_error(format!(
                            "cannot close '{name}' when '{live}' is still live"
                        )));
                    }
                }
                self.inputs[i].defined = false;
                return Ok(());
            }
            if self.inputs[i].defined {
                live = Some(self.inputs[i].item.name.clone());
            }
        }
        Ok(())
    }

    fn flush_inner(&mut self, mut out: Option<&mut CWriter>) -> Result<(), StackError> {
        if self.spilled {
            return Err(stack_error("cannot flush a spilled stack"));
        }
        let mut cursor = self.sp_offset.negated();
        for slot in &mut self.inputs {
            if slot.defined && !slot.in_memory {
                if !slot.item.is_array() {
                    if let Some(out) = out.as_deref_mut() {
                        out.start_line();
                        out.emit_str(&format!(
                            "stack_pointer[{}] = {};\n",
                            cursor.as_c_expr(),
                            slot.item.name
                        ));
                    }
                }
                slot.in_memory = true;
            }
            cursor.push_item(&slot.item);
        }
        let last_live = self.inputs.iter().rposition(|s| s.defined);
        let mut new_offset = StackOffset::zero();
        if let Some(last) = last_live {
            for slot in &self.inputs[..=last] {
                new_offset.push_item(&slot.item);
            }
        }
        let delta = new_offset.minus(&self.sp_offset);
        if !delta.is_zero() {
            if let Some(out) = out.as_deref_mut() {
                out.start_line();
                out.emit_str(&format!("stack_pointer += {};\n", delta.as_c_expr()));
                out.emit_str("assert(WITHIN_STACK_BOUNDS());\n");
            }
        }
        self.sp_offset = new_offset;
        Ok(())
    }

    /// Write every live-but-unmaterialized slot to its real stack
    /// location and move the real stack pointer to the logical top.
    pub fn flush(&mut self, out: &mut CWriter) -> Result<(), StackError> {
        self.flush_inner(Some(out))
    }

    /// Flush, then hand the stack pointer back to the frame. While
    /// spilled, no register binding and no stack-pointer read is valid.
    pub fn save(&mut self, out: &mut CWriter) -> Result<(), StackError> {
        if self.spilled {
            return Err(stack_error("stack is already spilled"));
        }
        self.flush(out)?;
        out.start_line();
        out.emit_str("SAVE_STACK_POINTER(frame, stack_pointer);\n");
        self.spilled = true;
        Ok(())
    }

    pub fn reload(&mut self, out: &mut CWriter) -> Result<(), StackError> {
        if !self.spilled {
            return Err(stack_error("stack is not spilled"));
        }
        out.start_line();
        out.emit_str("stack_pointer = LOAD_STACK_POINTER(frame);\n");
        self.spilled = false;
        Ok(())
    }

    /// Offset of the real stack pointer above the logical base; drives
    /// the `pop_N_<label>` error-jump selection.
    pub fn peek_offset(&self) -> StackOffset {
        self.sp_offset.clone()
    }

    /// Promote outputs to live input status at the end of an
    /// instruction; they become the live set for whatever follows.
    pub fn push_outputs(&mut self) -> Result<(), StackError> {
        if self.spilled {
            return Err(stack_error("cannot push outputs while the stack is spilled"));
        }
        for slot in &self.outputs {
            if !slot.defined {
                return Err(stack_error(format!(
                    "output '{}' is not defined at the end of the block",
                    slot.item.name
                )));
            }
        }
        self.inputs = std::mem::take(&mut self.outputs);
        Ok(())
    }

    /// Pure branch-state reconciliation: merged snapshot plus the
    /// compensation to emit on the `current` side. Where both sides are
    /// reachable the merged `defined`/`in_memory` flags are the logical
    /// AND; stack depths must agree, or the current side must be
    /// poppable down to the other's depth. The merged state is the same
    /// whichever side is `current`; only the compensation differs.
    pub fn reconcile(
        current: &Storage,
        other: &Storage,
    ) -> Result<(Storage, Vec<MergeAction>), StackError> {
        if current.spilled != other.spilled {
            return Err(stack_error(
                "cannot merge a spilled stack with an unspilled stack",
            ));
        }
        if current.inputs.len() != other.inputs.len()
            || current.outputs.len() != other.outputs.len()
        {
            return Err(stack_error("cannot merge stacks: mismatched layouts"));
        }
        let mut merged = current.clone();
        let mut actions = Vec::new();
        if current.sp_offset != other.sp_offset {
            let delta = other.sp_offset.minus(&current.sp_offset);
            match delta.as_int() {
                Some(d) if d < 0 => {
                    actions.push(MergeAction::AdjustSp(delta));
                    merged.sp_offset = other.sp_offset.clone();
                }
                _ => {
                    return Err(stack_error("cannot merge stacks: depths differ"));
                }
            }
        }
        for (slot, other_slot) in merged.inputs.iter_mut().zip(&other.inputs) {
            if slot.item.name != other_slot.item.name {
                return Err(stack_error("cannot merge stacks: mismatched layouts"));
            }
            slot.defined = slot.defined && other_slot.defined;
            slot.in_memory = slot.in_memory && other_slot.in_memory;
        }
        for (slot, other_slot) in merged.outputs.iter_mut().zip(&other.outputs) {
            if slot.item.name != other_slot.item.name {
                return Err(stack_error("cannot merge stacks: mismatched layouts"));
            }
            slot.defined = slot.defined && other_slot.defined;
            slot.in_memory = slot.in_memory && other_slot.in_memory;
        }
        // Slots above the merged stack pointer are no longer backed by
        // memory the interpreter may trust.
        if let (Some(merged_off), Some(_)) = (merged.sp_offset.as_int(), current.sp_offset.as_int())
        {
            let mut depth = 0i64;
            for slot in merged.inputs.iter_mut() {
                let size = if slot.item.is_array() { None } else { Some(1) };
                depth += size.unwrap_or(0);
                if depth > merged_off {
                    slot.in_memory = false;
                }
            }
        }
        Ok((merged, actions))
    }

    /// Reconcile with `other`, emitting the compensation on this (the
    /// current) side, and adopt the merged state.
    pub fn merge(&mut self, other: &Storage, out: &mut CWriter) -> Result<(), StackError> {
        let (merged, actions) = Storage::reconcile(self, other)?;
        for action in actions {
            match action {
                MergeAction::AdjustSp(delta) => {
                    out.start_line();
                    out.emit_str(&format!("stack_pointer += {};\n", delta.as_c_expr()));
                    out.emit_str("assert(WITHIN_STACK_BOUNDS());\n");
                }
            }
        }
        *self = merged;
        Ok(())
    }

    /// Human-readable state for trace output.
    pub fn as_comment(&self) -> String {
        fn render(slots: &[Slot]) -> String {
            slots
                .iter()
                .map(|s| {
                    let mut t = s.item.name.clone();
                    if !s.defined {
                        t.push_str("(dead)");
                    } else if !s.in_memory {
                        t.push_str("(reg)");
                    }
                    t
                })
                .collect::<Vec<_>>()
                .join(" ")
        }
        format!(
            "/* inputs: [{}] outputs: [{}] sp: {}{} */",
            render(&self.inputs),
            render(&self.outputs),
            self.sp_offset.as_c_expr(),
            if self.spilled { " spilled" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str) -> StackItem {
        StackItem {
            name: name.to_string(),
            ty: None,
            size: None,
        }
    }

    fn array(name: &str, size: &str) -> StackItem {
        StackItem {
            name: name.to_string(),
            ty: None,
            size: Some(size.to_string()),
        }
    }

    fn storage(inputs: &[StackItem], outputs: &[StackItem]) -> Storage {
        Storage {
            inputs: inputs
                .iter()
                .map(|i| Slot {
                    item: i.clone(),
                    defined: true,
                    in_memory: true,
                })
                .collect(),
            outputs: outputs
                .iter()
                .map(|i| Slot {
                    item: i.clone(),
                    defined: false,
                    in_memory: false,
                })
                .collect(),
            sp_offset: StackOffset::of_items(inputs),
            spilled: false,
        }
    }

    #[test]
    fn offset_arithmetic_cancels_terms() {
        let mut off = StackOffset::zero();
        off.push_item(&item("a"));
        off.push_item(&array("args", "oparg"));
        assert_eq!(off.as_int(), None);
        assert_eq!(off.as_c_expr(), "oparg + 1");
        off.pop_item(&array("args", "oparg"));
        assert_eq!(off.as_int(), Some(1));
        assert_eq!(off.negated().as_c_expr(), "-1");
    }

    #[test]
    fn reconcile_is_deterministic_for_equal_depths() {
        let items = [item("a"), item("b")];
        let outs = [item("res")];
        let mut left = storage(&items, &outs);
        let mut right = storage(&items, &outs);
        left.outputs[0].defined = true;
        right.outputs[0].defined = true;
        right.outputs[0].in_memory = true;
        left.inputs[1].in_memory = false;

        let (ab, actions_ab) = Storage::reconcile(&left, &right).expect("merge");
        let (ba, actions_ba) = Storage::reconcile(&right, &left).expect("merge");
        assert_eq!(ab, ba);
        assert!(actions_ab.is_empty());
        assert!(actions_ba.is_empty());
        assert!(ab.outputs[0].defined);
        assert!(!ab.outputs[0].in_memory);
        assert!(!ab.inputs[1].in_memory);
    }

    #[test]
    fn reconcile_pops_current_side_down_to_other() {
        let items = [item("a"), item("b")];
        let fallthrough = storage(&items, &[]);
        let mut decrefed = storage(&items, &[]);
        decrefed.inputs[0].defined = false;
        decrefed.inputs[1].defined = false;
        decrefed.inputs[0].in_memory = false;
        decrefed.inputs[1].in_memory = false;
        decrefed.sp_offset = StackOffset::zero();

        let (merged, actions) = Storage::reconcile(&fallthrough, &decrefed).expect("merge");
        assert_eq!(merged.sp_offset.as_int(), Some(0));
        assert!(merged.inputs.iter().all(|s| !s.defined && !s.in_memory));
        assert_eq!(actions.len(), 1);
        let MergeAction::AdjustSp(delta) = &actions[0];
        assert_eq!(delta.as_int(), Some(-2));

        // The already-emitted side cannot be adjusted.
        let err = Storage::reconcile(&decrefed, &fallthrough).expect_err("must fail");
        assert!(err.0.contains("depths differ"));
    }

    #[test]
    fn reconcile_rejects_spill_mismatch() {
        let items = [item("a")];
        let plain = storage(&items, &[]);
        let mut spilled = storage(&items, &[]);
        spilled.spilled = true;
        let err = Storage::reconcile(&plain, &spilled).expect_err("must fail");
        assert!(err.0.contains("spilled"));
    }

    #[test]
    fn clear_inputs_rejects_register_only_values() {
        let items = [item("a")];
        let mut st = storage(&items, &[]);
        st.inputs[0].in_memory = false;
        let err = st.clear_inputs("at ERROR_IF").expect_err("must fail");
        assert!(err.0.contains("'a' is still live at ERROR_IF"));
        st.inputs[0].in_memory = true;
        st.clear_inputs("at ERROR_IF").expect("clears");
        assert!(!st.inputs[0].defined);
    }

    #[test]
    fn close_inputs_emits_in_reverse_order() {
        let items = [item("a"), item("b")];
        let mut st = storage(&items, &[]);
        let mut out = CWriter::new();
        st.close_inputs(&mut out).expect("close");
        let text = out.finish();
        let sp = text.find("stack_pointer += -2;").expect("sp sync");
        let b = text.find("StackRef_CLOSE(b);").expect("close b");
        let a = text.find("StackRef_CLOSE(a);").expect("close a");
        assert!(sp < b && b < a);
        assert_eq!(st.sp_offset.as_int(), Some(0));
        assert!(st.inputs.iter().all(|s| !s.defined));
    }

    #[test]
    fn kill_checked_rejects_live_slot_above() {
        let items = [item("a"), item("b")];
        let mut st = storage(&items, &[]);
        let err = st.kill_checked("a", true).expect_err("must fail");
        assert!(err.0.contains("cannot close 'a' when 'b' is still live"));
        st.kill_checked("b", true).expect("top is killable");
        st.kill_checked("a", true).expect("now unblocked");
        assert!(st.inputs.iter().all(|s| !s.defined));
    }

    #[test]
    fn push_outputs_requires_all_defined() {
        let mut st = storage(&[item("a")], &[item("res")]);
        let err = st.push_outputs().expect_err("must fail");
        assert!(err.0.contains("'res' is not defined"));
        st.outputs[0].defined = true;
        st.push_outputs().expect("push");
        assert_eq!(st.inputs.len(), 1);
        assert_eq!(st.inputs[0].item.name, "res");
        assert!(st.outputs.is_empty());
    }

    #[test]
    fn flush_writes_unmaterialized_outputs_after_push() {
        let mut st = storage(&[item("a"), item("b")], &[item("res")]);
        st.inputs[0].defined = false;
        st.inputs[1].defined = false;
        st.outputs[0].defined = true;
        st.push_outputs().expect("push");
        let mut out = CWriter::new();
        st.flush(&mut out).expect("flush");
        let text = out.finish();
        assert!(text.contains("stack_pointer[-2] = res;"));
        assert!(text.contains("stack_pointer += -1;"));
        assert_eq!(st.sp_offset.as_int(), Some(1));
        assert!(st.inputs[0].in_memory);
    }

    #[test]
    fn save_then_reload_round_trip() {
        let mut st = storage(&[item("a")], &[]);
        let mut out = CWriter::new();
        st.save(&mut out).expect("save");
        assert!(st.spilled);
        let err = st.save(&mut out).expect_err("double save");
        assert!(err.0.contains("already spilled"));
        st.reload(&mut out).expect("reload");
        assert!(!st.spilled);
        let text = out.finish();
        assert!(text.contains("SAVE_STACK_POINTER(frame, stack_pointer);"));
        assert!(text.contains("stack_pointer = LOAD_STACK_POINTER(frame);"));
    }
}
