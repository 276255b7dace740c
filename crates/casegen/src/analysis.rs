use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::lexer::Token;

/// One declared operand slot: a single stack value, or a contiguous run
/// of `size` values when `size` is set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StackItem {
    pub name: String,
    #[serde(default, rename = "type")]
    pub ty: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
}

impl StackItem {
    pub fn is_array(&self) -> bool {
        self.size.is_some()
    }

    pub fn c_type(&self) -> &str {
        match &self.ty {
            Some(ty) => ty,
            None if self.is_array() => "StackRef *",
            None => "StackRef",
        }
    }

    pub fn c_null(&self) -> &str {
        match &self.ty {
            Some(_) => "NULL",
            None if self.is_array() => "NULL",
            None => "StackRef_NULL",
        }
    }
}

/// Resolved boolean properties of one instruction, used to compute the
/// flag bitmask embedded in generated tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Properties {
    pub oparg: bool,
    pub uses_consts: bool,
    pub uses_names: bool,
    pub jumps: bool,
    pub has_free: bool,
    pub uses_locals: bool,
    pub eval_breaker: bool,
    pub deopts: bool,
    pub side_exit: bool,
    pub error: bool,
    pub error_without_pop: bool,
    pub escapes: bool,
    pub pure: bool,
    pub no_save_ip: bool,
    pub oparg_and_1: bool,
}

impl Properties {
    /// Pipe-separated symbolic flag expression, or `"0"` when no flags
    /// apply.
    pub fn flags(&self) -> String {
        let mut flags: Vec<&str> = Vec::new();
        if self.oparg {
            flags.push("HAS_ARG_FLAG");
        }
        if self.uses_consts {
            flags.push("HAS_CONST_FLAG");
        }
        if self.uses_names {
            flags.push("HAS_NAME_FLAG");
        }
        if self.jumps {
            flags.push("HAS_JUMP_FLAG");
        }
        if self.has_free {
            flags.push("HAS_FREE_FLAG");
        }
        if self.uses_locals {
            flags.push("HAS_LOCAL_FLAG");
        }
        if self.eval_breaker {
            flags.push("HAS_EVAL_BREAK_FLAG");
        }
        if self.deopts {
            flags.push("HAS_DEOPT_FLAG");
        }
        if self.side_exit {
            flags.push("HAS_EXIT_FLAG");
        }
        if self.error {
            flags.push("HAS_ERROR_FLAG");
        }
        if self.error_without_pop {
            flags.push("HAS_ERROR_NO_POP_FLAG");
        }
        if self.escapes {
            flags.push("HAS_ESCAPES_FLAG");
        }
        if self.pure {
            flags.push("HAS_PURE_FLAG");
        }
        if self.no_save_ip {
            flags.push("HAS_NO_SAVE_IP_FLAG");
        }
        if self.oparg_and_1 {
            flags.push("HAS_OPARG_AND_1_FLAG");
        }
        if flags.is_empty() {
            "0".to_string()
        } else {
            flags.join(" | ")
        }
    }
}

/// Token-index boundaries of a call that may run arbitrary code. `end`
/// is the index of the first token after the call statement; the stack
/// is spilled before `start` and reloaded when `end` is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscapingCall {
    pub start: u32,
    pub end: u32,
    pub kills: Option<String>,
}

/// Resolved metadata for one instruction body, ready for emission.
#[derive(Debug, Clone)]
pub struct CodeSection {
    pub name: String,
    pub family: Option<String>,
    pub inputs: Vec<StackItem>,
    pub outputs: Vec<StackItem>,
    pub properties: Properties,
    pub instruction_size: Option<u32>,
    pub body: Vec<Token>,
    pub output_stores: BTreeSet<u32>,
    pub escaping_calls: BTreeMap<u32, EscapingCall>,
}

/// A named control-flow destination. `spilled` records whether code may
/// only jump here after the operand stack has been synchronized to
/// memory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Label {
    pub name: String,
    #[serde(default)]
    pub spilled: bool,
}

pub type LabelTable = BTreeMap<String, Label>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_join_in_declaration_order() {
        let p = Properties {
            oparg: true,
            jumps: true,
            error: true,
            ..Properties::default()
        };
        assert_eq!(p.flags(), "HAS_ARG_FLAG | HAS_JUMP_FLAG | HAS_ERROR_FLAG");
    }

    #[test]
    fn no_properties_is_zero() {
        assert_eq!(Properties::default().flags(), "0");
    }

    #[test]
    fn array_items_are_pointers() {
        let item = StackItem {
            name: "args".to_string(),
            ty: None,
            size: Some("oparg".to_string()),
        };
        assert!(item.is_array());
        assert_eq!(item.c_type(), "StackRef *");
        let plain = StackItem {
            name: "v".to_string(),
            ty: None,
            size: None,
        };
        assert_eq!(plain.c_type(), "StackRef");
        assert_eq!(plain.c_null(), "StackRef_NULL");
    }
}
