use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::analysis::{CodeSection, EscapingCall, Label, LabelTable, Properties, StackItem};
use crate::errors::CodegenError;
use crate::lexer::{tokenize, Token, TokenKind};

/// One resolved instruction database: the labels shared by all
/// instructions, the release functions that do not escape, and the
/// instruction definitions in declaration order.
#[derive(Debug, Clone, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub non_escaping_deallocs: Vec<String>,
    pub instructions: Vec<InstructionDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstructionDef {
    pub name: String,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub inputs: Vec<StackItem>,
    #[serde(default)]
    pub outputs: Vec<StackItem>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub instruction_size: Option<u32>,
    #[serde(default)]
    pub escaping: Vec<EscapeDef>,
    pub body: String,
}

/// Declares that calls to `call` inside the body may run arbitrary
/// code, optionally consuming the named operand.
#[derive(Debug, Clone, Deserialize)]
pub struct EscapeDef {
    pub call: String,
    #[serde(default)]
    pub kills: Option<String>,
}

pub fn parse_bundle(src: &str) -> Result<Bundle, CodegenError> {
    serde_json::from_str(src)
        .map_err(|e| CodegenError::new(e.to_string(), e.line() as u32, e.column() as u32))
}

pub fn label_table(bundle: &Bundle) -> LabelTable {
    bundle
        .labels
        .iter()
        .map(|l| (l.name.clone(), l.clone()))
        .collect()
}

pub fn non_escaping_deallocs(bundle: &Bundle) -> BTreeSet<String> {
    bundle.non_escaping_deallocs.iter().cloned().collect()
}

/// Lex the body and resolve the token occurrences the emitter tracks by
/// identity: output-slot stores and escaping-call boundaries.
pub fn resolve(def: &InstructionDef) -> Result<CodeSection, CodegenError> {
    let body = tokenize(&def.body)?;
    let output_stores = find_output_stores(&body, &def.outputs);
    let escaping_calls = find_escaping_calls(&body, &def.escaping)?;
    Ok(CodeSection {
        name: def.name.clone(),
        family: def.family.clone(),
        inputs: def.inputs.clone(),
        outputs: def.outputs.clone(),
        properties: def.properties,
        instruction_size: def.instruction_size,
        body,
        output_stores,
        escaping_calls,
    })
}

/// An output store is an occurrence of an output name followed by a
/// plain `=` (never `==`).
fn find_output_stores(body: &[Token], outputs: &[StackItem]) -> BTreeSet<u32> {
    let names: BTreeSet<&str> = outputs.iter().map(|o| o.name.as_str()).collect();
    let mut stores = BTreeSet::new();
    for (i, tkn) in body.iter().enumerate() {
        if tkn.kind != TokenKind::Identifier || !names.contains(tkn.text.as_str()) {
            continue;
        }
        if let Some(next) = body.get(i + 1) {
            if next.kind == TokenKind::Op && next.text == "=" {
                stores.insert(tkn.index);
            }
        }
    }
    stores
}

/// Resolve each declared escaping function to its call occurrences.
/// `end` is the first token after the call statement, where the reload
/// is placed.
fn find_escaping_calls(
    body: &[Token],
    escapes: &[EscapeDef],
) -> Result<BTreeMap<u32, EscapingCall>, CodegenError> {
    let by_name: BTreeMap<&str, &EscapeDef> =
        escapes.iter().map(|e| (e.call.as_str(), e)).collect();
    let mut calls = BTreeMap::new();
    for (i, tkn) in body.iter().enumerate() {
        let Some(def) = by_name.get(tkn.text.as_str()) else {
            continue;
        };
        if tkn.kind != TokenKind::Identifier {
            continue;
        }
        let Some(next) = body.get(i + 1) else {
            continue;
        };
        if next.kind != TokenKind::LParen {
            continue;
        }
        let mut parens = 0i32;
        let mut rparen: Option<usize> = None;
        for (j, t) in body.iter().enumerate().skip(i + 1) {
            match t.kind {
                TokenKind::LParen => parens += 1,
                TokenKind::RParen => {
                    parens -= 1;
                    if parens == 0 {
                        rparen = Some(j);
                        break;
                    }
                }
                _ => {}
            }
        }
        let Some(rparen) = rparen else {
            return Err(CodegenError::at(
                format!("unterminated call to '{}'", tkn.text),
                tkn,
            ));
        };
        let end = match body.get(rparen + 1) {
            Some(t) if t.kind == TokenKind::Semi => rparen as u32 + 2,
            _ => rparen as u32 + 1,
        };
        calls.insert(
            tkn.index,
            EscapingCall {
                start: tkn.index,
                end,
                kills: def.kills.clone(),
            },
        );
    }
    Ok(calls)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(body: &str, outputs: Vec<StackItem>, escaping: Vec<EscapeDef>) -> InstructionDef {
        InstructionDef {
            name: "TEST_OP".to_string(),
            family: None,
            inputs: Vec::new(),
            outputs,
            properties: Properties::default(),
            instruction_size: None,
            escaping,
            body: body.to_string(),
        }
    }

    fn out_item(name: &str) -> StackItem {
        StackItem {
            name: name.to_string(),
            ty: None,
            size: None,
        }
    }

    #[test]
    fn parses_a_bundle() {
        let bundle = parse_bundle(
            r#"{
                "labels": [{"name": "error"}, {"name": "unwind", "spilled": true}],
                "non_escaping_deallocs": ["Int_ExactDealloc"],
                "instructions": [
                    {"name": "NOP", "body": "{ }"}
                ]
            }"#,
        )
        .expect("parse");
        let labels = label_table(&bundle);
        assert!(!labels["error"].spilled);
        assert!(labels["unwind"].spilled);
        assert!(non_escaping_deallocs(&bundle).contains("Int_ExactDealloc"));
        assert_eq!(bundle.instructions.len(), 1);
    }

    #[test]
    fn finds_stores_but_not_comparisons() {
        let code = resolve(&def(
            "{ if (res == NULL) { res = fallback; } res = 1; }",
            vec![out_item("res")],
            Vec::new(),
        ))
        .expect("resolve");
        let stored: Vec<&Token> = code
            .body
            .iter()
            .filter(|t| code.output_stores.contains(&t.index))
            .collect();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|t| t.text == "res"));
    }

    #[test]
    fn resolves_escaping_call_boundaries() {
        let code = resolve(&def(
            "{ x = Call(f(a), b); next; }",
            Vec::new(),
            vec![EscapeDef {
                call: "Call".to_string(),
                kills: None,
            }],
        ))
        .expect("resolve");
        assert_eq!(code.escaping_calls.len(), 1);
        let call = code.escaping_calls.values().next().expect("call");
        let end_tkn = &code.body[call.end as usize];
        assert_eq!(end_tkn.text, "next");
    }

    #[test]
    fn unterminated_escaping_call_is_an_error() {
        let err = resolve(&def(
            "{ Call(a; }",
            Vec::new(),
            vec![EscapeDef {
                call: "Call".to_string(),
                kills: None,
            }],
        ))
        .expect_err("must fail");
        assert!(err.message.contains("unterminated call"));
    }
}
