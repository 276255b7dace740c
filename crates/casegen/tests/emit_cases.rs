use casegen::database;
use casegen::generate::{self, GenerateOptions};

fn emit(bundle_json: &str) -> String {
    let bundle = database::parse_bundle(bundle_json).expect("parse bundle");
    generate::generate(&bundle, &GenerateOptions::default()).expect("generate")
}

const BINARY_ADD: &str = r#"{
    "labels": [
        {"name": "error"},
        {"name": "pop_1_error"},
        {"name": "pop_2_error"}
    ],
    "instructions": [
        {
            "name": "BINARY_ADD",
            "inputs": [{"name": "a"}, {"name": "b"}],
            "outputs": [{"name": "res"}],
            "body": "{ res = OP_ADD(a, b); DECREF_INPUTS(); ERROR_IF(res == NULL, error); }"
        }
    ]
}"#;

#[test]
fn binary_op_case_end_to_end() {
    let text = emit(BINARY_ADD);
    assert!(text.starts_with("// This file is generated by casegen.\n"));
    assert!(text.contains("TARGET(BINARY_ADD) {"));

    // Inputs load from their real stack slots; outputs get a bare
    // declaration.
    assert!(text.contains("a = stack_pointer[-2];"));
    assert!(text.contains("b = stack_pointer[-1];"));
    assert!(text.contains("StackRef res;"));

    // DECREF_INPUTS pops below the dying values, then releases them
    // top-down.
    let pop = text.find("stack_pointer += -2;").expect("pop");
    let close_b = text.find("StackRef_CLOSE(b);").expect("close b");
    let close_a = text.find("StackRef_CLOSE(a);").expect("close a");
    assert!(pop < close_b && close_b < close_a);

    // The inputs are already gone at the error check, so the plain
    // error label suffices.
    assert!(text.contains("if (res == NULL) {"));
    assert!(text.contains("JUMP_TO_LABEL(error);"));
    assert!(!text.contains("pop_2_error"));

    // The result is materialized and the pointer bumped before
    // dispatch.
    let store = text.find("stack_pointer[0] = res;").expect("store");
    let bump = text.find("stack_pointer += 1;").expect("bump");
    let dispatch = text.find("DISPATCH();").expect("dispatch");
    assert!(store < bump && bump < dispatch);
}

#[test]
fn instructions_emit_in_declaration_order() {
    let text = emit(
        r#"{
            "instructions": [
                {"name": "SECOND_OF_PAIR", "body": "{ }"},
                {"name": "FIRST_OF_PAIR", "body": "{ }"}
            ]
        }"#,
    );
    let second = text.find("TARGET(SECOND_OF_PAIR)").expect("second");
    let first = text.find("TARGET(FIRST_OF_PAIR)").expect("first");
    assert!(second < first);
}

#[test]
fn array_operands_bind_pointers() {
    let text = emit(
        r#"{
            "instructions": [
                {
                    "name": "CALL_N",
                    "inputs": [
                        {"name": "callable"},
                        {"name": "args", "size": "oparg"}
                    ],
                    "body": "{ INPUTS_DEAD(); }"
                }
            ]
        }"#,
    );
    assert!(text.contains("StackRef *args;"));
    assert!(text.contains("args = &stack_pointer[-oparg];"));
    assert!(text.contains("callable = stack_pointer[-oparg - 1];"));
    // Dead inputs still on the stack are dropped by the final flush.
    assert!(text.contains("stack_pointer += -oparg - 1;"));
}

#[test]
fn body_ending_in_goto_spilled_label_gets_no_epilogue() {
    let text = emit(
        r#"{
            "labels": [{"name": "unwind", "spilled": true}],
            "instructions": [
                {"name": "RAISE", "inputs": [{"name": "exc"}], "body": "{ goto unwind; }"}
            ]
        }"#,
    );
    // The save the label demands is the last stack traffic; no flush or
    // dispatch follows the jump.
    let save = text
        .find("SAVE_STACK_POINTER(frame, stack_pointer);")
        .expect("save");
    let jump = text.find("JUMP_TO_LABEL(unwind);").expect("jump");
    assert!(save < jump);
    assert!(!text.contains("DISPATCH();"));
}

#[test]
fn body_ending_in_dispatch_is_not_doubled() {
    let text = emit(
        r#"{
            "instructions": [
                {"name": "JUMP_FAST", "body": "{ frame->instr_ptr = target; DISPATCH(); }"}
            ]
        }"#,
    );
    assert_eq!(text.matches("DISPATCH();").count(), 1);
}

#[test]
fn trace_option_adds_state_comments() {
    let bundle = database::parse_bundle(BINARY_ADD).expect("parse bundle");
    let plain = generate::generate(&bundle, &GenerateOptions { trace_stacks: false }).expect("plain");
    let traced =
        generate::generate(&bundle, &GenerateOptions { trace_stacks: true }).expect("traced");
    assert!(!plain.contains("/* inputs:"));
    assert!(traced.contains("/* inputs:"));
}

#[test]
fn body_errors_carry_their_position() {
    let bundle = database::parse_bundle(
        r#"{
            "instructions": [
                {"name": "BAD", "inputs": [{"name": "a"}], "body": "{ DEAD(z); }"}
            ]
        }"#,
    )
    .expect("parse bundle");
    let err = generate::generate(&bundle, &GenerateOptions::default()).expect_err("must fail");
    assert!(err.message.contains("'z' is not a live input-only variable"));
    assert_eq!(err.line, 1);
    assert!(err.column > 1);
}

#[test]
fn undefined_output_is_rejected() {
    let bundle = database::parse_bundle(
        r#"{
            "instructions": [
                {"name": "FORGETS", "outputs": [{"name": "res"}], "body": "{ x = 1; }"}
            ]
        }"#,
    )
    .expect("parse bundle");
    let err = generate::generate(&bundle, &GenerateOptions::default()).expect_err("must fail");
    assert!(err
        .message
        .contains("output 'res' is not defined at the end of the block"));
}
