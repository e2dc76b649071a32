use super::compiler::{Instr, Segment, compile, split_placeholders};
use crate::types::Value;

#[test]
fn statements_pop_all_but_last() {
  let p = compile("WorkflowScript", "echo 'a'\necho 'b'").unwrap();
  assert_eq!(p.blocks.len(), 1);
  let code = &p.blocks[0].code;
  assert_eq!(code.len(), 5);
  assert_eq!(code[2], Instr::Pop);
  assert!(matches!(&code[4], Instr::Call { name, positional: 1, .. } if name == "echo"));
  assert_eq!(p.blocks[0].lines[4], 2);
}

#[test]
fn closures_get_blocks_in_source_order() {
  let src = "parallel a: { echo 'a' }, b: { echo 'b' }";
  let p = compile("WorkflowScript", src).unwrap();
  assert_eq!(p.blocks.len(), 3);
  assert!(p.blocks[0].code.contains(&Instr::MakeClosure(1)));
  assert!(p.blocks[0].code.contains(&Instr::MakeClosure(2)));
  assert_eq!(p.blocks[1].code[0], Instr::Const(Value::str("a")));
}

#[test]
fn recompiling_is_deterministic() {
  let src = "stage('x') { sleep 1 }\ntry { error 'e' } catch (e) { echo 'c' }";
  assert_eq!(compile("S", src).unwrap(), compile("S", src).unwrap());
}

#[test]
fn try_patches_handler_and_jump() {
  let p = compile("S", "try { error 'x' } catch (err) { echo 'h' }").unwrap();
  let code = &p.blocks[0].code;
  let (handler, var) = match &code[0] {
    Instr::EnterTry { handler, var } => (*handler, var.clone()),
    other => panic!("unexpected {:?}", other),
  };
  assert_eq!(var, "err");
  assert_eq!(code[handler], Instr::Const(Value::str("h")));
  let end = code.len() - 1;
  assert!(code.contains(&Instr::Jump(end)));
  assert_eq!(code[end], Instr::Const(Value::Null));
}

#[test]
fn placeholders_split_with_properties() {
  assert_eq!(
    split_placeholders("v=${env.FOO}!"),
    vec![
      Segment::Text("v=".into()),
      Segment::Expr {
        var: "env".into(),
        props: vec!["FOO".into()]
      },
      Segment::Text("!".into()),
    ]
  );
}

#[test]
fn escaped_dollar_stays_literal() {
  assert_eq!(
    split_placeholders("cost \\${x}"),
    vec![Segment::Text("cost ${x}".into())]
  );
  let p = compile("S", "echo 'a\\$b'").unwrap();
  assert_eq!(p.blocks[0].code[0], Instr::Const(Value::str("a$b")));
}
