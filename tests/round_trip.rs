use proptest::prelude::*;
use serde_json::{Value as Json, json};

use stepwise::program::parse_program_value;
use stepwise::{Expression, parse_program};

fn literal() -> impl Strategy<Value = Json> {
    prop_oneof![
        Just(Json::Null),
        any::<bool>().prop_map(Json::from),
        (-1_000_000i64..1_000_000).prop_map(Json::from),
        "[a-z ]{0,8}".prop_map(Json::from),
    ]
}

fn expression() -> impl Strategy<Value = Json> {
    let leaf = prop_oneof![
        4 => literal(),
        1 => (0u32..10).prop_map(|index| json!({ "ref": index })),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Json::Array),
            prop::collection::vec(("k_[a-z]{1,4}", inner.clone()), 0..4)
                .prop_map(|props| Json::Object(props.into_iter().collect())),
            ("[a-z]{1,6}", prop::collection::vec(inner, 1..4))
                .prop_map(|(name, args)| json!({ "func": name, "args": args })),
        ]
    })
}

fn document() -> impl Strategy<Value = Json> {
    let step = ("[a-z]{1,6}", prop::collection::vec(expression(), 0..4)).prop_map(|(name, args)| {
        if args.is_empty() {
            json!({ "func": name })
        } else {
            json!({ "func": name, "args": args })
        }
    });
    (
        prop::collection::vec(step, 0..5),
        prop::collection::vec("[a-z]{1,5}", 0..2),
    )
        .prop_map(|(steps, unresolved)| {
            if unresolved.is_empty() {
                json!({ "steps": steps })
            } else {
                json!({ "steps": steps, "unresolved": unresolved })
            }
        })
}

proptest! {
    #[test]
    fn parse_then_render_is_structurally_equal(document in document()) {
        let program = parse_program_value(&document).expect("parse");
        prop_assert_eq!(program.to_json(), document);
        prop_assert!(program.steps.iter().all(|step| matches!(step, Expression::Call { .. })), "every step should be a call");
    }

    #[test]
    fn reparsing_keeps_the_fingerprint(document in document()) {
        let program = parse_program_value(&document).expect("parse");
        let reparsed = parse_program(&program.to_string()).expect("reparse");
        prop_assert_eq!(&reparsed, &program);
        prop_assert_eq!(reparsed.fingerprint(), program.fingerprint());
    }
}

#[test]
fn aliased_keys_render_canonically() {
    let program = parse_program(
        r#"{"@steps":[{"@func":"add","@args":[1,{"@ref":0}]},{"func":"add","args":[{"ref":0},2]}]}"#,
    )
    .expect("parse");
    assert_eq!(
        program.to_json(),
        json!({"steps":[{"func":"add","args":[1,{"ref":0}]},{"func":"add","args":[{"ref":0},2]}]})
    );
}
