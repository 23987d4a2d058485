use serde_json::json;

use stencil::{Environment, RenderErrorKind};

fn spec_data() -> serde_json::Value {
    json!({
        "user": { "name": "Alice", "profile": { "age": 30 } },
        "good": { "exists": "value" },
        "name": "TestName"
    })
}

fn graceful_env() -> Environment {
    let mut env = Environment::new();
    env.set_graceful_errors(true);
    env
}

#[test]
fn test_mixed_present_and_missing() {
    let env = graceful_env();
    let out = env
        .render(
            "{{ user.name }} / {{ user.email }} / {{ user.profile.age }}",
            &spec_data(),
        )
        .expect("graceful render");
    assert_eq!(out, "Alice / {{ user.email }} / 30");
}

#[test]
fn test_deep_missing_chain_replays_span() {
    let env = graceful_env();
    let out = env.render("{{ good.bad.bad }}", &spec_data()).expect("render");
    assert_eq!(out, "{{ good.bad.bad }}");

    let errors = env.last_render_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "variable 'good.bad.bad' not found");
    assert_eq!(errors[0].original_text, "{{ good.bad.bad }}");
    assert_eq!((errors[0].line_no, errors[0].column_no), (1, 4));
}

#[test]
fn test_missing_in_condition_takes_else() {
    let env = graceful_env();
    let out = env
        .render(
            "{% if good.bad.bad %}yes{% else %}no{% endif %}",
            &spec_data(),
        )
        .expect("render");
    assert_eq!(out, "no");
}

#[test]
fn test_missing_loop_value_skips_loop() {
    let env = graceful_env();
    let out = env
        .render(
            "{% for item in good.bad.items %}{{ item }}{% endfor %}Done",
            &spec_data(),
        )
        .expect("render");
    assert_eq!(out, "Done");
}

#[test]
fn test_strict_missing_variable_location() {
    let env = Environment::new();
    let err = env
        .render("{{ good.bad }}", &spec_data())
        .expect_err("strict mode raises");
    let rendered = err.to_string();
    assert!(rendered.contains("variable 'good.bad' not found"), "{}", rendered);
    assert!(rendered.contains("line 1, col 4"), "{}", rendered);
}

#[test]
fn test_very_deep_missing_chain() {
    let env = graceful_env();
    let source = "{{ a.b.c.d.e.f.g.h.i.j.k.l.m.n.o.p }}";
    let out = env.render(source, &spec_data()).expect("render");
    assert_eq!(out, source);
}

#[test]
fn test_operations_on_missing_replay_span() {
    let env = graceful_env();
    let cases = [
        "{{ good.bad.value + 10 }}",
        "{{ good.bad.count > 5 }}",
        "{{ \"prefix\" + good.bad.suffix }}",
        "{{ good.bad.bad | upper }}",
    ];
    for source in &cases {
        let out = env.render(source, &spec_data()).expect("render");
        match *source {
            // comparisons succeed against the graceful null substitute
            "{{ good.bad.count > 5 }}" => assert_eq!(out, "false"),
            other => assert_eq!(&out, other),
        }
    }
}

#[test]
fn test_graceful_null_substitute_lets_length_succeed() {
    // length of the substituted empty value is 0, not a replayed span
    let env = graceful_env();
    let out = env.render("{{ length(good.bad) }}", &spec_data()).expect("render");
    assert_eq!(out, "0");
}

#[test]
fn test_division_by_zero() {
    let env = Environment::new();
    let err = env
        .render("{{ 1 / 0 }}", &json!({}))
        .expect_err("strict division by zero");
    assert!(err.to_string().contains("division by zero"), "{}", err);

    let env = graceful_env();
    let out = env.render("{{ 1 / 0 }}", &json!({})).expect("graceful render");
    assert_eq!(out, "{{ 1 / 0 }}");
}

#[test]
fn test_first_on_empty_array() {
    let env = Environment::new();
    let err = match env.render("{{ first(items) }}", &json!({"items": []})) {
        Err(stencil::Error::Render(e)) => e,
        other => panic!("expected render error, got {:?}", other.map(|_| ())),
    };
    assert!(matches!(err.kind, RenderErrorKind::EmptyArray { .. }));

    let env = graceful_env();
    let out = env
        .render("{{ first(items) }}", &json!({"items": []}))
        .expect("graceful render");
    assert_eq!(out, "{{ first(items) }}");
}

#[test]
fn test_dynamic_member_missing_replays_span() {
    let env = graceful_env();
    let out = env
        .render(
            "{{ first(users).email }}",
            &json!({"users": [{"login": "ada"}]}),
        )
        .expect("graceful render");
    assert_eq!(out, "{{ first(users).email }}");
    let errors = env.last_render_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].original_text, "{{ first(users).email }}");
}

#[test]
fn test_set_failure_binds_null() {
    let env = graceful_env();
    // the failed assignment leaves x bound to null, which renders empty
    let out = env
        .render("{% set x = missing %}[{{ x }}]", &json!({}))
        .expect("render");
    assert_eq!(out, "[]");
    assert!(!env.last_render_errors().is_empty());
}

#[test]
fn test_set_then_read_success() {
    let env = graceful_env();
    let out = env
        .render("{% set x = 1 + 2 %}{{ x }}", &json!({}))
        .expect("render");
    assert_eq!(out, "3");
}

#[test]
fn test_unknown_function_graceful_replays() {
    let env = graceful_env();
    let out = env
        .render("{{ nosuchfn(1, 2) }}", &json!({}))
        .expect("graceful render");
    assert_eq!(out, "{{ nosuchfn(1, 2) }}");
}

#[test]
fn test_failing_callback_graceful_replays() {
    let env = graceful_env();
    env.add_callback("boom", 0, |_args| {
        Err(stencil::RenderError::message("callback exploded"))
    });
    let out = env.render("x{{ boom() }}y", &json!({})).expect("render");
    assert_eq!(out, "x{{ boom() }}y");
}

#[test]
fn test_errors_accumulate_per_render() {
    let env = graceful_env();
    let out = env
        .render("{{ a }} {{ b }} {{ c }}", &json!({"b": 2}))
        .expect("render");
    assert_eq!(out, "{{ a }} 2 {{ c }}");
    let errors = env.last_render_errors();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].message, "variable 'a' not found");
    assert_eq!(errors[1].message, "variable 'c' not found");
}

#[test]
fn test_present_null_is_not_missing() {
    let env = graceful_env();
    // present-null renders empty, it does not replay the span
    let out = env.render("[{{ n }}]", &json!({"n": null})).expect("render");
    assert_eq!(out, "[]");
    assert!(env.last_render_errors().is_empty());
}

#[test]
fn test_statements_never_emit_their_source() {
    let env = graceful_env();
    let out = env
        .render(
            "{% if missing.x %}A{% endif %}{% for i in missing.y %}B{% endfor %}end",
            &json!({}),
        )
        .expect("render");
    assert_eq!(out, "end");
}
