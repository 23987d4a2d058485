use serde_json::json;

use stencil::{Environment, RenderError, RenderErrorKind, VARIADIC};

fn render(source: &str, data: serde_json::Value) -> String {
    Environment::new()
        .render(source, &data)
        .expect("render should succeed")
}

#[test]
fn test_plain_text() {
    assert_eq!(render("hello world", json!({})), "hello world");
}

#[test]
fn test_variable_substitution() {
    assert_eq!(render("{{ name }}", json!({"name": "ada"})), "ada");
    assert_eq!(render("{{ n }}", json!({"n": 7})), "7");
    assert_eq!(render("{{ f }}", json!({"f": 2.5})), "2.5");
    assert_eq!(render("{{ b }}", json!({"b": true})), "true");
    assert_eq!(render("{{ v }}", json!({"v": null})), "");
    assert_eq!(render("{{ a }}", json!({"a": [1, 2]})), "[1,2]");
}

#[test]
fn test_nested_variable() {
    let data = json!({"user": {"profile": {"age": 30}}});
    assert_eq!(render("{{ user.profile.age }}", data), "30");
}

#[test]
fn test_literals() {
    assert_eq!(render("{{ \"str\" }}", json!({})), "str");
    assert_eq!(render("{{ 42 }}", json!({})), "42");
    assert_eq!(render("{{ -3 }}", json!({})), "-3");
    assert_eq!(render("{{ 2.5 }}", json!({})), "2.5");
    assert_eq!(render("{{ true }}", json!({})), "true");
    assert_eq!(render("{{ null }}", json!({})), "");
    assert_eq!(render("{{ [1, 2, 3] }}", json!({})), "[1,2,3]");
}

#[test]
fn test_arithmetic() {
    assert_eq!(render("{{ 1 + 2 }}", json!({})), "3");
    assert_eq!(render("{{ 1 + 2.5 }}", json!({})), "3.5");
    assert_eq!(render("{{ \"a\" + \"b\" }}", json!({})), "ab");
    assert_eq!(render("{{ 7 - 4 }}", json!({})), "3");
    assert_eq!(render("{{ 3 * 4 }}", json!({})), "12");
    assert_eq!(render("{{ 5 / 2 }}", json!({})), "2.5");
    assert_eq!(render("{{ 2 ^ 10 }}", json!({})), "1024");
    assert_eq!(render("{{ 7 % 3 }}", json!({})), "1");
}

#[test]
fn test_precedence_and_parens() {
    assert_eq!(render("{{ 1 + 2 * 3 }}", json!({})), "7");
    assert_eq!(render("{{ (1 + 2) * 3 }}", json!({})), "9");
}

#[test]
fn test_comparisons() {
    assert_eq!(render("{{ 1 < 2 }}", json!({})), "true");
    assert_eq!(render("{{ 2 >= 2 }}", json!({})), "true");
    assert_eq!(render("{{ 1 == 1.0 }}", json!({})), "true");
    assert_eq!(render("{{ \"a\" != \"b\" }}", json!({})), "true");
}

#[test]
fn test_logic() {
    assert_eq!(render("{{ not false }}", json!({})), "true");
    assert_eq!(render("{{ true and false }}", json!({})), "false");
    assert_eq!(render("{{ false or true }}", json!({})), "true");
}

#[test]
fn test_in_operator() {
    assert_eq!(render("{{ 2 in [1, 2, 3] }}", json!({})), "true");
    assert_eq!(render("{{ 5 in [1, 2, 3] }}", json!({})), "false");
}

#[test]
fn test_string_filters() {
    assert_eq!(render("{{ name | upper }}", json!({"name": "ada"})), "ADA");
    assert_eq!(render("{{ \"WORLD\" | lower }}", json!({})), "world");
    assert_eq!(render("{{ \"hELLO\" | capitalize }}", json!({})), "Hello");
    assert_eq!(
        render("{{ replace(\"ababa\", \"a\", \"x\") }}", json!({})),
        "xbxbx"
    );
}

#[test]
fn test_array_functions() {
    let data = json!({"items": [3, 1, 2]});
    assert_eq!(render("{{ length(items) }}", data.clone()), "3");
    assert_eq!(render("{{ first(items) }}", data.clone()), "3");
    assert_eq!(render("{{ last(items) }}", data.clone()), "2");
    assert_eq!(render("{{ sort(items) }}", data.clone()), "[1,2,3]");
    assert_eq!(render("{{ max(items) }}", data.clone()), "3");
    assert_eq!(render("{{ min(items) }}", data), "1");
}

#[test]
fn test_sort_does_not_mutate_input() {
    let data = json!({"arr": [3, 1, 2]});
    assert_eq!(render("{{ sort(arr) }}{{ arr }}", data), "[1,2,3][3,1,2]");
}

#[test]
fn test_join() {
    assert_eq!(
        render("{{ join(names, \", \") }}", json!({"names": ["a", "b"]})),
        "a, b"
    );
    assert_eq!(
        render("{{ join(vals, \"-\") }}", json!({"vals": [1, "a", true]})),
        "1-a-true"
    );
}

#[test]
fn test_range_and_round() {
    assert_eq!(render("{{ range(4) }}", json!({})), "[0,1,2,3]");
    assert_eq!(render("{{ round(2.567, 2) }}", json!({})), "2.57");
    assert_eq!(render("{{ round(2.5, 0) }}", json!({})), "3");
}

#[test]
fn test_at_access() {
    assert_eq!(
        render("{{ at(obj, \"k\") }}", json!({"obj": {"k": "v"}})),
        "v"
    );
    assert_eq!(render("{{ at(items, 1) }}", json!({"items": [10, 20]})), "20");
}

#[test]
fn test_dynamic_member_access_on_expression_result() {
    let data = json!({"users": [
        {"login": "ada", "address": {"city": "Paris"}},
        {"login": "bob", "address": {"city": "Oslo"}}
    ]});
    assert_eq!(render("{{ first(users).login }}", data.clone()), "ada");
    assert_eq!(render("{{ last(users).address.city }}", data), "Oslo");
}

#[test]
fn test_dynamic_member_missing_is_member_error() {
    let env = Environment::new();
    let err = match env.render(
        "{{ first(users).email }}",
        &json!({"users": [{"login": "ada"}]}),
    ) {
        Err(stencil::Error::Render(e)) => e,
        other => panic!("expected render error, got {:?}", other.map(|_| ())),
    };
    assert!(matches!(err.kind, RenderErrorKind::MemberNotFound { .. }));
    assert!(err.to_string().contains("member 'email' not found"), "{}", err);
}

#[test]
fn test_default() {
    assert_eq!(
        render("{{ default(present, \"fb\") }}", json!({"present": "x"})),
        "x"
    );
    assert_eq!(render("{{ default(missing, \"fb\") }}", json!({})), "fb");
    // a key that is present with a null value is not missing
    assert_eq!(render("{{ default(n, \"fb\") }}", json!({"n": null})), "");
}

#[test]
fn test_exists_checks_data_input_only() {
    let data = json!({"a": {"b": 1}});
    assert_eq!(render("{{ exists(\"a.b\") }}", data.clone()), "true");
    assert_eq!(render("{{ exists(\"a.c\") }}", data), "false");
    // set variables live in the locals, which exists() does not consult
    assert_eq!(
        render("{% set q = 1 %}{{ exists(\"q\") }}", json!({})),
        "false"
    );
}

#[test]
fn test_exists_in_object() {
    let data = json!({"obj": {"k": 1}});
    assert_eq!(render("{{ existsIn(obj, \"k\") }}", data.clone()), "true");
    assert_eq!(render("{{ existsIn(obj, \"x\") }}", data), "false");
}

#[test]
fn test_numeric_predicates() {
    assert_eq!(render("{{ even(4) }}", json!({})), "true");
    assert_eq!(render("{{ odd(4) }}", json!({})), "false");
    assert_eq!(render("{{ divisibleBy(42, 7) }}", json!({})), "true");
    assert_eq!(render("{{ divisibleBy(5, 0) }}", json!({})), "false");
}

#[test]
fn test_type_tests() {
    let data = json!({"items": [1], "name": "x"});
    assert_eq!(render("{{ isArray(items) }}", data.clone()), "true");
    assert_eq!(render("{{ isString(name) }}", data.clone()), "true");
    assert_eq!(render("{{ isInteger(1) }}", data.clone()), "true");
    assert_eq!(render("{{ isFloat(1.5) }}", data.clone()), "true");
    assert_eq!(render("{{ isNumber(1.5) }}", data.clone()), "true");
    assert_eq!(render("{{ isBoolean(true) }}", data.clone()), "true");
    assert_eq!(render("{{ isObject(items) }}", data), "false");
}

#[test]
fn test_int_float_conversion() {
    assert_eq!(render("{{ int(\"42\") }}", json!({})), "42");
    assert_eq!(render("{{ float(\"2.5\") }}", json!({})), "2.5");
}

#[test]
fn test_if_truthiness() {
    let t = "{% if v %}yes{% else %}no{% endif %}";
    assert_eq!(render(t, json!({"v": 1})), "yes");
    assert_eq!(render(t, json!({"v": 0})), "no");
    assert_eq!(render(t, json!({"v": ""})), "no");
    assert_eq!(render(t, json!({"v": "x"})), "yes");
    assert_eq!(render(t, json!({"v": []})), "no");
    assert_eq!(render(t, json!({"v": [0]})), "yes");
    assert_eq!(render(t, json!({"v": null})), "no");
    assert_eq!(render(t, json!({"v": false})), "no");
}

#[test]
fn test_if_else_chain() {
    let t = "{% if a %}A{% else if b %}B{% else %}C{% endif %}";
    assert_eq!(render(t, json!({"a": true, "b": true})), "A");
    assert_eq!(render(t, json!({"a": false, "b": true})), "B");
    assert_eq!(render(t, json!({"a": false, "b": false})), "C");
}

#[test]
fn test_for_loop() {
    assert_eq!(
        render("{% for x in items %}{{ x }},{% endfor %}", json!({"items": [1, 2, 3]})),
        "1,2,3,"
    );
}

#[test]
fn test_loop_metadata() {
    let t = "{% for x in items %}{{ loop.index }}:{{ loop.index1 }}:{{ loop.is_first }}:{{ loop.is_last }};{% endfor %}";
    assert_eq!(
        render(t, json!({"items": [10, 20]})),
        "0:1:true:false;1:2:false:true;"
    );
    assert_eq!(render(t, json!({"items": [5]})), "0:1:true:true;");
}

#[test]
fn test_nested_loop_parent_chain() {
    let t = "{% for x in outer %}{% for y in inner %}{{ loop.parent.index }}{{ loop.index }}{% endfor %}{% endfor %}";
    assert_eq!(
        render(t, json!({"outer": [1, 2], "inner": [1]})),
        "0010"
    );
}

#[test]
fn test_loop_over_expression() {
    assert_eq!(
        render("{% for i in range(3) %}{{ i }}{% endfor %}", json!({})),
        "012"
    );
}

#[test]
fn test_object_loop_insertion_order() {
    assert_eq!(
        render(
            "{% for k, v in obj %}{{ k }}={{ v }};{% endfor %}",
            json!({"obj": {"b": 2, "a": 1}})
        ),
        "b=2;a=1;"
    );
}

#[test]
fn test_set_and_read() {
    assert_eq!(render("{% set x = 1 %}{{ x }}", json!({})), "1");
    assert_eq!(render("{% set x = 2 * 3 %}{{ x }}", json!({})), "6");
    assert_eq!(render("{% set a.b = 2 %}{{ a.b }}", json!({})), "2");
    // locals shadow the data input
    assert_eq!(render("{% set x = 2 %}{{ x }}", json!({"x": 1})), "2");
}

#[test]
fn test_include_propagates_locals() {
    let env = Environment::new();
    let sub = env.parse("[{{ v }}]").expect("parse");
    env.include_template("sub", sub);
    let out = env
        .render("{% set v = 42 %}{% include \"sub\" %}", &json!({}))
        .expect("render");
    assert_eq!(out, "[42]");
}

#[test]
fn test_include_sees_loop_variable() {
    let env = Environment::new();
    let sub = env.parse("{{ x }}|").expect("parse");
    env.include_template("sub", sub);
    let out = env
        .render(
            "{% for x in items %}{% include \"sub\" %}{% endfor %}",
            &json!({"items": [1, 2]}),
        )
        .expect("render");
    assert_eq!(out, "1|2|");
}

#[test]
fn test_missing_include_policy() {
    let env = Environment::new();
    let template = env.parse("a{% include \"nope\" %}b").expect("parse");

    let err = env
        .render_template(&template, &json!({}))
        .expect_err("missing include must fail by default");
    assert!(err.to_string().contains("include \"nope\" not found") || err.to_string().contains("include 'nope' not found"));

    env.set_throw_at_missing_includes(false);
    let out = env
        .render_template(&template, &json!({}))
        .expect("ignored include");
    assert_eq!(out, "ab");
}

#[test]
fn test_html_autoescape() {
    let env = Environment::new();
    env.set_html_autoescape(true);
    let template = env.parse("{{ s }}").expect("parse");
    let out = env
        .render_template(&template, &json!({"s": "<b>&\"'"}))
        .expect("render");
    assert_eq!(out, "&lt;b&gt;&amp;&quot;&apos;");

    // non-string values are not escaped
    let out = env
        .render_template(&env.parse("{{ n }}").expect("parse"), &json!({"n": 5}))
        .expect("render");
    assert_eq!(out, "5");
}

#[test]
fn test_comments_are_dropped() {
    assert_eq!(render("a{# hidden #}b", json!({})), "ab");
}

#[test]
fn test_raw_block() {
    assert_eq!(
        render("{% raw %}{{ x }}{% endraw %}", json!({"x": 1})),
        "{{ x }}"
    );
}

#[test]
fn test_whitespace_control() {
    assert_eq!(
        render("a  {%- if true %}x{% endif %}", json!({})),
        "ax"
    );
    assert_eq!(
        render("{% if true -%}   x{% endif %}", json!({})),
        "x"
    );

    let mut env = Environment::new();
    env.set_trim_blocks(true);
    assert_eq!(
        env.render("{% if true %}\nx{% endif %}", &json!({})).expect("render"),
        "x"
    );
}

#[test]
fn test_line_statements() {
    assert_eq!(render("## set x = 5\n{{ x }}", json!({})), "5");
    assert_eq!(
        render("## for i in range(2)\n{{ i }}\n## endfor\n", json!({})),
        "0\n1\n"
    );
}

#[test]
fn test_zero_arity_callback_resolves_like_a_variable() {
    let env = Environment::new();
    env.add_callback("version", 0, |_args| Ok(json!("1.2.3")));
    assert_eq!(
        env.render("v{{ version }}", &json!({})).expect("render"),
        "v1.2.3"
    );
}

#[test]
fn test_callback_with_arguments() {
    let env = Environment::new();
    env.add_callback("plus", 2, |args: &[&serde_json::Value]| {
        let a = args[0].as_i64().ok_or_else(|| RenderError::message("int expected"))?;
        let b = args[1].as_i64().ok_or_else(|| RenderError::message("int expected"))?;
        Ok(json!(a + b))
    });
    assert_eq!(
        env.render("{{ plus(1, 2) }}", &json!({})).expect("render"),
        "3"
    );
}

#[test]
fn test_variadic_callback() {
    let env = Environment::new();
    env.add_callback("argc", VARIADIC, |args: &[&serde_json::Value]| {
        Ok(json!(args.len()))
    });
    assert_eq!(
        env.render("{{ argc(1, 2, 3) }}", &json!({})).expect("render"),
        "3"
    );
    assert_eq!(
        env.render("{{ argc(1) }}", &json!({})).expect("render"),
        "1"
    );
}

#[test]
fn test_callback_used_as_filter() {
    let env = Environment::new();
    env.add_callback("double", 1, |args: &[&serde_json::Value]| {
        let n = args[0].as_i64().ok_or_else(|| RenderError::message("int expected"))?;
        Ok(json!(n * 2))
    });
    assert_eq!(
        env.render("{{ n | double }}", &json!({"n": 21})).expect("render"),
        "42"
    );
}

#[test]
fn test_reparse_render_agrees() {
    // parse twice from the same source, render both
    let env = Environment::new();
    let source = "{% for i in range(3) %}{{ i * 2 }} {% endfor %}";
    let a = env.parse(source).expect("parse");
    let b = env.parse(source).expect("parse");
    let data = json!({});
    assert_eq!(
        env.render_template(&a, &data).expect("render"),
        env.render_template(&b, &data).expect("render"),
    );
}
