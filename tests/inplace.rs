use std::sync::{Arc, Mutex};

use serde_json::json;
use serde_json::value::Value as Json;

use stencil::{Environment, InstrumentationData, InstrumentationEvent, RenderError};

fn register_append(env: &Environment) {
    env.add_callback_with_inplace(
        "append",
        2,
        |args: &[&Json]| {
            let mut arr = args[0]
                .as_array()
                .cloned()
                .ok_or_else(|| RenderError::message("append expects an array"))?;
            arr.push(args[1].clone());
            Ok(Json::Array(arr))
        },
        |target: &mut Json, remaining: &[&Json]| {
            match target.as_array_mut() {
                Some(arr) => {
                    arr.push(remaining[0].clone());
                    Ok(())
                }
                None => Err(RenderError::message("append expects an array")),
            }
        },
    );
}

fn collect_events(env: &Environment) -> Arc<Mutex<Vec<InstrumentationData>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    env.set_instrumentation_callback(move |data: &InstrumentationData| {
        sink.lock().expect("event sink lock").push(data.clone());
    });
    events
}

fn count_events(
    events: &Arc<Mutex<Vec<InstrumentationData>>>,
    event: InstrumentationEvent,
) -> usize {
    events
        .lock()
        .expect("event sink lock")
        .iter()
        .filter(|e| e.event == event)
        .count()
}

#[test]
fn test_inplace_self_assignment_used() {
    let env = Environment::new();
    register_append(&env);
    let events = collect_events(&env);

    let out = env
        .render(
            "{% set items = [] %}{% for i in range(1000) %}{% set items = append(items, i) %}{% endfor %}{{ length(items) }}",
            &json!({}),
        )
        .expect("render");
    assert_eq!(out, "1000");

    assert_eq!(
        count_events(&events, InstrumentationEvent::InplaceOptUsed),
        1000
    );
    assert_eq!(
        count_events(&events, InstrumentationEvent::InplaceOptSkipped),
        0
    );

    // every set statement reports its outcome
    let guard = events.lock().expect("event sink lock");
    let inplace_ends = guard
        .iter()
        .filter(|e| e.event == InstrumentationEvent::SetStatementEnd && e.detail == "inplace")
        .count();
    let copy_ends = guard
        .iter()
        .filter(|e| e.event == InstrumentationEvent::SetStatementEnd && e.detail == "copy")
        .count();
    assert_eq!(inplace_ends, 1000);
    assert_eq!(copy_ends, 1); // the initial {% set items = [] %}
}

#[test]
fn test_inplace_skipped_without_variant() {
    let env = Environment::new();
    env.add_callback("append2", 2, |args: &[&Json]| {
        let mut arr = args[0]
            .as_array()
            .cloned()
            .ok_or_else(|| RenderError::message("append2 expects an array"))?;
        arr.push(args[1].clone());
        Ok(Json::Array(arr))
    });
    let events = collect_events(&env);

    let out = env
        .render(
            "{% set items = [] %}{% for i in range(1000) %}{% set items = append2(items, i) %}{% endfor %}{{ length(items) }}",
            &json!({}),
        )
        .expect("render");
    assert_eq!(out, "1000");

    let guard = events.lock().expect("event sink lock");
    let skipped: Vec<_> = guard
        .iter()
        .filter(|e| e.event == InstrumentationEvent::InplaceOptSkipped)
        .collect();
    assert_eq!(skipped.len(), 1000);
    assert!(skipped.iter().all(|e| e.detail == "no_inplace_cb:append2"));
}

#[test]
fn test_inplace_skipped_when_target_not_bound() {
    let mut env = Environment::new();
    env.set_graceful_errors(true);
    register_append(&env);
    let events = collect_events(&env);

    env.render("{% set z = append(z, 1) %}", &json!({}))
        .expect("render");

    let guard = events.lock().expect("event sink lock");
    let skipped: Vec<_> = guard
        .iter()
        .filter(|e| e.event == InstrumentationEvent::InplaceOptSkipped)
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].detail, "var_not_exists:append");
}

#[test]
fn test_inplace_used_event_carries_size() {
    let env = Environment::new();
    register_append(&env);
    let events = collect_events(&env);

    env.render(
        "{% set items = [] %}{% for i in range(3) %}{% set items = append(items, i) %}{% endfor %}",
        &json!({}),
    )
    .expect("render");

    let guard = events.lock().expect("event sink lock");
    let sizes: Vec<usize> = guard
        .iter()
        .filter(|e| e.event == InstrumentationEvent::InplaceOptUsed)
        .map(|e| e.count)
        .collect();
    assert_eq!(sizes, vec![1, 2, 3]);
}

#[test]
fn test_wrapper_sees_summary_not_target() {
    let env = Environment::new();
    register_append(&env);

    let seen: Arc<Mutex<Vec<Json>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    env.set_callback_wrapper(stencil::callback_wrapper(
        move |name, args, thunk| {
            assert_eq!(name, "append");
            sink.lock()
                .expect("wrapper sink lock")
                .push(args[0].clone());
            thunk()
        },
    ));

    let out = env
        .render(
            "{% set items = [] %}{% for i in range(3) %}{% set items = append(items, i) %}{% endfor %}{{ length(items) }}",
            &json!({}),
        )
        .expect("render");
    assert_eq!(out, "3");

    // the wrapper observes the O(1) summary in place of the target
    let guard = seen.lock().expect("wrapper sink lock");
    assert_eq!(guard.len(), 3);
    for summary in guard.iter() {
        assert_eq!(summary["_inplace"], json!(true));
    }
}

#[test]
fn test_mutation_with_non_self_argument_falls_back_to_copy() {
    let env = Environment::new();
    register_append(&env);
    let events = collect_events(&env);

    // the first argument is not the assigned variable
    let out = env
        .render(
            "{% set a = [1] %}{% set b = append(a, 2) %}{{ length(a) }}/{{ length(b) }}",
            &json!({}),
        )
        .expect("render");
    assert_eq!(out, "1/2");
    assert_eq!(count_events(&events, InstrumentationEvent::InplaceOptUsed), 0);
}
