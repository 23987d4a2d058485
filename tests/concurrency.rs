use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use serde_json::value::Value as Json;

use stencil::{CallbackCacheConfig, Environment};

#[test]
fn test_parallel_renders_share_one_environment() {
    let env = Arc::new(Environment::new());
    env.add_callback("twice", 1, |args: &[&Json]| {
        Ok(json!(args[0].as_i64().unwrap_or(0) * 2))
    });

    let template = Arc::new(
        env.parse("{% for i in range(5) %}{{ twice(i) }};{% endfor %}{{ who }}")
            .expect("parse"),
    );

    let mut handles = Vec::new();
    for t in 0..8 {
        let env = env.clone();
        let template = template.clone();
        handles.push(thread::spawn(move || {
            let data = json!({ "who": format!("t{}", t) });
            for _ in 0..50 {
                let out = env.render_template(&template, &data).expect("render");
                assert_eq!(out, format!("0;2;4;6;8;t{}", t));
            }
        }));
    }
    for handle in handles {
        handle.join().expect("render thread");
    }
}

#[test]
fn test_registrations_interleaved_with_renders() {
    let env = Arc::new(Environment::new());
    env.add_callback("base", 0, |_| Ok(json!("base")));
    let template = Arc::new(env.parse("{{ base() }}").expect("parse"));

    let renderers: Vec<_> = (0..4)
        .map(|_| {
            let env = env.clone();
            let template = template.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    // already-parsed templates keep their snapshot, so
                    // concurrent registrations never disturb this result
                    let out = env.render_template(&template, &json!({})).expect("render");
                    assert_eq!(out, "base");
                }
            })
        })
        .collect();

    let writer = {
        let env = env.clone();
        thread::spawn(move || {
            for i in 0..100 {
                let name = format!("cb{}", i);
                env.add_callback(&name, 0, move |_| Ok(json!(i)));
                let header = env.parse("h").expect("parse");
                env.include_template(&format!("tpl{}", i), header);
                thread::sleep(Duration::from_micros(50));
            }
        })
    };

    for handle in renderers {
        handle.join().expect("render thread");
    }
    writer.join().expect("writer thread");

    // everything published before this parse is visible to it
    let out = env.render("{{ cb42() }}", &json!({})).expect("render");
    assert_eq!(out, "42");
}

#[test]
fn test_concurrent_cache_accounting_is_consistent() {
    let env = Arc::new(Environment::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    env.add_callback("stamp", 0, move |_| {
        calls2.fetch_add(1, Ordering::SeqCst);
        Ok(json!("s"))
    });
    env.enable_callback_cache(CallbackCacheConfig {
        ttl: Duration::from_secs(60),
        max_entries: 0,
        cache_void_callbacks: false,
    });

    let template = Arc::new(env.parse("{{ stamp() }}").expect("parse"));
    let threads = 8;
    let per_thread = 100;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let env = env.clone();
            let template = template.clone();
            thread::spawn(move || {
                for _ in 0..per_thread {
                    let out = env.render_template(&template, &json!({})).expect("render");
                    assert_eq!(out, "s");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("cache thread");
    }

    let cache = env.callback_cache().expect("cache enabled");
    let total = (threads * per_thread) as u64;
    assert_eq!(cache.hits() + cache.misses(), total);
    // every miss executed the callback and the value never expired
    assert_eq!(cache.misses(), calls.load(Ordering::SeqCst) as u64);
    assert!(cache.misses() >= 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_per_thread_error_lists_are_isolated() {
    let mut env = Environment::new();
    env.set_graceful_errors(true);
    let env = Arc::new(env);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let env = env.clone();
            thread::spawn(move || {
                let source = format!("{{{{ missing{} }}}}", t);
                let out = env.render(&source, &json!({})).expect("render");
                assert_eq!(out, source);
                let errors = env.last_render_errors();
                assert_eq!(errors.len(), 1);
                assert_eq!(
                    errors[0].message,
                    format!("variable 'missing{}' not found", t)
                );
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("error thread");
    }
}
