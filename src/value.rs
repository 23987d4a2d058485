use std::cmp::Ordering;

use serde_json::value::Value as Json;

/// Converts a dotted variable name into a JSON pointer.
///
/// `a.b.c` becomes `/a/b/c`, so the name addresses the same node a
/// slash-joined pointer would. Pointer special characters inside a
/// segment are escaped per RFC 6901.
pub fn dotted_to_pointer(name: &str) -> String {
    let mut ptr = String::with_capacity(name.len() + 1);
    for seg in name.split('.') {
        ptr.push('/');
        for c in seg.chars() {
            match c {
                '~' => ptr.push_str("~0"),
                '/' => ptr.push_str("~1"),
                _ => ptr.push(c),
            }
        }
    }
    ptr
}

/// Writes `value` at `pointer`, creating intermediate objects as needed.
///
/// Existing arrays are indexed when the segment is numeric and in range;
/// any other intermediate is replaced by an object, which is what
/// assignment into a fresh locals tree needs.
pub fn set_pointer(root: &mut Json, pointer: &str, value: Json) {
    let segments: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect();
    set_segments(root, &segments, value);
}

fn set_segments(current: &mut Json, segments: &[String], value: Json) {
    let (seg, rest) = match segments.split_first() {
        Some(parts) => parts,
        None => {
            *current = value;
            return;
        }
    };

    if rest.is_empty() {
        if let Json::Array(items) = current {
            if let Ok(idx) = seg.parse::<usize>() {
                if idx < items.len() {
                    items[idx] = value;
                    return;
                }
            }
        }
        if !current.is_object() {
            *current = Json::Object(Default::default());
        }
        if let Some(map) = current.as_object_mut() {
            map.insert(seg.clone(), value);
        }
        return;
    }

    let index = match &*current {
        Json::Array(items) => seg.parse::<usize>().ok().filter(|i| *i < items.len()),
        _ => None,
    };
    let next = match index {
        Some(idx) => &mut current[idx],
        None => {
            if !current.is_object() {
                *current = Json::Object(Default::default());
            }
            match current.as_object_mut() {
                Some(map) => map.entry(seg.clone()).or_insert(Json::Null),
                None => return,
            }
        }
    };
    set_segments(next, rest, value);
}

/// Truthiness used by `if` conditions and the logical operators:
/// null is false, booleans are themselves, numbers compare against zero,
/// strings and containers are true when non-empty.
pub fn truthy(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Json::String(s) => !s.is_empty(),
        Json::Array(a) => !a.is_empty(),
        Json::Object(o) => !o.is_empty(),
    }
}

fn type_rank(value: &Json) -> u8 {
    match value {
        Json::Null => 0,
        Json::Bool(_) => 1,
        Json::Number(_) => 2,
        Json::String(_) => 3,
        Json::Array(_) => 4,
        Json::Object(_) => 5,
    }
}

/// Total cross-type ordering for relational operators and `sort`.
///
/// Values of different types order by type rank; numbers compare as f64
/// so integer and float representations interleave naturally.
pub fn value_cmp(a: &Json, b: &Json) -> Ordering {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => {
            let xf = x.as_f64().unwrap_or(0.0);
            let yf = y.as_f64().unwrap_or(0.0);
            xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
        }
        (Json::String(x), Json::String(y)) => x.cmp(y),
        (Json::Bool(x), Json::Bool(y)) => x.cmp(y),
        (Json::Array(x), Json::Array(y)) => {
            for (xe, ye) in x.iter().zip(y.iter()) {
                let ord = value_cmp(xe, ye);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Json::Object(x), Json::Object(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Deep equality with numeric coercion, so `1 == 1.0` holds the way the
/// template language expects.
pub fn value_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => {
            match (x.as_f64(), y.as_f64()) {
                (Some(xf), Some(yf)) => xf == yf,
                _ => x == y,
            }
        }
        (Json::Array(x), Json::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(xe, ye)| value_eq(xe, ye))
        }
        (Json::Object(x), Json::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, xv)| y.get(k).map(|yv| value_eq(xv, yv)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Escapes `& " ' < >` into HTML entities, character by character.
pub fn html_escape(data: &str) -> String {
    let mut buffer = String::with_capacity(data.len() + data.len() / 10);
    for c in data.chars() {
        match c {
            '&' => buffer.push_str("&amp;"),
            '"' => buffer.push_str("&quot;"),
            '\'' => buffer.push_str("&apos;"),
            '<' => buffer.push_str("&lt;"),
            '>' => buffer.push_str("&gt;"),
            _ => buffer.push(c),
        }
    }
    buffer
}
