//! Test fixtures for creating vault documents.

/// A single basic block without an id.
pub fn basic_block(front: &str, back: &str) -> String {
    format!("START\n{}\n{}\nEND\n", front, back)
}

/// A document with a heading and the given basic blocks.
pub fn document(blocks: &[(&str, &str)]) -> String {
    let mut text = String::from("# Notes\n\n");
    for (front, back) in blocks {
        text.push_str(&basic_block(front, back));
        text.push('\n');
    }
    text
}

/// A block asking for the note with `id` to be deleted.
pub fn delete_block(id: i64) -> String {
    format!("START\nDELETE\n<!--ID: {}-->\nEND\n", id)
}

/// Id markers in document order.
pub fn ids_in(text: &str) -> Vec<i64> {
    text.lines()
        .filter_map(|line| {
            line.trim()
                .strip_prefix("<!--ID: ")?
                .strip_suffix("-->")?
                .parse()
                .ok()
        })
        .collect()
}
