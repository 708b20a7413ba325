//! Curly-brace cloze conversion.

use regex::Regex;

/// Rewrite `==text==` highlights into `{text}` so they become clozes.
pub fn highlights_to_braces(text: &str) -> String {
    let re = Regex::new(r"==([^=\n]+?)==").expect("valid highlight regex");
    re.replace_all(text, "{$1}").into_owned()
}

/// Highest `N` among the `{{cN::...}}` clozes already in `text`, or 0.
pub fn highest_cloze_index(text: &str) -> usize {
    let re = Regex::new(r"\{\{c(\d+)::").expect("valid cloze regex");
    re.captures_iter(text)
        .filter_map(|caps| caps[1].parse().ok())
        .max()
        .unwrap_or(0)
}

/// Rewrite `{text}` into `{{cN::text}}`.
///
/// Numbering continues after both `*counter` and the highest cloze already
/// in `text`. Spans that are already doubled (`{{...}}`) are copied
/// unchanged.
pub fn curly_to_cloze(text: &str, counter: &mut usize) -> String {
    *counter = (*counter).max(highest_cloze_index(text));
    let mut out = String::with_capacity(text.len() + 16);
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];

        if tail.starts_with("{{") {
            let stop = tail.find("}}").map(|i| i + 2).unwrap_or(tail.len());
            out.push_str(&tail[..stop]);
            rest = &tail[stop..];
            continue;
        }

        let inner = &tail[1..];
        match inner.find(['{', '}']) {
            Some(close)
                if inner.as_bytes()[close] == b'}'
                    && close > 0
                    && !inner[close + 1..].starts_with('}') =>
            {
                *counter += 1;
                out.push_str(&format!("{{{{c{}::{}}}}}", counter, &inner[..close]));
                rest = &inner[close + 1..];
            }
            _ => {
                out.push('{');
                rest = inner;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_clozes_in_order() {
        let mut n = 0;
        let out = curly_to_cloze("{Rust} is a {systems} language", &mut n);
        assert_eq!(out, "{{c1::Rust}} is a {{c2::systems}} language");
        assert_eq!(n, 2);
    }

    #[test]
    fn counter_continues_across_fields() {
        let mut n = 0;
        curly_to_cloze("{a}", &mut n);
        assert_eq!(curly_to_cloze("{b}", &mut n), "{{c2::b}}");
    }

    #[test]
    fn existing_clozes_are_untouched() {
        let mut n = 0;
        let out = curly_to_cloze("{{c1::done}} and {new}", &mut n);
        assert_eq!(out, "{{c1::done}} and {{c2::new}}");
    }

    #[test]
    fn numbering_follows_highest_existing_cloze() {
        let mut n = 0;
        let out = curly_to_cloze("{first} then {{c3::kept}} then {last}", &mut n);
        assert_eq!(out, "{{c4::first}} then {{c3::kept}} then {{c5::last}}");
        assert_eq!(highest_cloze_index("{{c2::a}} {{c10::b}}"), 10);
        assert_eq!(highest_cloze_index("no clozes"), 0);
    }

    #[test]
    fn unbalanced_braces_are_kept() {
        let mut n = 0;
        assert_eq!(curly_to_cloze("fn main() {", &mut n), "fn main() {");
        assert_eq!(curly_to_cloze("{}", &mut n), "{}");
        assert_eq!(n, 0);
    }

    #[test]
    fn highlights_become_braces() {
        assert_eq!(highlights_to_braces("a ==b== c"), "a {b} c");
    }
}
