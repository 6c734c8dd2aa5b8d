/// Longest file name most filesystems accept.
const MAX_NAME_LEN: usize = 255;

/// Turns an arbitrary identifier into a single path component.
///
/// Path separators and characters that are troublesome on common
/// filesystems are replaced by `_`; the result is truncated on a char
/// boundary to [MAX_NAME_LEN] bytes.
pub fn to_path_component(name: &str) -> String {
    let mut safe = String::with_capacity(name.len());
    for c in name.chars() {
        let replaced = match c {
            '/' | '\\' | '\0' | ':' | '<' | '>' | '|' | '"' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        };
        if safe.len() + replaced.len_utf8() > MAX_NAME_LEN {
            break;
        }
        safe.push(replaced);
    }
    if safe.is_empty() || safe == "." || safe == ".." {
        safe = safe.replace('.', "_");
        if safe.is_empty() {
            safe.push('_');
        }
    }
    safe
}

#[cfg(test)]
mod test {
    use super::to_path_component;

    #[test]
    fn replaces_separators() {
        assert_eq!(
            to_path_component("1-examples/tests/passtest.py:PassTest.test"),
            "1-examples_tests_passtest.py_PassTest.test"
        );
    }

    #[test]
    fn never_empty_or_relative() {
        assert_eq!(to_path_component(""), "_");
        assert_eq!(to_path_component(".."), "__");
    }

    #[test]
    fn truncates_long_names() {
        let long = "é".repeat(300);
        let safe = to_path_component(&long);
        assert!(safe.len() <= 255);
        assert!(safe.chars().all(|c| c == 'é'));
    }
}
