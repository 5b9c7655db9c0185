//! Output sanitizing for sessions with `sanitize_output` set.
//!
//! Removes control characters (other than newline and tab) and complete
//! `<|...|>` special-token markers that some backends leak into text.

/// Clean one chat token.
pub fn sanitize_token(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<|") {
        let Some(len) = rest[start..].find("|>") else {
            break;
        };
        push_clean(&mut out, &rest[..start]);
        rest = &rest[start + len + 2..];
    }
    push_clean(&mut out, rest);
    out
}

fn push_clean(out: &mut String, text: &str) {
    out.extend(
        text.chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t'),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_unchanged() {
        assert_eq!(sanitize_token("Hello, world! "), "Hello, world! ");
        assert_eq!(sanitize_token("line\nnext\tcol"), "line\nnext\tcol");
    }

    #[test]
    fn strips_special_markers() {
        assert_eq!(sanitize_token("hi<|eot_id|>"), "hi");
        assert_eq!(sanitize_token("<|start|>a<|x|>b"), "ab");
    }

    #[test]
    fn keeps_unterminated_marker() {
        assert_eq!(sanitize_token("a <| b"), "a <| b");
    }

    #[test]
    fn strips_control_characters() {
        assert_eq!(sanitize_token("a\u{0}b\u{7}c\r"), "abc");
    }
}
