/// Replace `${ENV_VAR}` and `${ENV_VAR:-fallback}` placeholders in config text.
///
/// Unresolvable variables without a fallback are left as-is so that
/// validation can point at them.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

pub(crate) fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated: copy verbatim.
            out.push_str(&rest[start..]);
            return out;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (name.is_empty(), lookup(name).filter(|v| !v.is_empty()), fallback) {
            (false, Some(value), _) => out.push_str(&value),
            (false, None, Some(fallback)) => out.push_str(fallback),
            _ => {
                out.push_str("${");
                out.push_str(body);
                out.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_var() {
        let lookup = |name: &str| match name {
            "TURINGPI_TEST_VAR" => Some("hello".to_string()),
            _ => None,
        };
        assert_eq!(
            substitute_env_with("key=${TURINGPI_TEST_VAR}", lookup),
            "key=hello"
        );
    }

    #[test]
    fn leaves_unknown_var() {
        let lookup = |_: &str| None;
        assert_eq!(
            substitute_env_with("${TURINGPI_NONEXISTENT_XYZ}", lookup),
            "${TURINGPI_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn falls_back_when_unset_or_empty() {
        let lookup = |name: &str| (name == "EMPTY").then(String::new);
        assert_eq!(substitute_env_with("${MISSING:-24}", lookup), "24");
        assert_eq!(substitute_env_with("${EMPTY:-8}", lookup), "8");
    }

    #[test]
    fn malformed_placeholder_is_literal() {
        let lookup = |_: &str| Some("x".to_string());
        assert_eq!(
            substitute_env_with("tail ${UNCLOSED", lookup),
            "tail ${UNCLOSED"
        );
        assert_eq!(substitute_env_with("${}", lookup), "${}");
    }

    #[test]
    fn substitutes_inside_paths() {
        let lookup = |name: &str| (name == "HOME").then(|| "/home/pi".to_string());
        assert_eq!(
            substitute_env_with("output_dir = \"${HOME}/images\"", lookup),
            "output_dir = \"/home/pi/images\""
        );
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain text"), "plain text");
    }
}
