//! DOM → LLM payload reduction.
//!
//! The captured `outerHTML` of a playlist page is several megabytes, almost all
//! of it markup the extractor never needs. Each rule below removes one class of
//! construct; together they typically shrink the payload by an order of
//! magnitude while leaving every text node outside those constructs intact.

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, trace};

/// Removal rules, applied in this order.
const SANITIZE_RULES: &[(&str, &str)] = &[
    ("head", r"(?s)<head\b.*?</head>"),
    ("script", r"(?s)<script\b.*?</script>"),
    ("comment", r"(?s)<!--.*?-->"),
    ("inline_style_tag", r#"<[a-zA-Z][^<>]*?\sstyle\s*=\s*"[^"]*"[^<>]*>"#),
    ("style", r"(?s)<style\b.*?</style>"),
    ("svg", r"(?s)<svg\b.*?</svg>"),
    ("canvas", r"(?s)<canvas\b.*?</canvas>"),
    ("img", r"<img\b[^>]*>"),
];

static SANITIZE_REGEXES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();

fn sanitize_regexes() -> &'static [(&'static str, Regex)] {
    SANITIZE_REGEXES.get_or_init(|| {
        SANITIZE_RULES
            .iter()
            .map(|(name, pattern)| (*name, Regex::new(pattern).expect("valid sanitize pattern")))
            .collect()
    })
}

fn sanitize_pass(html: &str) -> String {
    let mut out = html.to_string();
    for (rule, re) in sanitize_regexes() {
        if re.is_match(&out) {
            let before = out.len();
            out = re.replace_all(&out, "").into_owned();
            trace!("sanitize[{}]: -{} bytes", rule, before - out.len());
        }
    }
    out
}

/// Strip head, scripts, comments, inline-styled tags, styles, SVG, canvas and
/// images from a DOM serialization.
///
/// Removals can splice text together into a new match (`<scr<b style="x">ipt>`),
/// so passes repeat until the output stops changing. Every productive pass
/// shortens the string, which bounds the loop; `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize_html(html: &str) -> String {
    let mut current = sanitize_pass(html);
    loop {
        let next = sanitize_pass(&current);
        if next == current {
            break;
        }
        current = next;
    }
    debug!(
        "Original HTML size: {}, Cleaned HTML size: {}",
        html.len(),
        current.len()
    );
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>t</title><meta charset="utf-8"></head>
<body>
<!-- tracking
     comment -->
<script>var x = "<div>";</script>
<style>.a { color: red }</style>
<div class="row" style="display:flex">
  <a href="/watch?v=abc">Lecture 1: Intro</a>
  <span>1,234 views</span>
  <img src="thumb.jpg" alt="x">
  <svg viewBox="0 0 1 1"><path d="M0"/></svg>
  <canvas width="4">fallback</canvas>
</div>
<header><h1>Course Title</h1></header>
</body></html>"#;

    #[test]
    fn test_removes_every_targeted_construct() {
        let out = sanitize_html(PAGE);
        for needle in [
            "<head>", "<title>", "<script", "<style", "<svg", "<canvas", "<img", "<!--", "style=\"",
        ] {
            assert!(!out.contains(needle), "{needle} survived: {out}");
        }
    }

    #[test]
    fn test_keeps_text_outside_targeted_constructs() {
        let out = sanitize_html(PAGE);
        assert!(out.contains(r#"<a href="/watch?v=abc">Lecture 1: Intro</a>"#));
        assert!(out.contains("<span>1,234 views</span>"));
        assert!(out.contains("<header><h1>Course Title</h1></header>"));
        assert!(!out.contains("fallback"));
        assert!(!out.contains("tracking"));
    }

    #[test]
    fn test_idempotent() {
        for input in [
            PAGE,
            "",
            "plain text",
            r#"<scr<b style="x">ipt>alert(1)</script>"#,
            "<!-<!---->- nested -->",
            "<script>unterminated",
        ] {
            let once = sanitize_html(input);
            assert_eq!(sanitize_html(&once), once, "input: {input}");
        }
    }

    #[test]
    fn test_spliced_script_is_removed() {
        let out = sanitize_html(r#"<p>a</p><scr<b style="x">ipt>alert(1)</script><p>b</p>"#);
        assert_eq!(out, "<p>a</p><p>b</p>");
    }

    #[test]
    fn test_header_element_is_not_mistaken_for_head() {
        let out = sanitize_html("<header>keep</header><p>x</p>");
        assert_eq!(out, "<header>keep</header><p>x</p>");
    }
}
