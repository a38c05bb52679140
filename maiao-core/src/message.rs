use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

const FIXUP_PREFIX: &str = "fixup! ";
const CHANGE_ID_HEADER: &str = "Change-Id";

/// Trailer lines are `Name: value` with a mandatory space after the colon.
static TRAILER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_-]+)\s*:\s+(.+)$").expect("invalid trailer regex")
});

/// Values shaped like `scheme://...` disqualify a line from being a trailer,
/// so prose such as `see the docs: https://example.com` stays in the body.
static URL_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*://").expect("invalid scheme regex"));

/// Structured form of a commit message: first line, free-form body, and the
/// trailer headers found anywhere after the title.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub title: String,
    pub body: String,
    pub headers: BTreeMap<String, String>,
}

impl Message {
    /// Parse a raw commit message. Accepts both `\n` and `\r\n` line endings.
    pub fn parse(input: &str) -> Self {
        let mut lines = input.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
        let title = lines.next().unwrap_or_default().to_string();
        let mut message = Message {
            title,
            ..Default::default()
        };
        let mut sep = "";
        for line in lines {
            match TRAILER_RE.captures(line) {
                Some(caps) if !URL_VALUE_RE.is_match(&caps[2]) => {
                    message
                        .headers
                        .insert(caps[1].to_string(), caps[2].to_string());
                }
                _ => {
                    message.body.push_str(sep);
                    message.body.push_str(line);
                    sep = "\n";
                }
            }
        }
        message.body = message.body.trim_matches('\n').to_string();
        message
    }

    /// Whether the title carries at least one `fixup! ` prefix.
    pub fn is_fixup(&self) -> bool {
        is_fixup_title(&self.title)
    }

    /// The title with every `fixup! ` prefix stripped. Fixup commits group
    /// with the non-fixup commit sharing this folded title.
    pub fn folded_title(&self) -> &str {
        let mut title = self.title.as_str();
        while is_fixup_title(title) {
            title = &title[FIXUP_PREFIX.len()..];
        }
        title
    }

    /// The `Change-Id` trailer value, when present.
    pub fn change_id(&self) -> Option<&str> {
        self.headers.get(CHANGE_ID_HEADER).map(String::as_str)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title)?;
        if !self.body.is_empty() || !self.headers.is_empty() {
            write!(f, "\n\n")?;
        }
        if !self.body.is_empty() {
            write!(f, "{}", self.body)?;
            if !self.headers.is_empty() {
                write!(f, "\n\n")?;
            }
        }
        let mut sep = "";
        for (name, value) in &self.headers {
            write!(f, "{sep}{name}: {value}")?;
            sep = "\n";
        }
        Ok(())
    }
}

fn is_fixup_title(title: &str) -> bool {
    title
        .get(..FIXUP_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(FIXUP_PREFIX))
}
