//! Prompt detection and device mode classification.
//!
//! A Cisco-style shell has no framing: the only signal that a command is done
//! is the device printing its prompt again, and the prompt's suffix is the only
//! indication of the current mode. Everything here works on the *last line* of
//! the accumulated output, because command output routinely contains `#` and
//! `>` characters that are not prompts.

use std::fmt;

use log::trace;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ConnectError;

/// Current command-acceptance context of the device.
///
/// Every known variant carries the literal prompt it was derived from so
/// callers can render it back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceMode {
    #[default]
    Unknown,
    /// `SW3>`
    UserMode { prompt: String },
    /// `SW3#`
    PrivilegedMode { prompt: String },
    /// `SW3(config)#`
    GlobalConfigMode { prompt: String },
    /// `SW3(config-if)#`, `SW3(config-router)#`, ...
    ///
    /// `context` is the text inside the parentheses, e.g. `config-if`.
    SubConfigMode { prompt: String, context: String },
}

impl DeviceMode {
    /// The prompt text, or `None` when the mode has not been observed yet.
    pub fn prompt(&self) -> Option<&str> {
        match self {
            DeviceMode::Unknown => None,
            DeviceMode::UserMode { prompt }
            | DeviceMode::PrivilegedMode { prompt }
            | DeviceMode::GlobalConfigMode { prompt }
            | DeviceMode::SubConfigMode { prompt, .. } => Some(prompt),
        }
    }

    /// The value surfaced to callers: the raw prompt, or `unknown`.
    pub fn as_prompt_str(&self) -> &str {
        self.prompt().unwrap_or("unknown")
    }

    /// True in global or sub configuration mode.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            DeviceMode::GlobalConfigMode { .. } | DeviceMode::SubConfigMode { .. }
        )
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_prompt_str())
    }
}

/// Result of classifying an output tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptResult {
    pub complete: bool,
    pub mode: DeviceMode,
}

/// Kind of answer an interactive question expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Username,
    Password,
    /// `[confirm]`, `[yes/no]`, `Destination filename [startup-config]?`
    Confirm,
}

/// What the end of the buffer currently looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailState {
    /// A complete prompt; the device is ready for the next command.
    Prompt(DeviceMode),
    /// A question waiting for an answer.
    Input(InputKind),
    /// A pagination marker waiting for the continuation keystroke.
    More,
    /// Output is still arriving.
    Pending,
}

/// Hostname, optional parenthesised context, terminator.
static PROMPT_LINE: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:/@-]*(?:\((?P<ctx>[^\s()]+)\))?(?P<term>[#>])$")
    {
        Ok(re) => re,
        Err(err) => panic!("invalid PROMPT_LINE regex: {err}"),
    }
});

static INPUT_USERNAME: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(r"(?i)^(?:user\s*name|login)\s*:$") {
        Ok(re) => re,
        Err(err) => panic!("invalid INPUT_USERNAME regex: {err}"),
    }
});

static INPUT_PASSWORD: Lazy<Regex> = Lazy::new(|| match Regex::new(r"(?i)password\s*:$") {
    Ok(re) => re,
    Err(err) => panic!("invalid INPUT_PASSWORD regex: {err}"),
});

static INPUT_CONFIRM: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(r"(?i)(?:\[confirm\]|\[yes/no\]:?|\[[^\]\r\n]*\]\?)$") {
        Ok(re) => re,
        Err(err) => panic!("invalid INPUT_CONFIRM regex: {err}"),
    }
});

static AUTH_FAILURE: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(
        r"(?i)(?:%\s*(?:authentication failed|login invalid|bad passwords?)|access denied)",
    ) {
        Ok(re) => re,
        Err(err) => panic!("invalid AUTH_FAILURE regex: {err}"),
    }
});

/// Renders one line the way a terminal would: `\r` returns to column zero,
/// backspace moves left, later characters overwrite earlier ones.
pub fn render_line(line: &str) -> String {
    let mut cells: Vec<char> = Vec::with_capacity(line.len());
    let mut cursor = 0usize;
    for c in line.chars() {
        match c {
            '\r' => cursor = 0,
            '\u{8}' => cursor = cursor.saturating_sub(1),
            '\0' => {}
            _ => {
                if cursor < cells.len() {
                    cells[cursor] = c;
                } else {
                    cells.push(c);
                }
                cursor += 1;
            }
        }
    }
    cells.into_iter().collect()
}

/// The last line of `tail`, rendered and trimmed, or `None` if the buffer ends
/// in a line break (a prompt is never followed by a newline).
fn last_line(tail: &str) -> Option<String> {
    if tail.is_empty() || tail.ends_with('\n') || tail.ends_with('\r') {
        return None;
    }
    let start = tail.rfind('\n').map(|pos| pos + 1).unwrap_or(0);
    let line = render_line(&tail[start..]);
    let line = line.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

/// Classifies a single, already trimmed, line as a prompt.
fn classify_line(line: &str) -> Option<DeviceMode> {
    let caps = PROMPT_LINE.captures(line)?;
    let prompt = line.to_string();
    let ctx = caps.name("ctx").map(|m| m.as_str());
    let term = caps.name("term").map(|m| m.as_str());
    let mode = match (ctx, term) {
        (Some(ctx), Some("#")) if ctx.starts_with("config-") => DeviceMode::SubConfigMode {
            prompt,
            context: ctx.to_string(),
        },
        (Some("config"), Some("#")) => DeviceMode::GlobalConfigMode { prompt },
        (_, Some("#")) => DeviceMode::PrivilegedMode { prompt },
        (_, Some(">")) => DeviceMode::UserMode { prompt },
        _ => return None,
    };
    Some(mode)
}

/// Decides whether `tail` ends in a device prompt and, if so, which mode it shows.
///
/// Priority: `(config-*)#`, `(config)#`, `#`, `>`. Anything else, including a
/// buffer ending in a line break, is incomplete with mode `Unknown`.
pub fn classify(tail: &str) -> PromptResult {
    let mode = last_line(tail).and_then(|line| classify_line(&line));
    trace!("Classified tail {:?} as {:?}", tail, mode);
    match mode {
        Some(mode) => PromptResult {
            complete: true,
            mode,
        },
        None => PromptResult {
            complete: false,
            mode: DeviceMode::Unknown,
        },
    }
}

/// Detects the device mode from any chunk of output.
///
/// Unlike [`classify`] this tolerates trailing whitespace and line breaks and
/// scans the last few non-empty lines, which makes it suitable for output that
/// was captured after the fact.
pub fn detect_device_mode(output: &str) -> DeviceMode {
    output
        .split('\n')
        .map(render_line)
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .rev()
        .take(5)
        .find_map(|line| classify_line(&line))
        .unwrap_or_default()
}

/// True when the text contains a login rejection banner.
pub fn is_auth_failure(text: &str) -> bool {
    AUTH_FAILURE.is_match(text)
}

/// Prompt matcher with the configured pagination markers compiled in.
#[derive(Debug, Clone)]
pub struct PromptMatcher {
    pager: RegexSet,
    pager_strip: Vec<Regex>,
}

impl PromptMatcher {
    /// Compiles the pager patterns.
    pub fn new<S: AsRef<str>>(pager_patterns: &[S]) -> Result<Self, ConnectError> {
        let pager = RegexSet::new(pager_patterns.iter().map(|p| p.as_ref())).map_err(|err| {
            ConnectError::InvalidConfig(format!("failed to build pager regex set: {err}"))
        })?;
        let pager_strip = pager_patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| ConnectError::InvalidConfig(format!("invalid pager regex: {err}")))?;
        Ok(Self { pager, pager_strip })
    }

    /// See [`classify`].
    pub fn classify(&self, tail: &str) -> PromptResult {
        classify(tail)
    }

    /// Inspects the end of the buffer: prompt first, then questions, then pager.
    pub fn inspect(&self, buffer: &str) -> TailState {
        let Some(line) = last_line(buffer) else {
            return TailState::Pending;
        };
        if let Some(mode) = classify_line(&line) {
            return TailState::Prompt(mode);
        }
        if INPUT_USERNAME.is_match(&line) {
            return TailState::Input(InputKind::Username);
        }
        if INPUT_PASSWORD.is_match(&line) {
            return TailState::Input(InputKind::Password);
        }
        if INPUT_CONFIRM.is_match(&line) {
            return TailState::Input(InputKind::Confirm);
        }
        if self.pager.is_match(&line) {
            return TailState::More;
        }
        TailState::Pending
    }

    /// Normalises raw output into plain `\n`-separated text.
    ///
    /// Each line is rendered (carriage returns and backspaces applied), pager
    /// markers that were not erased by the device are removed and trailing
    /// whitespace is trimmed.
    pub fn normalize(&self, raw: &str) -> String {
        raw.split('\n')
            .map(|line| {
                let mut rendered = render_line(line);
                for re in &self.pager_strip {
                    if re.is_match(&rendered) {
                        rendered = re.replace_all(&rendered, "").into_owned();
                    }
                }
                rendered.trim_end().to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
