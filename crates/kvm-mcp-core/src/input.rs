//! Keyboard input parsing for the KVM.
//!
//! Text typed on the target machine may mix literal characters with `{...}`
//! tags naming keys to press:
//!
//! - `{enter}`, `{tab}`, `{f5}`: a named key
//! - `{ctrl+c}`, `{ctrl+shift+t}`: a key with modifiers
//! - `{0x87}`: a raw HID keycode
//! - `{lbrace}` / `{rbrace}` (or `{{` / `}}`): literal braces
//!
//! Parsing turns such a string into an ordered list of [`InputDirective`]s.
//! Anything that does not resolve is an error rather than a literal, so a
//! typo never reaches the target machine as stray keystrokes.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A modifier key held while another key is pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    Ctrl,
    Alt,
    Shift,
    /// The GUI key (Windows / Super / Command).
    Win,
}

impl Modifier {
    /// Resolve a modifier name (case insensitive, surrounding whitespace ignored).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ctrl" | "control" => Some(Modifier::Ctrl),
            "alt" | "option" => Some(Modifier::Alt),
            "shift" => Some(Modifier::Shift),
            "win" | "meta" | "gui" | "super" | "cmd" => Some(Modifier::Win),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modifier::Ctrl => "ctrl",
            Modifier::Alt => "alt",
            Modifier::Shift => "shift",
            Modifier::Win => "win",
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Modifiers are a set; ordering is fixed so serialization is deterministic.
pub type ModifierSet = BTreeSet<Modifier>;

/// One atomic input action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputDirective {
    /// Type the text using the target keyboard layout.
    Literal { text: String },
    /// Press and release `key` while holding `modifiers`.
    KeyPress { key: String, modifiers: ModifierSet },
}

impl InputDirective {
    pub fn literal(text: impl Into<String>) -> Self {
        InputDirective::Literal { text: text.into() }
    }

    pub fn key_press(key: impl Into<String>, modifiers: impl IntoIterator<Item = Modifier>) -> Self {
        InputDirective::KeyPress {
            key: key.into(),
            modifiers: modifiers.into_iter().collect(),
        }
    }
}

impl fmt::Display for InputDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputDirective::Literal { text } => f.write_str(text),
            InputDirective::KeyPress { key, modifiers } => {
                for modifier in modifiers {
                    write!(f, "{}+", modifier)?;
                }
                f.write_str(key)
            }
        }
    }
}

/// One step of an explicit key sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySequenceStep {
    pub key: String,
    pub modifiers: ModifierSet,
    /// Pause after this key completes, before the next step is sent.
    pub delay_ms: u64,
}

impl KeySequenceStep {
    /// Build a step, validating the key and modifier names.
    pub fn new<S: AsRef<str>>(key: &str, modifiers: &[S], delay_ms: u64) -> Result<Self, TagError> {
        let (key, modifiers) = resolve_key_parts(key, modifiers)?;
        Ok(Self {
            key,
            modifiers,
            delay_ms,
        })
    }

    /// The key press this step performs.
    pub fn directive(&self) -> InputDirective {
        InputDirective::KeyPress {
            key: self.key.clone(),
            modifiers: self.modifiers.clone(),
        }
    }
}

/// Why a tag failed to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagErrorReason {
    #[error("empty tag")]
    Empty,
    #[error("missing closing '}}'")]
    Unterminated,
    #[error("unmatched '}}' (use {{rbrace}} or '}}}}' to type a brace)")]
    UnmatchedClose,
    #[error("empty key or modifier name")]
    EmptyToken,
    #[error("unknown modifier '{0}'")]
    UnknownModifier(String),
    #[error("unknown key '{0}'")]
    UnknownKey(String),
}

/// A `{...}` span (or explicit key) that does not resolve to a known key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed tag '{span}' at offset {offset}: {reason}")]
pub struct TagError {
    /// The offending source text, including braces.
    pub span: String,
    /// Byte offset of the span in the input.
    pub offset: usize,
    pub reason: TagErrorReason,
}

impl TagError {
    fn new(span: &str, offset: usize, reason: TagErrorReason) -> Self {
        Self {
            span: span.to_string(),
            offset,
            reason,
        }
    }
}

/// Outcome of resolving a single tag body.
enum Tag {
    /// Escaped brace, merged into the surrounding literal text.
    Literal(char),
    Key { key: String, modifiers: ModifierSet },
}

/// Map a key name to its canonical form.
///
/// Returns None for names outside the vocabulary.
fn canonical_key(token: &str) -> Option<String> {
    let lower = token.to_ascii_lowercase();

    let named = match lower.as_str() {
        "enter" | "return" => Some("enter"),
        "tab" => Some("tab"),
        "escape" | "esc" => Some("escape"),
        "backspace" | "bs" => Some("backspace"),
        "delete" | "del" => Some("delete"),
        "insert" | "ins" => Some("insert"),
        "home" => Some("home"),
        "end" => Some("end"),
        "pageup" | "pgup" => Some("pageup"),
        "pagedown" | "pgdn" => Some("pagedown"),
        "up" | "arrowup" => Some("up"),
        "down" | "arrowdown" => Some("down"),
        "left" | "arrowleft" => Some("left"),
        "right" | "arrowright" => Some("right"),
        "space" => Some("space"),
        "printscreen" | "prtsc" => Some("printscreen"),
        "capslock" => Some("capslock"),
        // Modifiers pressed on their own (e.g. {win} opens the start menu)
        "ctrl" | "control" => Some("ctrl"),
        "alt" | "option" => Some("alt"),
        "shift" => Some("shift"),
        "win" | "meta" | "gui" | "super" | "cmd" => Some("win"),
        // Named aliases for characters with special meaning in tags
        "plus" => Some("+"),
        "lbrace" => Some("{"),
        "rbrace" => Some("}"),
        _ => None,
    };
    if let Some(name) = named {
        return Some(name.to_string());
    }

    // Function keys F1-F12
    if let Some(digits) = lower.strip_prefix('f') {
        if !digits.starts_with('0') && digits.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(n @ 1..=12) = digits.parse::<u8>() {
                return Some(format!("f{}", n));
            }
        }
    }

    // Raw HID keycode: 0xN or 0xNN
    if let Some(hex) = lower.strip_prefix("0x") {
        if (1..=2).contains(&hex.len()) && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            if let Ok(code) = u8::from_str_radix(hex, 16) {
                return Some(format!("0x{:02x}", code));
            }
        }
    }

    // Single printable character, case preserved
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if !c.is_whitespace() && !c.is_control() && c != '{' && c != '}' => {
            Some(c.to_string())
        }
        _ => None,
    }
}

fn parse_modifiers<'a>(
    tokens: impl IntoIterator<Item = &'a str>,
) -> Result<ModifierSet, TagErrorReason> {
    let mut modifiers = ModifierSet::new();
    for token in tokens {
        let token = token.trim();
        if token.is_empty() {
            return Err(TagErrorReason::EmptyToken);
        }
        let modifier = Modifier::from_name(token)
            .ok_or_else(|| TagErrorReason::UnknownModifier(token.to_string()))?;
        modifiers.insert(modifier);
    }
    Ok(modifiers)
}

/// Resolve the body of a `{...}` tag (without braces).
fn parse_tag(body: &str) -> Result<Tag, TagErrorReason> {
    if body.trim().is_empty() {
        return Err(TagErrorReason::Empty);
    }

    let tokens: Vec<&str> = body.split('+').collect();
    let (key_token, modifier_tokens) = match tokens.split_last() {
        Some(parts) => parts,
        None => return Err(TagErrorReason::Empty),
    };

    let modifiers = parse_modifiers(modifier_tokens.iter().copied())?;

    let key_token = key_token.trim();
    if key_token.is_empty() {
        return Err(TagErrorReason::EmptyToken);
    }
    let key = canonical_key(key_token)
        .ok_or_else(|| TagErrorReason::UnknownKey(key_token.to_string()))?;

    if modifiers.is_empty() {
        match key.as_str() {
            "{" => return Ok(Tag::Literal('{')),
            "}" => return Ok(Tag::Literal('}')),
            _ => {}
        }
    }

    Ok(Tag::Key { key, modifiers })
}

/// Resolve an explicit key name and modifier names into a key press.
///
/// Uses the same vocabulary as tags, so `resolve_key("c", &["ctrl"])` is
/// equivalent to the tag `{ctrl+c}`.
pub fn resolve_key<S: AsRef<str>>(key: &str, modifiers: &[S]) -> Result<InputDirective, TagError> {
    let (key, modifiers) = resolve_key_parts(key, modifiers)?;
    Ok(InputDirective::KeyPress { key, modifiers })
}

fn resolve_key_parts<S: AsRef<str>>(
    key: &str,
    modifiers: &[S],
) -> Result<(String, ModifierSet), TagError> {
    let span = || {
        let mut parts: Vec<&str> = modifiers.iter().map(AsRef::as_ref).collect();
        parts.push(key);
        parts.join("+")
    };

    let modifier_set = parse_modifiers(modifiers.iter().map(AsRef::as_ref))
        .map_err(|reason| TagError::new(&span(), 0, reason))?;

    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(TagError::new(&span(), 0, TagErrorReason::EmptyToken));
    }
    let canonical = canonical_key(trimmed).ok_or_else(|| {
        TagError::new(&span(), 0, TagErrorReason::UnknownKey(trimmed.to_string()))
    })?;

    Ok((canonical, modifier_set))
}

/// Parse tagged text into an ordered list of input directives.
///
/// Adjacent literal text is coalesced into one [`InputDirective::Literal`].
/// Empty input yields an empty list.
///
/// # Examples
///
/// ```
/// use kvm_mcp_core::input::{parse_tagged_text, InputDirective, Modifier};
///
/// let seq = parse_tagged_text("ls -la{enter}").unwrap();
/// assert_eq!(
///     seq,
///     vec![
///         InputDirective::literal("ls -la"),
///         InputDirective::key_press("enter", []),
///     ]
/// );
///
/// let seq = parse_tagged_text("{ctrl+c}").unwrap();
/// assert_eq!(seq, vec![InputDirective::key_press("c", [Modifier::Ctrl])]);
///
/// assert!(parse_tagged_text("abc{").is_err());
/// ```
pub fn parse_tagged_text(input: &str) -> Result<Vec<InputDirective>, TagError> {
    let mut directives = Vec::new();
    let mut literal = String::new();
    let mut chars = input.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match c {
            '{' => {
                // Doubled brace is an escaped literal
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    literal.push('{');
                    continue;
                }

                let body_start = offset + 1;
                let Some(len) = input[body_start..].find('}') else {
                    return Err(TagError::new(
                        &input[offset..],
                        offset,
                        TagErrorReason::Unterminated,
                    ));
                };
                let body_end = body_start + len;
                let span = &input[offset..=body_end];

                // Skip past the closing brace
                while matches!(chars.peek(), Some(&(i, _)) if i <= body_end) {
                    chars.next();
                }

                match parse_tag(&input[body_start..body_end])
                    .map_err(|reason| TagError::new(span, offset, reason))?
                {
                    Tag::Literal(ch) => literal.push(ch),
                    Tag::Key { key, modifiers } => {
                        if !literal.is_empty() {
                            directives.push(InputDirective::Literal {
                                text: std::mem::take(&mut literal),
                            });
                        }
                        directives.push(InputDirective::KeyPress { key, modifiers });
                    }
                }
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    literal.push('}');
                    continue;
                }
                return Err(TagError::new("}", offset, TagErrorReason::UnmatchedClose));
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        directives.push(InputDirective::Literal { text: literal });
    }

    Ok(directives)
}
