// src/gcode/words.rs - Line normalization and number scanning
//
// Pure helpers: no parser state is touched here, so the scan phase can bail
// on any error without side effects.

/// A command line after comment stripping, whitespace removal, and
/// upper-casing, plus any `(MSG ...)` operator messages found on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedLine {
    pub text: String,
    pub messages: Vec<String>,
}

/// Strip whitespace and `%` markers, delete `(...)` comments and `;`-to-EOL
/// remainders, and upper-case the rest. `(MSG ...)` comment bodies are
/// captured as operator messages instead of being discarded.
pub fn normalize(line: &str) -> NormalizedLine {
    let mut text = String::with_capacity(line.len());
    let mut messages = Vec::new();
    let mut comment: Option<String> = None;

    for c in line.chars() {
        if let Some(body) = comment.as_mut() {
            if c == ')' {
                if let Some(taken) = comment.take() {
                    push_message(&mut messages, &taken);
                }
            } else {
                body.push(c);
            }
            continue;
        }
        match c {
            '(' => comment = Some(String::new()),
            ';' => break,
            '%' | '\r' | '\n' => {}
            c if c.is_whitespace() => {}
            c => text.push(c.to_ascii_uppercase()),
        }
    }
    // Unterminated comment: treat end of line as the closing paren.
    if let Some(taken) = comment.take() {
        push_message(&mut messages, &taken);
    }

    NormalizedLine { text, messages }
}

fn push_message(messages: &mut Vec<String>, body: &str) {
    let trimmed = body.trim();
    if trimmed.len() >= 3 && trimmed[..3].eq_ignore_ascii_case("msg") {
        let rest = trimmed[3..].trim_start_matches([',', ' ']);
        messages.push(rest.to_string());
    }
}

/// Read a decimal number (optional sign, at most one decimal point) starting
/// at `*pos`, advancing `*pos` past it. Returns `None` without advancing if
/// no valid number starts there.
pub fn read_number(bytes: &[u8], pos: &mut usize) -> Option<f32> {
    let start = *pos;
    let mut idx = start;
    if matches!(bytes.get(idx), Some(b'+' | b'-')) {
        idx += 1;
    }
    let mut digits = false;
    let mut dot = false;
    while let Some(&c) = bytes.get(idx) {
        match c {
            b'0'..=b'9' => {
                digits = true;
                idx += 1;
            }
            b'.' if !dot => {
                dot = true;
                idx += 1;
            }
            _ => break,
        }
    }
    if !digits {
        return None;
    }
    let text = std::str::from_utf8(&bytes[start..idx]).ok()?;
    let value = text.parse::<f32>().ok()?;
    *pos = idx;
    Some(value)
}

/// Split a command value into its integer part and its mantissa scaled by
/// 100, so `38.2` becomes `(38, 20)`. Commands only use one or two decimal
/// digits, so the x100 fixed-point form is exact enough to match on.
pub fn split_command(value: f32) -> (i32, u16) {
    let int_value = value.trunc() as i32;
    let mantissa = ((value - int_value as f32) * 100.0).round().max(0.0) as u16;
    (int_value, mantissa)
}
