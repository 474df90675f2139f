//! Command-line encoding for the `command` request.
//!
//! The executable and each argument become separate `rsp:Command` and
//! `rsp:Arguments` elements so the remote shell never re-splits them.

use quick_xml::escape::partial_escape;

use crate::error::{Error, Result};
use crate::response::SHELL_NS;

/// Split a command line on whitespace.
///
/// A token starting with `'` or `"` runs to the matching quote and keeps
/// both quotes. Quotes inside a word and backslashes are literal.
pub fn split_command_line(command_line: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut chars = command_line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut token = String::new();
        if c == '"' || c == '\'' {
            token.push(c);
            chars.next();
            loop {
                match chars.next() {
                    Some(ch) if ch == c => {
                        token.push(ch);
                        break;
                    }
                    Some(ch) => token.push(ch),
                    None => {
                        return Err(Error::Validation(format!(
                            "No closing quotation in command line: {}",
                            command_line
                        )))
                    }
                }
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                token.push(ch);
                chars.next();
            }
        }
        parts.push(token);
    }

    Ok(parts)
}

/// `rsp:CommandLine` element for a plain command line.
pub fn build_command_line_elem(command_line: &str) -> Result<String> {
    let parts = split_command_line(command_line)?;
    render(&parts, None)
}

/// `rsp:CommandLine` element for a PowerShell invocation.
///
/// `-Command` is moved to the end of `ps_command` (and added when absent)
/// and `ps_script` follows it as one argument, so the script is never
/// split on its whitespace.
pub fn build_ps_command_line_elem(ps_command: &str, ps_script: &str) -> Result<String> {
    let mut parts = split_command_line(ps_command)?;
    let position = parts
        .iter()
        .position(|part| part.eq_ignore_ascii_case("-command"));
    match position {
        Some(index) => {
            let option = parts.remove(index);
            parts.push(option);
        }
        None => parts.push("-Command".to_string()),
    }
    render(&parts, Some(ps_script))
}

fn render(parts: &[String], script: Option<&str>) -> Result<String> {
    let (command, arguments) = parts
        .split_first()
        .ok_or_else(|| Error::Validation("Command line is empty".to_string()))?;

    let mut elem = format!(
        "<rsp:CommandLine xmlns:rsp=\"{}\"><rsp:Command>{}</rsp:Command>",
        SHELL_NS,
        partial_escape(command.as_str())
    );
    for argument in arguments.iter().map(String::as_str).chain(script) {
        elem.push_str("<rsp:Arguments>");
        elem.push_str(&partial_escape(argument));
        elem.push_str("</rsp:Arguments>");
    }
    elem.push_str("</rsp:CommandLine>");
    Ok(elem)
}
