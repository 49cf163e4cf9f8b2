//! Parsing of Makefile syntax as found in `.d` files emitted by C compilers.
//!
//! Only the first rule in the file is consumed; compilers that emit extra
//! phony rules for headers get those ignored.

use crate::scanner::{ParseResult, Scanner};
use std::borrow::Cow;

/// The single rule of a depfile: one target and its discovered inputs.
#[derive(Debug, PartialEq)]
pub struct Depfile<'a> {
    pub target: Cow<'a, str>,
    pub deps: Vec<Cow<'a, str>>,
}

/// Skip spaces and backslashed newlines.
fn skip_spaces(scanner: &mut Scanner) -> ParseResult<()> {
    loop {
        match scanner.read() {
            ' ' => {}
            '\\' => match scanner.read() {
                '\n' => {}
                '\r' => {
                    scanner.expect('\n')?;
                }
                _ => return scanner.parse_error("invalid backslash escape"),
            },
            _ => {
                scanner.back();
                break;
            }
        }
    }
    Ok(())
}

/// Read one path from the input scanner.  Backslash-escaped spaces are part
/// of the path; a backslash-newline ends it (line continuation).  Colons
/// are valid path characters because of Windows drive letters, so the
/// `output:` token keeps its trailing colon.
fn read_path<'a>(scanner: &mut Scanner<'a>) -> ParseResult<Option<Cow<'a, str>>> {
    skip_spaces(scanner)?;
    let start = scanner.ofs;
    // Most paths have no escapes and borrow from the input; the unescaped
    // buffer is only materialized when a "\ " shows up.
    let mut unescaped: Option<String> = None;
    loop {
        match scanner.read() {
            '\0' | ' ' | '\n' => {
                scanner.back();
                break;
            }
            '\r' if scanner.peek() == '\n' => {
                scanner.back();
                break;
            }
            '\\' => match scanner.peek() {
                '\n' | '\r' => {
                    scanner.back();
                    break;
                }
                ' ' => {
                    let buf = unescaped
                        .get_or_insert_with(|| scanner.slice(start, scanner.ofs - 1).to_owned());
                    buf.push(' ');
                    scanner.next();
                }
                _ => {
                    if let Some(buf) = unescaped.as_mut() {
                        buf.push('\\');
                    }
                }
            },
            c => {
                if let Some(buf) = unescaped.as_mut() {
                    buf.push(c);
                }
            }
        }
    }
    let end = scanner.ofs;
    match unescaped {
        Some(buf) if !buf.is_empty() => Ok(Some(Cow::Owned(buf))),
        Some(_) => Ok(None),
        None if end == start => Ok(None),
        None => Ok(Some(Cow::Borrowed(scanner.slice(start, end)))),
    }
}

/// Parse a `.d` file, consuming only the first `target: deps...` rule.
pub fn parse<'a>(scanner: &mut Scanner<'a>) -> ParseResult<Depfile<'a>> {
    while matches!(scanner.peek(), ' ' | '\n') {
        scanner.next();
    }
    let target = match read_path(scanner)? {
        None => return scanner.parse_error("expected a target path"),
        Some(t) => t,
    };
    scanner.skip_spaces();
    // The colon either trails the target token or stands alone after spaces.
    let target = match strip_colon(target) {
        Ok(t) => t,
        Err(t) => {
            scanner.expect(':')?;
            t
        }
    };
    let mut deps = Vec::new();
    loop {
        scanner.skip('\r');
        if !scanner.skip('\n') {
            match read_path(scanner)? {
                Some(p) => deps.push(p),
                None => break,
            }
            continue;
        }
        // A blank line or a new rule ends the first rule.
        break;
    }
    Ok(Depfile { target, deps })
}

fn strip_colon(path: Cow<str>) -> Result<Cow<str>, Cow<str>> {
    match path {
        Cow::Borrowed(s) => match s.strip_suffix(':') {
            Some(t) => Ok(Cow::Borrowed(t)),
            None => Err(Cow::Borrowed(s)),
        },
        Cow::Owned(mut s) => {
            if s.ends_with(':') {
                s.pop();
                Ok(Cow::Owned(s))
            } else {
                Err(Cow::Owned(s))
            }
        }
    }
}
