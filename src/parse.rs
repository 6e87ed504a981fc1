use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::isa::Mnemonic;

/// Option suffixes attached to a mnemonic: `MNEMONIC[,X|,M|,pN]*`.
/// At most one of X/M, and at most one patch id, may be present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Options {
    /// `X`: extended arithmetic (incoming carry / shift carry).
    pub ext_arith: bool,
    /// `M`: masked execution.
    pub masked: bool,
    /// `pN`: operand-substitution patch id.
    pub patch: Option<u32>,
}

/// One classified line of assembly text.
#[derive(Debug, Clone)]
pub enum Line {
    Blank,
    /// `.name:`; the name keeps its leading dot, the colon is dropped.
    Label(String),
    Instr {
        mnemonic: Mnemonic,
        options: Options,
        operands: Vec<String>,
    },
}

/// Drops a trailing `#`-comment. A line whose first non-blank char is
/// `#` becomes empty.
pub fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => line[..pos].trim(),
        None => line.trim(),
    }
}

/// Matches a label declaration line, returning `.name` without the
/// trailing colon.
pub fn label_of(line: &str) -> Option<&str> {
    let s = strip_comment(line);
    let name = s.strip_suffix(':')?;
    if !name.starts_with('.') || name.len() < 2 {
        return None;
    }
    if !name.as_bytes()[1].is_ascii_alphanumeric() {
        return None;
    }
    Some(name)
}

/// Cheap first-pass probe: does the line start with a known mnemonic?
/// Used by the label resolver, which must count instruction lines
/// without fully validating them.
pub fn leading_mnemonic(line: &str) -> Option<Mnemonic> {
    let s = strip_comment(line);
    if s.is_empty() || label_of(line).is_some() {
        return None;
    }
    let first = s.split_whitespace().next()?;
    let head = first.split(',').next()?;
    Mnemonic::from_str(head).ok()
}

fn option_token(tok: &str) -> Option<OptionToken> {
    match tok {
        "X" => Some(OptionToken::Ext),
        "M" => Some(OptionToken::Masked),
        _ => {
            let id = tok.strip_prefix('p')?;
            if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            id.parse::<u32>().ok().map(OptionToken::Patch)
        }
    }
}

enum OptionToken {
    Ext,
    Masked,
    Patch(u32),
}

/// Fully tokenizes one line. Operands after the mnemonic/option group
/// may be separated by commas, whitespace, or both.
pub fn parse_line(line: &str, line_no: usize) -> Result<Line> {
    let s = strip_comment(line);
    if s.is_empty() {
        return Ok(Line::Blank);
    }
    if let Some(name) = label_of(line) {
        return Ok(Line::Label(name.to_string()));
    }

    let mut words = s.split_whitespace();
    let head = words.next().unwrap();

    // The first word carries the mnemonic plus comma-attached option
    // suffixes; a comma-attached token that is not an option is an
    // operand (`NNADD,zero,zero,zero` style).
    let mut pieces = head.split(',').filter(|p| !p.is_empty());
    let mn_tok = pieces
        .next()
        .ok_or_else(|| Error::syntax(line_no, line, "empty instruction"))?;
    let mnemonic = Mnemonic::from_str(mn_tok)
        .map_err(|()| Error::syntax(line_no, line, format!("unknown instruction `{mn_tok}`")))?;

    let mut options = Options::default();
    let mut operands: Vec<String> = Vec::new();
    let mut in_options = true;
    for piece in pieces {
        match option_token(piece) {
            Some(tok) if in_options => match tok {
                OptionToken::Ext => {
                    if options.masked || options.ext_arith {
                        return Err(Error::syntax(
                            line_no,
                            line,
                            "too many extensions or patches for instruction",
                        ));
                    }
                    options.ext_arith = true;
                }
                OptionToken::Masked => {
                    if options.masked || options.ext_arith {
                        return Err(Error::syntax(
                            line_no,
                            line,
                            "too many extensions or patches for instruction",
                        ));
                    }
                    options.masked = true;
                }
                OptionToken::Patch(id) => {
                    if options.patch.is_some() {
                        return Err(Error::syntax(
                            line_no,
                            line,
                            "too many extensions or patches for instruction",
                        ));
                    }
                    options.patch = Some(id);
                }
            },
            _ => {
                in_options = false;
                operands.push(piece.to_string());
            }
        }
    }

    for word in words {
        for tok in word.split(',').filter(|t| !t.is_empty()) {
            operands.push(tok.to_string());
        }
    }

    Ok(Line::Instr {
        mnemonic,
        options,
        operands,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blanks() {
        assert!(matches!(parse_line("  # whole line", 1).unwrap(), Line::Blank));
        assert!(matches!(parse_line("", 1).unwrap(), Line::Blank));
    }

    #[test]
    fn label_line() {
        match parse_line(".pLoopL:   # comment", 1).unwrap() {
            Line::Label(name) => assert_eq!(name, ".pLoopL"),
            other => panic!("expected label, got {other:?}"),
        }
        assert!(label_of("NNADD, a, b, p").is_none());
        assert!(label_of(".x").is_none()); // no colon
    }

    #[test]
    fn comma_and_space_operand_styles() {
        for text in [
            "NNADD, zero, zero, zero",
            "NNADD,zero,zero,zero",
            "NNADD zero zero zero",
            "nnadd zero, zero , zero",
        ] {
            match parse_line(text, 1).unwrap() {
                Line::Instr {
                    mnemonic, operands, ..
                } => {
                    assert_eq!(mnemonic, Mnemonic::NNADD);
                    assert_eq!(operands, ["zero", "zero", "zero"]);
                }
                other => panic!("expected instr, got {other:?}"),
            }
        }
    }

    #[test]
    fn option_suffixes() {
        match parse_line("NNADD,X kap0, kap1, kap0", 1).unwrap() {
            Line::Instr { options, .. } => {
                assert!(options.ext_arith);
                assert!(!options.masked);
                assert_eq!(options.patch, None);
            }
            other => panic!("{other:?}"),
        }
        match parse_line("NNSRLS,M,p5 m0, 0, m0", 1).unwrap() {
            Line::Instr { options, .. } => {
                assert!(options.masked);
                assert_eq!(options.patch, Some(5));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn exclusive_options_rejected() {
        assert!(parse_line("NNADD,X,M a, b, p", 1).is_err());
        assert!(parse_line("NNADD,p1,p2 a, b, p", 1).is_err());
    }

    #[test]
    fn register_named_like_option_letter() {
        // `M` attached by comma is an option; separated by space it is
        // the register called M.
        match parse_line("NNADD M, A, C", 1).unwrap() {
            Line::Instr {
                options, operands, ..
            } => {
                assert!(!options.masked);
                assert_eq!(operands, ["M", "A", "C"]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn unknown_mnemonic_is_syntax_error() {
        assert!(parse_line("NNMUL a, b, p", 3).is_err());
    }
}
