use crate::error::OracleError;
use crate::secrets::StagedSecrets;

pub const MAX_ARGS: usize = 64;
const MAX_ARG_BYTES: usize = 1024;

/// Static checks on a DON script before it is put in a request
pub struct ScriptValidator;

impl ScriptValidator {
    pub fn validate_source(source: &str, max_bytes: usize) -> Result<(), OracleError> {
        if source.trim().is_empty() {
            return Err(invalid("empty source script"));
        }

        if source.len() > max_bytes {
            return Err(invalid(format!("source exceeds {} bytes", max_bytes)));
        }

        if !source.contains("return") {
            return Err(invalid("source never returns a result"));
        }

        Self::check_forbidden_operations(source)?;
        Self::check_balanced(source)?;

        Ok(())
    }

    /// Secrets reach the DON through the `secrets` object only
    fn check_forbidden_operations(source: &str) -> Result<(), OracleError> {
        const FORBIDDEN: &[&str] = &[
            "eval(",
            "new Function(",
            "process.env",
            "Deno.env",
        ];

        for forbidden in FORBIDDEN {
            if source.contains(forbidden) {
                return Err(invalid(format!("forbidden operation: {}", forbidden)));
            }
        }

        Ok(())
    }

    /// Bracket matching over code only; comments, strings and regex literals are skipped
    fn check_balanced(source: &str) -> Result<(), OracleError> {
        let mut stack = Vec::new();
        let mut chars = source.chars().peekable();
        let mut prev: Option<char> = None;
        let mut word = String::new();
        let mut in_word = false;

        while let Some(ch) = chars.next() {
            match ch {
                '/' if chars.peek() == Some(&'/') => {
                    chars.by_ref().find(|&c| c == '\n');
                    in_word = false;
                    continue;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    let mut star = false;
                    if !chars.by_ref().any(|c| std::mem::replace(&mut star, c == '*') && c == '/') {
                        return Err(invalid("unterminated block comment"));
                    }
                    in_word = false;
                    continue;
                }
                '/' if regex_allowed(prev, &word) => skip_literal(&mut chars, '/')?,
                '"' | '\'' | '`' => skip_literal(&mut chars, ch)?,
                '(' | '[' | '{' => stack.push(ch),
                ')' | ']' | '}' => {
                    let open = match ch {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    if stack.pop() != Some(open) {
                        return Err(invalid(format!("unmatched '{}'", ch)));
                    }
                }
                _ => {}
            }

            let ident = is_ident(ch);
            if ident && !in_word {
                word.clear();
            }
            if ident {
                word.push(ch);
            }
            in_word = ident;
            if !ch.is_whitespace() {
                prev = Some(ch);
            }
        }

        if let Some(open) = stack.pop() {
            return Err(invalid(format!("unclosed '{}'", open)));
        }

        Ok(())
    }
}

fn is_ident(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$'
}

/// Whether a `/` after `prev` opens a regex literal rather than dividing
fn regex_allowed(prev: Option<char>, word: &str) -> bool {
    match prev {
        None => true,
        Some(c) if is_ident(c) => matches!(word, "return" | "typeof" | "case" | "await" | "yield" | "in" | "of"),
        Some(')' | ']' | '}' | '"' | '\'' | '`' | '/') => false,
        Some(_) => true,
    }
}

/// Consume a literal opened by `quote`, up to and including its closing quote
fn skip_literal<I: Iterator<Item = char>>(chars: &mut I, quote: char) -> Result<(), OracleError> {
    let mut escaped = false;
    let mut in_class = false;

    for ch in chars {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '\n' if quote == '/' => break,
            '[' if quote == '/' => in_class = true,
            ']' if quote == '/' => in_class = false,
            c if c == quote && !in_class => return Ok(()),
            _ => {}
        }
    }

    Err(invalid(if quote == '/' {
        "unterminated regular expression literal"
    } else {
        "unterminated string literal"
    }))
}

pub fn validate_args(args: &[String]) -> Result<(), OracleError> {
    if args.len() > MAX_ARGS {
        return Err(invalid(format!("{} args exceed limit of {}", args.len(), MAX_ARGS)));
    }

    if let Some(i) = args.iter().position(|a| a.len() > MAX_ARG_BYTES) {
        return Err(invalid(format!("arg {} exceeds {} bytes", i, MAX_ARG_BYTES)));
    }

    Ok(())
}

/// Refuse requests that carry a staged secret in the clear
pub fn check_no_plaintext_secrets(
    source: &str,
    args: &[String],
    staged: &StagedSecrets,
) -> Result<(), OracleError> {
    if let Some(i) = args.iter().position(|a| staged.matches_secret(a)) {
        return Err(invalid(format!("arg {} is a staged secret value", i)));
    }

    let leaked = source
        .split(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '`' | ',' | ';' | '(' | ')' | ':' | '{' | '}'))
        .filter(|token| !token.is_empty())
        .any(|token| staged.matches_secret(token));
    if leaked {
        return Err(invalid("source embeds a staged secret value"));
    }

    Ok(())
}

fn invalid(msg: impl Into<String>) -> OracleError {
    OracleError::InvalidRequestConfig(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_rules() {
        assert!(ScriptValidator::validate_source("return Functions.encodeUint256(1);", 1000).is_ok());
        assert!(ScriptValidator::validate_source("   ", 1000).is_err());
        assert!(ScriptValidator::validate_source("const x = 1;", 1000).is_err());
        assert!(ScriptValidator::validate_source("return eval('1')", 1000).is_err());
        assert!(ScriptValidator::validate_source("return f(1", 1000).is_err());
        assert!(ScriptValidator::validate_source("return ')'", 1000).is_ok());
        assert!(ScriptValidator::validate_source(&"return 1;".repeat(200), 100).is_err());
    }

    #[test]
    fn test_comments_and_regex_skipped() {
        let commented = "// don't retry on 4xx\nreturn Functions.encodeUint256(1); /* it's (done */";
        assert!(ScriptValidator::validate_source(commented, 1000).is_ok());

        let regex = "const ok = /^[\"')]+$/.test(args[0]);\nreturn Functions.encodeUint256(ok ? 1 : 0);";
        assert!(ScriptValidator::validate_source(regex, 1000).is_ok());

        let division = "const half = args.length / 2; const q = (half) / 1;\nreturn Functions.encodeUint256(half);";
        assert!(ScriptValidator::validate_source(division, 1000).is_ok());

        assert!(ScriptValidator::validate_source("return 1; /* open", 1000).is_err());
        assert!(ScriptValidator::validate_source("return '1;", 1000).is_err());
        assert!(ScriptValidator::validate_source("// (\nreturn f(1", 1000).is_err());
    }

    #[test]
    fn test_args_limits() {
        assert!(validate_args(&vec!["1".to_string(); MAX_ARGS]).is_ok());
        assert!(validate_args(&vec!["1".to_string(); MAX_ARGS + 1]).is_err());
        assert!(validate_args(&["x".repeat(2000)]).is_err());
    }
}
