//! アクションコードのパース
//!
//! アクションコードは `;` で区切ったビルトイン呼び出しの列です。
//! 例: `print("rdi =", rdi); bt()`

use crate::builtins;
use crate::expr_eval::{parse_expression, Expr};
use crate::Result;
use anyhow::Context;

/// 1つのビルトイン呼び出し
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 元のソーステキスト（エラーのバックトレースに使う）
    pub text: String,
    pub name: String,
    pub args: Vec<Expr>,
}

/// パース済みのアクションコード
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionCode {
    statements: Vec<Statement>,
}

impl ActionCode {
    /// アクションコードをパースする
    ///
    /// 未知のビルトインや引数の数の誤りはここでエラーになります。
    pub fn parse(code: &str) -> Result<Self> {
        let statements = split_statements(code)?
            .into_iter()
            .map(|text| parse_statement(&text).with_context(|| format!("Invalid statement '{}'", text)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { statements })
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

fn parse_statement(text: &str) -> Result<Statement> {
    let Expr::Call { name, args } = parse_expression(text)? else {
        return Err(anyhow::anyhow!("Expected a builtin call such as print(...)"));
    };

    let builtin = builtins::lookup(&name)
        .ok_or_else(|| anyhow::anyhow!("Unknown builtin '{}' (see --help-builtins)", name))?;
    builtin.check_arity(args.len())?;

    Ok(Statement {
        text: text.to_string(),
        name,
        args,
    })
}

/// 文字列・括弧の外にある `;` で分割する（空の文は捨てる）
fn split_statements(code: &str) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = code.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                current.push(c);
                loop {
                    match chars.next() {
                        Some('\\') => {
                            current.push('\\');
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        Some('"') => {
                            current.push('"');
                            break;
                        }
                        Some(c) => current.push(c),
                        None => return Err(anyhow::anyhow!("Unterminated string literal in action code")),
                    }
                }
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ';' if depth == 0 => statements.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    statements.push(current);

    Ok(statements
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statements() {
        let code = ActionCode::parse(r#"print("a;b", rax); record() ;; bt()"#).unwrap();
        let texts: Vec<&str> = code.statements().iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec![r#"print("a;b", rax)"#, "record()", "bt()"]);
        assert_eq!(code.statements()[0].name, "print");
        assert_eq!(code.statements()[0].args.len(), 2);
    }

    #[test]
    fn test_empty_action() {
        assert!(ActionCode::parse("").unwrap().is_empty());
        assert!(ActionCode::parse(" ; ").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_actions() {
        assert!(ActionCode::parse("rax + 1").is_err());
        assert!(ActionCode::parse("launch_missiles()").is_err());
        assert!(ActionCode::parse("record(1)").is_err());
        assert!(ActionCode::parse("setmem(1, 2)").is_err());
        assert!(ActionCode::parse("print(\"oops)").is_err());
    }

    #[test]
    fn test_error_names_statement() {
        let err = ActionCode::parse("record(); dump(rsp)").unwrap_err();
        assert_eq!(err.to_string(), "Invalid statement 'dump(rsp)'");
    }
}
