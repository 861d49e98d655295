//! クエリ定義とコンパイル
//!
//! `-at` と `-at-if` の2つの入力形式を、1つの正規化されたクエリ列にまとめます。

/// 常に真となる条件式
pub const ALWAYS_TRUE: &str = "1";

/// ロケーション・条件・アクションの組
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub location_expr: String,
    pub condition_expr: String,
    pub action_code: String,
}

impl Query {
    /// 無条件クエリを作成する
    pub fn unconditional(location_expr: impl Into<String>, action_code: impl Into<String>) -> Self {
        Self {
            location_expr: location_expr.into(),
            condition_expr: ALWAYS_TRUE.to_string(),
            action_code: action_code.into(),
        }
    }

    /// 条件付きクエリを作成する
    pub fn conditional(
        location_expr: impl Into<String>,
        condition_expr: impl Into<String>,
        action_code: impl Into<String>,
    ) -> Self {
        Self {
            location_expr: location_expr.into(),
            condition_expr: condition_expr.into(),
            action_code: action_code.into(),
        }
    }

    pub fn is_unconditional(&self) -> bool {
        self.condition_expr == ALWAYS_TRUE
    }
}

/// コマンドラインから集めた生のクエリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawQuery {
    /// `-at <location> <action>`
    Unconditional { location: String, action: String },
    /// `-at-if <location> <condition> <action>`
    Conditional {
        location: String,
        condition: String,
        action: String,
    },
}

impl From<RawQuery> for Query {
    fn from(raw: RawQuery) -> Self {
        match raw {
            RawQuery::Unconditional { location, action } => Query::unconditional(location, action),
            RawQuery::Conditional {
                location,
                condition,
                action,
            } => Query::conditional(location, condition, action),
        }
    }
}

/// 2つの入力形式を1つのクエリ列にコンパイルする
///
/// 無条件クエリを先に、それぞれの入力順を保って並べます。
/// 式の構文はここでは検証しません。
pub fn compile(unconditional: Vec<(String, String)>, conditional: Vec<(String, String, String)>) -> Vec<Query> {
    let unconditional = unconditional
        .into_iter()
        .map(|(location, action)| RawQuery::Unconditional { location, action });
    let conditional = conditional
        .into_iter()
        .map(|(location, condition, action)| RawQuery::Conditional {
            location,
            condition,
            action,
        });

    unconditional.chain(conditional).map(Query::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(n: usize) -> Vec<(String, String)> {
        (0..n).map(|i| (format!("loc{}", i), format!("print({})", i))).collect()
    }

    fn triples(m: usize) -> Vec<(String, String, String)> {
        (0..m)
            .map(|i| (format!("cloc{}", i), format!("rax=={}", i), "record()".to_string()))
            .collect()
    }

    #[test]
    fn test_compile_counts() {
        for (n, m) in [(0, 0), (1, 0), (0, 1), (3, 2)] {
            let queries = compile(pairs(n), triples(m));
            assert_eq!(queries.len(), n + m);
            assert!(queries.iter().all(|q| !q.location_expr.is_empty() && !q.action_code.is_empty()));
            assert_eq!(queries.iter().filter(|q| q.is_unconditional()).count(), n);
        }
    }

    #[test]
    fn test_compile_order() {
        let queries = compile(pairs(2), triples(2));
        let locations: Vec<&str> = queries.iter().map(|q| q.location_expr.as_str()).collect();
        assert_eq!(locations, vec!["loc0", "loc1", "cloc0", "cloc1"]);

        assert_eq!(queries[0].condition_expr, ALWAYS_TRUE);
        assert_eq!(queries[2], Query::conditional("cloc0", "rax==0", "record()"));
    }
}
