//! Query text helpers.

/// Rewrite `?` placeholders into Postgres positional `$1, $2, ...` parameters.
///
/// Pure and order-preserving. There is no quoting logic: a `?` inside a
/// string literal is rewritten too, so query text must never embed data.
/// Already-positional text contains no `?` and passes through unchanged.
pub fn adapt_query(query: &str) -> String {
    let mut adapted = String::with_capacity(query.len() + 8);
    let mut position = 0usize;
    for ch in query.chars() {
        if ch == '?' {
            position += 1;
            adapted.push('$');
            adapted.push_str(&position.to_string());
        } else {
            adapted.push(ch);
        }
    }
    adapted
}

/// Split an embedded schema file into executable statements.
///
/// Statements consisting only of `--` comments are dropped.
pub(crate) fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}
