//! Placeholder expansion.
//!
//! Expansion runs in two phases. [`tokenize`] splits the query text into literal
//! segments and markers, and [`rewrite`] pairs markers with bindings in order,
//! producing the final SQL and a flat positional parameter list.
//!
//! Two markers are recognised:
//!
//! - `?` takes one scalar binding.
//! - `?*` takes one list binding and becomes `?, ?, ...` with one `?` per
//!   element. An empty list leaves nothing behind, so `IN (?*)` becomes `IN ()`.
//!   The `*` only makes a spread marker when the marker ends there: it must be
//!   followed by whitespace, `)`, `,`, `;` or the end of the query. Otherwise
//!   it is multiplication, so `?*2` is a `?` marker times two.
//!
//! Question marks inside string literals, quoted identifiers and comments are
//! copied through untouched.

use super::params::Binding;
use crate::error::{DbError, DbResult};
use crate::models::Value;

/// Separator placed between the markers of an expanded list.
pub const LIST_SEPARATOR: &str = ", ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Single,
    Spread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'q> {
    Text(&'q str),
    Marker(Marker),
}

/// Expanded SQL and the values for its markers, in position order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Split `sql` into text and marker segments.
pub fn tokenize(sql: &str) -> Vec<Segment<'_>> {
    let bytes = sql.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => i = skip_quoted(bytes, i, b'\''),
            b'"' => i = skip_quoted(bytes, i, b'"'),
            b'`' => i = skip_quoted(bytes, i, b'`'),
            b'[' => i = skip_until(bytes, i + 1, b"]"),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_until(bytes, i + 2, b"\n"),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_until(bytes, i + 2, b"*/"),
            b'?' => {
                if start < i {
                    segments.push(Segment::Text(&sql[start..i]));
                }
                let spread =
                    bytes.get(i + 1) == Some(&b'*') && ends_marker(bytes.get(i + 2).copied());
                if spread {
                    segments.push(Segment::Marker(Marker::Spread));
                    i += 2;
                } else {
                    segments.push(Segment::Marker(Marker::Single));
                    i += 1;
                }
                start = i;
            }
            _ => i += 1,
        }
    }

    if start < sql.len() {
        segments.push(Segment::Text(&sql[start..]));
    }
    segments
}

/// Whether `next` can follow a spread marker.
fn ends_marker(next: Option<u8>) -> bool {
    match next {
        None => true,
        Some(b) => b.is_ascii_whitespace() || matches!(b, b')' | b',' | b';'),
    }
}

/// Index just past the closing quote. A doubled quote is an escape.
fn skip_quoted(bytes: &[u8], open: usize, quote: u8) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Index just past `terminator`, or the end of input.
fn skip_until(bytes: &[u8], from: usize, terminator: &[u8]) -> usize {
    bytes[from.min(bytes.len())..]
        .windows(terminator.len())
        .position(|w| w == terminator)
        .map(|pos| from + pos + terminator.len())
        .unwrap_or(bytes.len())
}

/// Pair markers with bindings and build the final query.
pub fn rewrite(segments: &[Segment<'_>], bindings: Vec<Binding>) -> DbResult<BoundQuery> {
    let markers = segments
        .iter()
        .filter(|s| matches!(s, Segment::Marker(_)))
        .count();
    if markers != bindings.len() {
        return Err(DbError::bind(format!(
            "Query has {} placeholder(s) but {} parameter(s) were bound",
            markers,
            bindings.len()
        )));
    }

    let width: usize = bindings.iter().map(Binding::width).sum();
    let mut sql = String::new();
    let mut params = Vec::with_capacity(width);
    let mut bindings = bindings.into_iter();

    for (position, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Text(text) => sql.push_str(text),
            Segment::Marker(marker) => {
                // Counts were checked above
                let Some(binding) = bindings.next() else {
                    return Err(DbError::internal("placeholder without a binding"));
                };
                match (marker, binding) {
                    (Marker::Single, Binding::Single(tagged)) => {
                        sql.push('?');
                        params.push(tagged.resolve()?);
                    }
                    (Marker::Spread, Binding::List(items)) => {
                        for (i, tagged) in items.into_iter().enumerate() {
                            if i > 0 {
                                sql.push_str(LIST_SEPARATOR);
                            }
                            sql.push('?');
                            params.push(tagged.resolve()?);
                        }
                    }
                    (Marker::Single, Binding::List(_)) => {
                        return Err(DbError::bind(format!(
                            "List bound to plain placeholder (segment {})",
                            position
                        )));
                    }
                    (Marker::Spread, Binding::Single(_)) => {
                        return Err(DbError::bind(format!(
                            "Scalar bound to spread placeholder (segment {})",
                            position
                        )));
                    }
                }
            }
        }
    }

    Ok(BoundQuery { sql, params })
}

/// Tokenize and rewrite in one step.
pub fn expand(sql: &str, bindings: Vec<Binding>) -> DbResult<BoundQuery> {
    rewrite(&tokenize(sql), bindings)
}

/// Number of plain `?` markers in already-expanded SQL.
pub fn count_markers(sql: &str) -> usize {
    tokenize(sql)
        .iter()
        .filter(|s| matches!(s, Segment::Marker(_)))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::params::TaggedValue;

    fn int(v: i64) -> Binding {
        Binding::Single(TaggedValue::new('i', v))
    }

    fn ints(values: &[i64]) -> Binding {
        Binding::List(values.iter().map(|v| TaggedValue::new('i', *v)).collect())
    }

    #[test]
    fn test_tokenize_plain_and_spread() {
        let segments = tokenize("SELECT * FROM t WHERE a = ? AND b IN (?*)");
        assert_eq!(
            segments,
            vec![
                Segment::Text("SELECT * FROM t WHERE a = "),
                Segment::Marker(Marker::Single),
                Segment::Text(" AND b IN ("),
                Segment::Marker(Marker::Spread),
                Segment::Text(")"),
            ]
        );
    }

    #[test]
    fn test_tokenize_star_after_marker_is_multiplication() {
        assert_eq!(
            tokenize("SELECT ?*2"),
            vec![
                Segment::Text("SELECT "),
                Segment::Marker(Marker::Single),
                Segment::Text("*2"),
            ]
        );
        assert_eq!(
            tokenize("SELECT ?*(1 + 1)")[1],
            Segment::Marker(Marker::Single)
        );

        let bound = expand("SELECT ?*2 AS v", vec![int(21)]).unwrap();
        assert_eq!(bound.sql, "SELECT ?*2 AS v");
        assert_eq!(bound.params, vec![Value::Integer(21)]);
    }

    #[test]
    fn test_tokenize_spread_marker_endings() {
        for sql in ["x IN (?*)", "VALUES (?*, 1)", "SELECT ?*", "SELECT ?* ", "SELECT ?*;"] {
            let markers: Vec<_> = tokenize(sql)
                .into_iter()
                .filter(|s| matches!(s, Segment::Marker(_)))
                .collect();
            assert_eq!(markers, vec![Segment::Marker(Marker::Spread)], "{}", sql);
        }
    }

    #[test]
    fn test_tokenize_skips_literals_and_comments() {
        let sql = "SELECT '?', \"a?\", [b?], `c?` -- why?\n/* ?* */ FROM t WHERE x = ?";
        let markers: Vec<_> = tokenize(sql)
            .into_iter()
            .filter(|s| matches!(s, Segment::Marker(_)))
            .collect();
        assert_eq!(markers, vec![Segment::Marker(Marker::Single)]);
    }

    #[test]
    fn test_tokenize_escaped_quote() {
        let segments = tokenize("SELECT 'it''s ?' , ?");
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1], Segment::Marker(Marker::Single));
    }

    #[test]
    fn test_tokenize_unterminated_literal() {
        assert_eq!(tokenize("SELECT 'oops ?"), vec![Segment::Text("SELECT 'oops ?")]);
    }

    #[test]
    fn test_expand_spread() {
        let bound = expand("SELECT * FROM t WHERE id IN (?*) AND k = ?", vec![ints(&[1, 2, 3]), int(9)])
            .unwrap();
        assert_eq!(bound.sql, "SELECT * FROM t WHERE id IN (?, ?, ?) AND k = ?");
        assert_eq!(
            bound.params,
            vec![
                Value::Integer(1),
                Value::Integer(2),
                Value::Integer(3),
                Value::Integer(9)
            ]
        );
    }

    #[test]
    fn test_expand_empty_list() {
        let bound = expand("SELECT 1 WHERE 1 IN (?*)", vec![ints(&[])]).unwrap();
        assert_eq!(bound.sql, "SELECT 1 WHERE 1 IN ()");
        assert!(bound.params.is_empty());
    }

    #[test]
    fn test_count_mismatch() {
        assert!(matches!(
            expand("SELECT ?, ?", vec![int(1)]),
            Err(DbError::Bind { .. })
        ));
        assert!(matches!(
            expand("SELECT ?", vec![int(1), int(2)]),
            Err(DbError::Bind { .. })
        ));
        assert!(matches!(expand("SELECT 1", vec![int(1)]), Err(DbError::Bind { .. })));
    }

    #[test]
    fn test_kind_mismatch() {
        let err = expand("SELECT ?", vec![ints(&[1])]).unwrap_err();
        assert!(err.to_string().contains("List bound to plain placeholder"));
        let err = expand("SELECT 1 IN (?*)", vec![int(1)]).unwrap_err();
        assert!(err.to_string().contains("Scalar bound to spread placeholder"));
    }

    #[test]
    fn test_expand_resolves_tags() {
        let err = expand("SELECT ?", vec![Binding::Single(TaggedValue::new('q', 1))]).unwrap_err();
        assert!(matches!(err, DbError::Bind { .. }));
    }

    #[test]
    fn test_count_markers() {
        assert_eq!(count_markers("SELECT ?, '?', ?"), 2);
    }
}
