//! Dynamic query shaping: in-list expansion, aggregate substitution,
//! sort-direction rewriting and optional paging clauses.
//!
//! Queries stay fully parameterized throughout; the builder only ever
//! rewrites template text, never interpolates values.

use rusqlite::ToSql;

/// Score aggregation across multiple source sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Aggregate {
    #[default]
    Sum,
    Min,
    Max,
}

impl Aggregate {
    /// The SQL function token this aggregate substitutes into templates.
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Aggregate::Sum => "sum",
            Aggregate::Min => "min",
            Aggregate::Max => "max",
        }
    }
}

/// Sort direction for ranged queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            SortDir::Asc => "asc",
            SortDir::Desc => "desc",
        }
    }
}

/// Owned named-argument list for dynamically shaped queries.
pub(crate) type NamedArgs = Vec<(String, Box<dyn ToSql>)>;

/// Expands an in-list placeholder into `n` numbered named slots:
/// `key in (:keys)` becomes `key in (:keys0, :keys1, ...)`.
///
/// With `n = 0` the clause can never match; callers short-circuit
/// before issuing such a query.
pub(crate) fn expand_in(query: &str, param: &str, n: usize) -> String {
    let slots = (0..n)
        .map(|i| format!("{param}{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    query.replacen(param, &slots, 1)
}

/// Binds each value to the numbered slot produced by [`expand_in`],
/// in the order supplied.
pub(crate) fn in_args<S: AsRef<str>>(param: &str, values: &[S]) -> NamedArgs {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            (
                format!("{param}{i}"),
                Box::new(v.as_ref().to_owned()) as Box<dyn ToSql>,
            )
        })
        .collect()
}

/// Borrows an owned argument list in the form rusqlite binds.
pub(crate) fn params_ref(args: &NamedArgs) -> Vec<(&str, &dyn ToSql)> {
    args.iter()
        .map(|(name, value)| (name.as_str(), value.as_ref()))
        .collect()
}

/// Rewrites the default `sum` aggregate token in a template.
/// Templates carry the token at most twice (select list and ordering),
/// and nowhere else.
pub(crate) fn with_aggregate(query: &str, agg: Aggregate) -> String {
    if agg == Aggregate::Sum {
        return query.to_owned();
    }
    query.replacen(Aggregate::Sum.sql(), agg.sql(), 2)
}

/// Flips every `asc` ordering token when the direction is descending.
pub(crate) fn with_sort(query: &str, dir: SortDir) -> String {
    if dir == SortDir::Asc {
        return query.to_owned();
    }
    query.replace(SortDir::Asc.sql(), dir.sql())
}

/// Composes the optional paging suffix for score-ranged queries.
/// Zero means "unspecified" for both offset and count; an offset
/// without a count skips and then returns everything remaining.
pub(crate) fn limit_clause(offset: i64, count: i64) -> &'static str {
    if offset > 0 && count > 0 {
        " limit :offset, :count"
    } else if count > 0 {
        " limit :count"
    } else if offset > 0 {
        " limit :offset, -1"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_in() {
        let query = "select count(id) from keys where key in (:keys) and mtime > :now";
        let expanded = expand_in(query, ":keys", 3);
        assert_eq!(
            expanded,
            "select count(id) from keys where key in (:keys0, :keys1, :keys2) and mtime > :now"
        );
    }

    #[test]
    fn test_expand_in_single() {
        let expanded = expand_in("key in (:keys)", ":keys", 1);
        assert_eq!(expanded, "key in (:keys0)");
    }

    #[test]
    fn test_expand_in_leaves_similar_names() {
        // :nkeys must survive the :keys expansion untouched
        let expanded = expand_in("key in (:keys) having n = :nkeys", ":keys", 2);
        assert_eq!(expanded, "key in (:keys0, :keys1) having n = :nkeys");
    }

    #[test]
    fn test_in_args_order() {
        let args = in_args(":keys", &["b", "a"]);
        assert_eq!(args[0].0, ":keys0");
        assert_eq!(args[1].0, ":keys1");
    }

    #[test]
    fn test_with_aggregate_default_verbatim() {
        let query = "select elem, sum(score) from zset order by sum(score), elem";
        assert_eq!(with_aggregate(query, Aggregate::Sum), query);
    }

    #[test]
    fn test_with_aggregate_replaces_both() {
        let query = "select elem, sum(score) from zset order by sum(score), elem";
        assert_eq!(
            with_aggregate(query, Aggregate::Min),
            "select elem, min(score) from zset order by min(score), elem"
        );
        assert_eq!(
            with_aggregate(query, Aggregate::Max),
            "select elem, max(score) from zset order by max(score), elem"
        );
    }

    #[test]
    fn test_with_sort() {
        let query = "order by score asc, elem asc";
        assert_eq!(with_sort(query, SortDir::Asc), query);
        assert_eq!(
            with_sort(query, SortDir::Desc),
            "order by score desc, elem desc"
        );
    }

    #[test]
    fn test_limit_clause() {
        assert_eq!(limit_clause(0, 0), "");
        assert_eq!(limit_clause(0, 5), " limit :count");
        assert_eq!(limit_clause(5, 0), " limit :offset, -1");
        assert_eq!(limit_clause(5, 10), " limit :offset, :count");
    }
}
