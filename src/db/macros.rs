//! Backend dispatch macro.
//!
//! Pools, leases and transactions are enums with one variant per backend. The
//! driver types behind each variant expose the same method names, so most
//! operations are the same expression repeated three times; `db_dispatch!`
//! writes that match for us.

/// Match every backend variant of a per-backend enum and evaluate the same
/// body with the inner value bound to `$p`.
///
/// The enum must have exactly the variants `MySql`, `Postgres` and `SQLite`.
///
/// # Example
///
/// ```ignore
/// db_dispatch!(DbPool, &self.pool, |p| p.size())
/// ```
macro_rules! db_dispatch {
    ($enum:ident, $value:expr, |$p:ident| $body:expr) => {
        match $value {
            $enum::MySql($p) => $body,
            $enum::Postgres($p) => $body,
            $enum::SQLite($p) => $body,
        }
    };
}

#[cfg(test)]
mod tests {
    enum Sample {
        MySql(u8),
        Postgres(u16),
        SQLite(u32),
    }

    #[test]
    fn test_dispatch_evaluates_body_per_variant() {
        let values = [Sample::MySql(1), Sample::Postgres(2), Sample::SQLite(3)];
        let total: u64 = values
            .iter()
            .map(|v| db_dispatch!(Sample, v, |n| u64::from(*n)))
            .sum();
        assert_eq!(total, 6);
    }
}
