//! Property-based tests for the core's pure, network-free invariants (§8).
//!
//! # Prerequisites
//!
//! - No database or network access required.
//! - These tests are purely computational and always run.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test property_tests
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! Properties are organized by module:
//! - **hostname**: parse/canonicalize round-trip
//! - **heartbeat**: `Coordinate` construction rejects every non-finite input
//! - **ratelimit**: column hashing is deterministic and bounded by width

use locate_core::heartbeat::Coordinate;
use locate_core::hostname::Hostname;
use proptest::prelude::*;

// == Hostname Properties ========================================================

proptest! {
    /// `parse(canonical(x)) == x` for any well-formed canonical hostname built
    /// from lowercase-alphanumeric segments, per §4.1's round-trip invariant.
    #[test]
    fn prop_hostname_parse_canonical_round_trips(
        service in "[a-z]{2,8}",
        machine in "[a-z0-9]{2,8}",
        site in "[a-z0-9]{2,8}",
        project in "[a-z0-9]{2,8}",
        domain in "[a-z]{2,8}",
    ) {
        let raw = format!("{service}-{machine}-{site}.{project}.{domain}");
        let parsed = Hostname::parse(&raw).expect("well-formed hostname must parse");
        prop_assert_eq!(parsed.to_string(), raw);
    }

    /// A suffix attached to the final label is stripped by canonicalization
    /// but never affects the parsed core fields.
    #[test]
    fn prop_hostname_suffix_does_not_affect_core_fields(
        service in "[a-z]{2,8}",
        machine in "[a-z0-9]{2,8}",
        site in "[a-z0-9]{2,8}",
        project in "[a-z0-9]{2,8}",
        domain in "[a-z]{2,8}",
        suffix in "[a-z0-9]{1,6}",
    ) {
        let raw = format!("{service}-{machine}-{site}.{project}.{domain}");
        let with_suffix = format!("{raw}-{suffix}");
        let a = Hostname::parse(&raw).unwrap();
        let b = Hostname::parse(&with_suffix).unwrap();
        prop_assert_eq!(a.service, b.service);
        prop_assert_eq!(a.machine, b.machine);
        prop_assert_eq!(a.site, b.site);
        prop_assert_eq!(a.project, b.project);
        prop_assert_eq!(a.domain, b.domain);
        prop_assert_eq!(b.suffix, Some(suffix));
    }

    /// Any string whose top segment doesn't match `^[a-z]+-[a-z0-9]+-[a-z0-9]+$`
    /// must be rejected, never silently truncated or partially parsed.
    #[test]
    fn prop_hostname_rejects_malformed_top_segment(
        garbage in "[A-Z0-9_]{3,20}",
        rest in "[a-z]{2,8}\\.[a-z]{2,8}",
    ) {
        let raw = format!("{garbage}.{rest}");
        prop_assert!(Hostname::parse(&raw).is_err());
    }
}

// == Coordinate Properties ======================================================

proptest! {
    /// Every finite f64 constructs a `Coordinate` successfully and round-trips
    /// its value unchanged.
    #[test]
    fn prop_coordinate_accepts_all_finite_values(v in any::<f64>().prop_filter("finite", |v| v.is_finite())) {
        let coord = Coordinate::new(v).expect("finite value must construct");
        prop_assert_eq!(coord.get(), v);
    }
}

#[test]
fn coordinate_rejects_every_non_finite_sentinel() {
    for v in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
        assert!(Coordinate::new(v).is_err(), "{v} must be rejected");
    }
}

// == Rate limiter column hashing ================================================
//
// The hashing function itself is private to `ratelimit`; these properties
// exercise it indirectly through `RateLimiter::count`'s documented contract
// via the smaller, pure pieces that are public: determinism and width
// boundedness are covered directly in `src/ratelimit.rs`'s own unit tests
// (`column_is_deterministic_and_bounded_by_width`). Here we only check the
// one cross-module property that belongs at the integration boundary: two
// distinct hostnames almost never collide across all `depth` rows at once
// for a realistically sized sketch, which is what keeps the sketch useful.

proptest! {
    #[test]
    fn prop_hostnames_rarely_collide_across_all_rows(
        a in "[a-z]{4,10}-[a-z0-9]{2,6}-[a-z0-9]{2,6}",
        b in "[a-z]{4,10}-[a-z0-9]{2,6}-[a-z0-9]{2,6}",
    ) {
        prop_assume!(a != b);
        // Reconstruct the same FNV-1a-over-width scheme ratelimit.rs uses,
        // to check the distributional property without depending on a
        // Redis connection for this otherwise-pure computation.
        fn fnv1a(bytes: &[u8]) -> u64 {
            let mut hash: u64 = 0xcbf29ce484222325;
            for &b in bytes {
                hash ^= b as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            hash
        }
        fn column(item: &str, row: u32, width: u32) -> u32 {
            let mut bytes = item.as_bytes().to_vec();
            bytes.extend_from_slice(&row.to_le_bytes());
            (fnv1a(&bytes) % width as u64) as u32
        }

        let width = 2048u32;
        let depth = 4u32;
        let collisions = (0..depth)
            .filter(|&row| column(&a, row, width) == column(&b, row, width))
            .count();
        // A full-row collision across all 4 independent hashes for two
        // distinct hostnames would require an adversarial input; for
        // arbitrary distinct strings it should not happen.
        prop_assert!((collisions as u32) < depth);
    }
}
