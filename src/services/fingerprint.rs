//! Request validation and cache fingerprinting
//!
//! Domain-only checks - no I/O. The fingerprint is the edge cache key: two
//! requests collide only when they are semantically equivalent at the
//! configured coordinate precision.

use crate::errors::ServiceError;
use crate::types::{GeocodeQuery, Method};

/// Check conditions we know the downstream services would fail on. Pure and
/// order-independent: the verdict depends only on the request, never on which
/// check runs first.
pub fn validate(query: &GeocodeQuery) -> Result<(), ServiceError> {
    let has_address = query
        .address_query
        .as_deref()
        .is_some_and(|s| !s.trim().is_empty());
    let has_point = query.point_query.is_some();

    if has_address && has_point {
        return Err(ServiceError::MixedArguments);
    }
    match query.method {
        Method::FwdFuzzy if !has_address => return Err(ServiceError::InvalidForwardRequest),
        Method::RevNearest if !has_point => return Err(ServiceError::InvalidReverseRequest),
        _ => {}
    }
    if !(1..=1024).contains(&query.max_results) {
        return Err(ServiceError::MaxResultsOutOfRange);
    }
    Ok(())
}

/// Deterministic cache key:
/// `method:max_results:round(lat*P):round(lng*P):address`. `precision` is the
/// quantization factor `P`; at the default 1e6, coordinates agree to six
/// decimal digits.
pub fn fingerprint(query: &GeocodeQuery, precision: u32) -> String {
    let pt = query.point_query.unwrap_or_default();
    let p = f64::from(precision);
    format!(
        "{}:{}:{}:{}:{}",
        query.method,
        query.max_results,
        (f64::from(pt.lat) * p).round() as i64,
        (f64::from(pt.lng) * p).round() as i64,
        query.address_query.as_deref().unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::DEFAULT_COORD_PRECISION;
    use crate::types::Point;

    #[test]
    fn fingerprint_is_deterministic_and_method_scoped() {
        let fwd = GeocodeQuery::forward("451A WINTHROP ST", 5);
        assert_eq!(
            fingerprint(&fwd, DEFAULT_COORD_PRECISION),
            fingerprint(&fwd, DEFAULT_COORD_PRECISION)
        );
        assert_eq!(
            fingerprint(&fwd, DEFAULT_COORD_PRECISION),
            "FWD_FUZZY:5:0:0:451A WINTHROP ST"
        );

        let rev = GeocodeQuery::reverse(Point::new(40.5, -73.25), 1);
        assert_eq!(
            fingerprint(&rev, DEFAULT_COORD_PRECISION),
            "REV_NEAREST:1:40500000:-73250000:"
        );
    }

    #[test]
    fn fingerprint_varies_with_each_input() {
        let base = GeocodeQuery::forward("451A WINTHROP ST", 5);
        let other_addr = GeocodeQuery::forward("452 WINTHROP ST", 5);
        let other_limit = GeocodeQuery::forward("451A WINTHROP ST", 6);

        let fp = fingerprint(&base, DEFAULT_COORD_PRECISION);
        assert_ne!(fp, fingerprint(&other_addr, DEFAULT_COORD_PRECISION));
        assert_ne!(fp, fingerprint(&other_limit, DEFAULT_COORD_PRECISION));
    }

    #[test]
    fn fingerprint_agrees_below_quantization_precision() {
        let a = GeocodeQuery::reverse(Point::new(40.6810301, -73.9489002), 1);
        let b = GeocodeQuery::reverse(Point::new(40.6810303, -73.9489004), 1);
        assert_eq!(
            fingerprint(&a, DEFAULT_COORD_PRECISION),
            fingerprint(&b, DEFAULT_COORD_PRECISION)
        );
    }

    #[test]
    fn fingerprint_separates_coordinates_above_precision() {
        let a = GeocodeQuery::reverse(Point::new(40.681030, -73.948900), 1);
        let b = GeocodeQuery::reverse(Point::new(40.681050, -73.948900), 1);
        assert_ne!(
            fingerprint(&a, DEFAULT_COORD_PRECISION),
            fingerprint(&b, DEFAULT_COORD_PRECISION)
        );
    }

    #[test]
    fn validate_accepts_well_formed_requests() {
        assert!(validate(&GeocodeQuery::forward("451A WINTHROP", 5)).is_ok());
        assert!(validate(&GeocodeQuery::reverse(Point::new(40.0, -73.0), 1)).is_ok());
    }

    #[test]
    fn validate_rejects_missing_variant_field() {
        let mut fwd = GeocodeQuery::forward("  ", 5);
        assert!(matches!(
            validate(&fwd),
            Err(ServiceError::InvalidForwardRequest)
        ));
        fwd.address_query = None;
        assert!(matches!(
            validate(&fwd),
            Err(ServiceError::InvalidForwardRequest)
        ));

        let rev = GeocodeQuery {
            method: Method::RevNearest,
            max_results: 1,
            address_query: None,
            point_query: None,
        };
        assert!(matches!(
            validate(&rev),
            Err(ServiceError::InvalidReverseRequest)
        ));
    }

    #[test]
    fn validate_rejects_mixed_arguments() {
        let mixed = GeocodeQuery {
            method: Method::FwdFuzzy,
            max_results: 5,
            address_query: Some("451A WINTHROP".into()),
            point_query: Some(Point::new(40.0, -73.0)),
        };
        assert!(matches!(validate(&mixed), Err(ServiceError::MixedArguments)));
    }

    #[test]
    fn validate_bounds_max_results() {
        let mut query = GeocodeQuery::forward("451A WINTHROP", 0);
        assert!(matches!(
            validate(&query),
            Err(ServiceError::MaxResultsOutOfRange)
        ));
        query.max_results = 1025;
        assert!(matches!(
            validate(&query),
            Err(ServiceError::MaxResultsOutOfRange)
        ));
        query.max_results = 1024;
        assert!(validate(&query).is_ok());
    }
}
