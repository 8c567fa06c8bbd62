//! Base-32 geohash encoding.
//!
//! Bits alternate between longitude and latitude, starting with longitude;
//! every five bits select one character of the geohash alphabet.

use crate::snapshot::GpsCoords;

/// Longest geohash this encoder produces (about 37 mm x 19 mm cells).
pub const MAX_PRECISION: usize = 12;

const ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Encode `coords` as a geohash of `precision` characters.
///
/// Returns an empty string when `precision` is zero or the coordinates are
/// not finite or out of range. Precision above [`MAX_PRECISION`] is clamped.
pub fn encode(coords: GpsCoords, precision: usize) -> String {
    let precision = precision.min(MAX_PRECISION);
    if precision == 0 || !in_range(coords) {
        return String::new();
    }

    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut even_bit = true;
    let mut bit = 0_u8;
    let mut index = 0_usize;

    while hash.len() < precision {
        let (range, value) = if even_bit {
            (&mut lon_range, coords.lon)
        } else {
            (&mut lat_range, coords.lat)
        };
        let mid = f64::midpoint(range.0, range.1);
        index <<= 1;
        if value >= mid {
            index |= 1;
            range.0 = mid;
        } else {
            range.1 = mid;
        }
        even_bit = !even_bit;

        bit = bit.saturating_add(1);
        if bit == 5 {
            if let Some(&ch) = ALPHABET.get(index) {
                hash.push(char::from(ch));
            }
            bit = 0;
            index = 0;
        }
    }

    hash
}

fn in_range(coords: GpsCoords) -> bool {
    coords.lat.is_finite()
        && coords.lon.is_finite()
        && (-90.0..=90.0).contains(&coords.lat)
        && (-180.0..=180.0).contains(&coords.lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_reference_points() {
        assert_eq!(encode(GpsCoords::new(57.64911, 10.40744), 11), "u4pruydqqvj");
        assert_eq!(encode(GpsCoords::new(42.6, -5.6), 5), "ezs42");
    }

    #[test]
    fn prefix_property_holds() {
        let coords = GpsCoords::new(59.33, 18.06);
        let long = encode(coords, 9);
        let short = encode(coords, 4);
        assert!(long.starts_with(&short));
        assert_eq!(long.len(), 9);
    }

    #[test]
    fn zero_precision_is_empty() {
        assert!(encode(GpsCoords::new(59.33, 18.06), 0).is_empty());
    }

    #[test]
    fn invalid_coordinates_are_empty() {
        assert!(encode(GpsCoords::new(f64::NAN, 0.0), 6).is_empty());
        assert!(encode(GpsCoords::new(91.0, 0.0), 6).is_empty());
        assert!(encode(GpsCoords::new(0.0, -181.0), 6).is_empty());
    }

    #[test]
    fn precision_is_clamped() {
        assert_eq!(encode(GpsCoords::new(10.0, 10.0), 40).len(), MAX_PRECISION);
    }
}
