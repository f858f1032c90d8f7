//! Unit conversion for the pairs the Measurement Store normalizes across
//! (spec §4.5): °C↔°F, L↔gal, inch↔mm. All conversions are involutive to
//! within 1e-9 relative tolerance and preserve `None`.

const LITERS_PER_GALLON: f64 = 3.785411784;
const MM_PER_INCH: f64 = 25.4;

/// A unit recognized by the store's normalization layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Unit {
    Celsius,
    Fahrenheit,
    Liter,
    Gallon,
    Millimeter,
    Inch,
    /// Units that pass through unconverted (µS/cm, pH, ppt, ppm, mg/kg, %).
    Opaque,
}

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Celsius => "°C",
            Unit::Fahrenheit => "°F",
            Unit::Liter => "L",
            Unit::Gallon => "gal",
            Unit::Millimeter => "mm",
            Unit::Inch => "in",
            Unit::Opaque => "",
        }
    }
}

/// Convert `value` from `from` to `to`. Unsupported pairs (including any
/// pair touching `Unit::Opaque`) are returned unchanged — the store only
/// ever asks for conversions it knows are valid for a given trend.
pub fn convert(value: f64, from: Unit, to: Unit) -> f64 {
    use Unit::*;
    match (from, to) {
        (a, b) if a == b => value,
        (Celsius, Fahrenheit) => value * 9.0 / 5.0 + 32.0,
        (Fahrenheit, Celsius) => (value - 32.0) * 5.0 / 9.0,
        (Liter, Gallon) => value / LITERS_PER_GALLON,
        (Gallon, Liter) => value * LITERS_PER_GALLON,
        (Inch, Millimeter) => value * MM_PER_INCH,
        (Millimeter, Inch) => value / MM_PER_INCH,
        _ => value,
    }
}

/// `None`-preserving variant of [`convert`].
pub fn convert_opt(value: Option<f64>, from: Unit, to: Unit) -> Option<f64> {
    value.map(|v| convert(v, from, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        let rel = if b.abs() > 1e-12 { (a - b).abs() / b.abs() } else { (a - b).abs() };
        assert!(rel < 1e-9, "{a} != {b} (rel {rel})");
    }

    #[test]
    fn celsius_fahrenheit_round_trip() {
        for c in [-40.0, 0.0, 20.0, 37.5, 100.0] {
            let f = convert(c, Unit::Celsius, Unit::Fahrenheit);
            let back = convert(f, Unit::Fahrenheit, Unit::Celsius);
            assert_close(back, c);
        }
    }

    #[test]
    fn liter_gallon_round_trip() {
        for l in [0.0, 1.0, 3.785411784, 100.0] {
            let g = convert(l, Unit::Liter, Unit::Gallon);
            let back = convert(g, Unit::Gallon, Unit::Liter);
            assert_close(back, l);
        }
    }

    #[test]
    fn inch_mm_round_trip() {
        for i in [0.0, 0.02, 1.0, 12.0] {
            let mm = convert(i, Unit::Inch, Unit::Millimeter);
            let back = convert(mm, Unit::Millimeter, Unit::Inch);
            assert_close(back, i);
        }
    }

    #[test]
    fn known_constants() {
        assert_close(convert(1.0, Unit::Gallon, Unit::Liter), LITERS_PER_GALLON);
        assert_close(convert(1.0, Unit::Inch, Unit::Millimeter), MM_PER_INCH);
        assert_close(convert(0.0, Unit::Celsius, Unit::Fahrenheit), 32.0);
        assert_close(convert(100.0, Unit::Celsius, Unit::Fahrenheit), 212.0);
    }

    #[test]
    fn opaque_passthrough() {
        assert_close(convert(42.0, Unit::Opaque, Unit::Opaque), 42.0);
    }

    #[test]
    fn none_preserving() {
        assert_eq!(convert_opt(None, Unit::Celsius, Unit::Fahrenheit), None);
        assert_eq!(
            convert_opt(Some(0.0), Unit::Celsius, Unit::Fahrenheit),
            Some(32.0)
        );
    }
}
