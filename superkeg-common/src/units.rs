//! Volume unit conversions

/// US fluid ounces per liter
pub const OZ_PER_LITER: f64 = 33.814;

pub fn liters_to_ml(liters: f64) -> f64 {
    liters * 1000.0
}

/// Convert liters to US fluid ounces
pub fn liters_to_oz(liters: f64) -> f64 {
    liters * OZ_PER_LITER
}
